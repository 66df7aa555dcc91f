//! Collaboration manager — endpoint table, master election, dispatch by kind.
//!
//! DESIGN
//! ======
//! The same manager runs on both sides of the relay:
//!
//! - On the relay it is authoritative. `connect` / `disconnect` come from
//!   websocket lifecycle, and every table change broadcasts a full
//!   membership snapshot to all endpoints.
//! - On a client it is a replica. Snapshots from the relay are applied with
//!   `apply_user_list`; local renames and promotions update the replica and
//!   send the new snapshot as a proposal, which the relay validates with
//!   `merge_proposal` and re-broadcasts.
//!
//! MASTER
//! ======
//! Exactly one endpoint is master while the table is non-empty. The first
//! endpoint to connect becomes master; when the master leaves, the lowest
//! remaining id takes over. Only the master may hand the role on.
//!
//! Notifications go out on an `EventBus<CollabEvent>`. Handlers never touch
//! the proxy tree or the views: `dispatch` returns a [`Routed`] value and the
//! session layer acts on it.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::link::SessionLink;
use crate::message::{self, EndpointId, ErrorCode, MessageKind, ProxyId, StateMessage, Variant, ViewId};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    /// New master, or `None` once the last endpoint left.
    MasterChanged(Option<EndpointId>),
    UserListChanged,
    UserNameChanged { endpoint: EndpointId, name: String },
    ChatMessage { sender: EndpointId, text: String },
    InspectorTabChanged(u32),
    FollowCamera(EndpointId),
    ProxyStateInvalid(ProxyId),
    /// Message with no dedicated handler. Delivered as-is.
    StateOnlyMessage(StateMessage),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CollabError {
    #[error("endpoint {caller} is not master")]
    NotAuthorized { caller: EndpointId },
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(EndpointId),
    #[error("malformed membership snapshot: {0}")]
    MalformedMembership(&'static str),
    #[error("no local endpoint assigned yet")]
    Detached,
}

impl ErrorCode for CollabError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotAuthorized { .. } => "E_NOT_AUTHORIZED",
            Self::UnknownEndpoint(_) => "E_UNKNOWN_ENDPOINT",
            Self::MalformedMembership(_) => "E_MALFORMED_MEMBERSHIP",
            Self::Detached => "E_DETACHED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Detached)
    }
}

/// What the dispatch layer still has to do with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Handled,
    /// Queue a coalesced render of the view.
    Render(ViewId),
    /// Apply the carried state to the proxy tree.
    ApplyState(StateMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    pub id: EndpointId,
    pub name: String,
    pub is_master: bool,
}

/// Parsed membership snapshot.
struct Membership {
    names: BTreeMap<EndpointId, String>,
    master: Option<EndpointId>,
}

pub struct CollaborationManager<L> {
    link: L,
    local: Option<EndpointId>,
    endpoints: BTreeMap<EndpointId, String>,
    master: Option<EndpointId>,
    events: EventBus<CollabEvent>,
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

impl<L: SessionLink> CollaborationManager<L> {
    pub fn new(link: L) -> Self {
        Self { link, local: None, endpoints: BTreeMap::new(), master: None, events: EventBus::new() }
    }

    pub fn subscribe(&mut self) -> tokio::sync::mpsc::UnboundedReceiver<CollabEvent> {
        self.events.subscribe()
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    #[must_use]
    pub fn local_endpoint(&self) -> Option<EndpointId> {
        self.local
    }

    pub fn set_local_endpoint(&mut self, endpoint: EndpointId) {
        info!(endpoint, "collab: local endpoint assigned");
        self.local = Some(endpoint);
    }

    #[must_use]
    pub fn master(&self) -> Option<EndpointId> {
        self.master
    }

    /// Register an endpoint. Returns `false` if it was already registered.
    pub fn connect(&mut self, endpoint: EndpointId, name: &str) -> bool {
        if self.endpoints.contains_key(&endpoint) {
            debug!(endpoint, "collab: duplicate connect ignored");
            return false;
        }
        self.endpoints.insert(endpoint, name.to_owned());
        info!(endpoint, name, "collab: endpoint connected");
        if self.master.is_none() {
            self.set_master(Some(endpoint));
        }
        self.events.publish(CollabEvent::UserListChanged);
        self.broadcast_membership();
        true
    }

    /// Remove an endpoint, re-electing the lowest remaining id if it was
    /// master.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEndpoint` if the endpoint is not registered.
    pub fn disconnect(&mut self, endpoint: EndpointId) -> Result<(), CollabError> {
        if self.endpoints.remove(&endpoint).is_none() {
            return Err(CollabError::UnknownEndpoint(endpoint));
        }
        info!(endpoint, "collab: endpoint disconnected");
        if self.master == Some(endpoint) {
            let next = self.endpoints.keys().next().copied();
            self.set_master(next);
        }
        self.events.publish(CollabEvent::UserListChanged);
        self.broadcast_membership();
        Ok(())
    }

    /// Hand the master role to `target`.
    ///
    /// # Errors
    ///
    /// Returns `NotAuthorized` unless `caller` is the current master (checked
    /// first), then `UnknownEndpoint` if `target` is not registered.
    pub fn promote_to_master(&mut self, caller: EndpointId, target: EndpointId) -> Result<(), CollabError> {
        if self.master != Some(caller) {
            warn!(caller, target, "collab: promotion refused, caller is not master");
            return Err(CollabError::NotAuthorized { caller });
        }
        if !self.endpoints.contains_key(&target) {
            return Err(CollabError::UnknownEndpoint(target));
        }
        if self.master == Some(target) {
            return Ok(());
        }
        self.set_master(Some(target));
        self.broadcast_membership();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `UnknownEndpoint` if the endpoint is not registered.
    pub fn is_master(&self, endpoint: EndpointId) -> Result<bool, CollabError> {
        if !self.endpoints.contains_key(&endpoint) {
            return Err(CollabError::UnknownEndpoint(endpoint));
        }
        Ok(self.master == Some(endpoint))
    }

    /// Capability gate for state-mutating operations.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEndpoint` for unregistered endpoints and
    /// `NotAuthorized` when the endpoint is not master.
    pub fn require_master(&self, endpoint: EndpointId) -> Result<(), CollabError> {
        if self.is_master(endpoint)? {
            Ok(())
        } else {
            Err(CollabError::NotAuthorized { caller: endpoint })
        }
    }

    #[must_use]
    pub fn local_is_master(&self) -> bool {
        self.local.is_some() && self.master == self.local
    }

    #[must_use]
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        self.endpoints
            .iter()
            .map(|(id, name)| EndpointInfo { id: *id, name: name.clone(), is_master: self.master == Some(*id) })
            .collect()
    }

    #[must_use]
    pub fn user_name(&self, endpoint: EndpointId) -> Option<&str> {
        self.endpoints.get(&endpoint).map(String::as_str)
    }

    fn set_master(&mut self, master: Option<EndpointId>) {
        if self.master == master {
            return;
        }
        info!(previous = ?self.master, master = ?master, "collab: master changed");
        self.master = master;
        self.events.publish(CollabEvent::MasterChanged(master));
    }

    fn broadcast_membership(&mut self) {
        let msg = self.membership_message();
        self.link.send_to_other_clients(&msg);
    }
}

// =============================================================================
// USER ACTIONS
// =============================================================================

impl<L: SessionLink> CollaborationManager<L> {
    /// # Errors
    ///
    /// Returns `UnknownEndpoint` if the endpoint is not registered.
    pub fn set_user_name(&mut self, endpoint: EndpointId, name: &str) -> Result<(), CollabError> {
        let current = self.endpoints.get_mut(&endpoint).ok_or(CollabError::UnknownEndpoint(endpoint))?;
        if current == name {
            return Ok(());
        }
        name.clone_into(current);
        self.events.publish(CollabEvent::UserNameChanged { endpoint, name: name.to_owned() });
        self.broadcast_membership();
        Ok(())
    }

    /// Notify locally and broadcast a chat line from the local endpoint.
    ///
    /// # Errors
    ///
    /// Returns `Detached` before the relay assigned a local endpoint.
    pub fn send_chat(&mut self, text: &str) -> Result<(), CollabError> {
        let sender = self.local.ok_or(CollabError::Detached)?;
        self.events.publish(CollabEvent::ChatMessage { sender, text: text.to_owned() });
        self.link.send_to_other_clients(&message::chat(sender, text));
        Ok(())
    }

    pub fn select_inspector_tab(&mut self, index: u32) {
        self.link.send_to_other_clients(&message::inspector_tab(index));
    }

    /// Ask every peer to follow `endpoint`'s camera.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEndpoint` if the endpoint is not registered.
    pub fn follow_camera(&mut self, endpoint: EndpointId) -> Result<(), CollabError> {
        if !self.endpoints.contains_key(&endpoint) {
            return Err(CollabError::UnknownEndpoint(endpoint));
        }
        self.link.send_to_other_clients(&message::follow_camera(endpoint));
        Ok(())
    }
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

impl<L: SessionLink> CollaborationManager<L> {
    /// Full snapshot of the endpoint table.
    #[must_use]
    pub fn membership_message(&self) -> StateMessage {
        let users = self
            .endpoints
            .iter()
            .flat_map(|(id, name)| [Variant::Integer(i64::from(*id)), Variant::Text(name.clone())])
            .collect();
        let master = self.master.map(|m| Variant::Integer(i64::from(m))).into_iter().collect();
        StateMessage::new(MessageKind::Other, 0)
            .with_field(message::USER_LIST, users)
            .with_field(message::MASTER, master)
    }

    /// Replace the replica with a snapshot from the relay.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMembership` if the snapshot cannot be parsed; the
    /// replica is left unchanged.
    pub fn apply_user_list(&mut self, msg: &StateMessage) -> Result<(), CollabError> {
        let Membership { names, master } = parse_membership(msg)?;

        for (id, name) in &names {
            if self.endpoints.get(id).is_some_and(|old| old != name) {
                self.events.publish(CollabEvent::UserNameChanged { endpoint: *id, name: name.clone() });
            }
        }
        let table_changed = !self.endpoints.keys().eq(names.keys());
        self.endpoints = names;
        self.set_master(master);
        if table_changed {
            self.events.publish(CollabEvent::UserListChanged);
        }
        debug!(endpoints = self.endpoints.len(), master = ?self.master, "collab: membership applied");
        Ok(())
    }

    /// Validate a client-proposed snapshot on the relay. A master change is
    /// applied as a promotion by `sender`; only the sender's own name may
    /// change. Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// `MalformedMembership`, `UnknownEndpoint` for an unregistered sender or
    /// target, and `NotAuthorized` when a non-master proposes a new master.
    /// Nothing is applied on error.
    pub fn merge_proposal(&mut self, sender: EndpointId, msg: &StateMessage) -> Result<bool, CollabError> {
        let proposal = parse_membership(msg)?;
        if !self.endpoints.contains_key(&sender) {
            return Err(CollabError::UnknownEndpoint(sender));
        }
        let promote = match proposal.master {
            Some(target) if self.master != Some(target) => {
                if self.master != Some(sender) {
                    warn!(sender, target, "collab: proposal changes master without authority");
                    return Err(CollabError::NotAuthorized { caller: sender });
                }
                if !self.endpoints.contains_key(&target) {
                    return Err(CollabError::UnknownEndpoint(target));
                }
                Some(target)
            }
            _ => None,
        };

        let mut changed = false;
        if let Some(name) = proposal.names.get(&sender) {
            if self.endpoints.get(&sender) != Some(name) {
                self.set_user_name(sender, name)?;
                changed = true;
            }
        }
        if let Some(target) = promote {
            self.promote_to_master(sender, target)?;
            changed = true;
        }
        Ok(changed)
    }
}

fn parse_membership(msg: &StateMessage) -> Result<Membership, CollabError> {
    let users = msg.field(message::USER_LIST).ok_or(CollabError::MalformedMembership("missing user list"))?;
    if users.values.len() % 2 != 0 {
        return Err(CollabError::MalformedMembership("user list has odd length"));
    }
    let mut names = BTreeMap::new();
    for pair in users.values.chunks_exact(2) {
        let id = message::endpoint_value(&pair[0]).ok_or(CollabError::MalformedMembership("bad endpoint id"))?;
        let name = pair[1].as_text().ok_or(CollabError::MalformedMembership("bad endpoint name"))?;
        if names.insert(id, name.to_owned()).is_some() {
            return Err(CollabError::MalformedMembership("duplicate endpoint id"));
        }
    }
    let master = match msg.value(message::MASTER) {
        None => None,
        Some(value) => {
            Some(message::endpoint_value(value).ok_or(CollabError::MalformedMembership("bad master id"))?)
        }
    };
    if master.is_some_and(|m| !names.contains_key(&m)) {
        return Err(CollabError::MalformedMembership("master is not a member"));
    }
    if master.is_none() && !names.is_empty() {
        return Err(CollabError::MalformedMembership("non-empty table without master"));
    }
    Ok(Membership { names, master })
}

// =============================================================================
// DISPATCH
// =============================================================================

impl<L: SessionLink> CollaborationManager<L> {
    /// Route an inbound message by kind.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMembership` for an unparsable membership snapshot.
    pub fn dispatch(&mut self, msg: StateMessage) -> Result<Routed, CollabError> {
        match msg.kind() {
            MessageKind::Render => return Ok(Routed::Render(msg.target_id())),
            MessageKind::UserData => return Ok(Routed::ApplyState(msg)),
            MessageKind::Chat => self.on_chat(msg),
            MessageKind::InspectorTab => self.events.publish(CollabEvent::InspectorTabChanged(msg.target_id())),
            MessageKind::ProxyStateInvalid => self.events.publish(CollabEvent::ProxyStateInvalid(msg.target_id())),
            MessageKind::Other => self.on_other(msg)?,
            MessageKind::Unknown(kind) => {
                debug!(kind, "collab: unknown message kind");
                self.events.publish(CollabEvent::StateOnlyMessage(msg));
            }
        }
        Ok(Routed::Handled)
    }

    fn on_chat(&mut self, msg: StateMessage) {
        let sender = msg.value(message::CHAT_AUTHOR).and_then(message::endpoint_value);
        let text = msg.value(message::CHAT_TEXT).and_then(Variant::as_text);
        match (sender, text) {
            (Some(sender), Some(text)) => {
                let text = text.to_owned();
                self.events.publish(CollabEvent::ChatMessage { sender, text });
            }
            _ => self.events.publish(CollabEvent::StateOnlyMessage(msg)),
        }
    }

    fn on_other(&mut self, msg: StateMessage) -> Result<(), CollabError> {
        if msg.has_field(message::USER_LIST) {
            return self.apply_user_list(&msg);
        }
        if let Some(id) = msg.value(message::WELCOME).and_then(message::endpoint_value) {
            self.set_local_endpoint(id);
            return Ok(());
        }
        if let Some(id) = msg.value(message::FOLLOW_CAMERA).and_then(message::endpoint_value) {
            self.events.publish(CollabEvent::FollowCamera(id));
            return Ok(());
        }
        self.events.publish(CollabEvent::StateOnlyMessage(msg));
        Ok(())
    }
}

#[cfg(test)]
#[path = "collaboration_test.rs"]
mod tests;
