//! Session link — fire-and-forget delivery of state messages.
//!
//! DESIGN
//! ======
//! The core only ever needs "send this to everybody else". Clients hold a
//! `ChannelLink` whose single queue leads to the relay; the relay holds a
//! `Hub` with one outbound queue per connected endpoint and fans messages
//! out from there.
//!
//! ERROR HANDLING
//! ==============
//! Sends never block and never fail upward. A full or closed queue drops the
//! message with a warning; convergence relies on every push being a full
//! snapshot, so a lost message only delays peers.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::message::{EndpointId, StateMessage};

pub trait SessionLink {
    /// Deliver to every other participant of the session.
    fn send_to_other_clients(&mut self, msg: &StateMessage);
}

impl<L: SessionLink + ?Sized> SessionLink for Box<L> {
    fn send_to_other_clients(&mut self, msg: &StateMessage) {
        (**self).send_to_other_clients(msg);
    }
}

fn try_deliver(tx: &mpsc::Sender<StateMessage>, msg: &StateMessage, endpoint: Option<EndpointId>) -> bool {
    match tx.try_send(msg.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(?endpoint, kind = ?msg.kind(), target_id = msg.target_id(), "outbound queue full; dropping message");
            false
        }
        Err(TrySendError::Closed(_)) => {
            warn!(?endpoint, kind = ?msg.kind(), target_id = msg.target_id(), "outbound queue closed; dropping message");
            false
        }
    }
}

// =============================================================================
// CLIENT
// =============================================================================

/// Client-side link: one queue towards the relay.
#[derive(Debug)]
pub struct ChannelLink {
    tx: mpsc::Sender<StateMessage>,
}

impl ChannelLink {
    #[must_use]
    pub fn new(tx: mpsc::Sender<StateMessage>) -> Self {
        Self { tx }
    }
}

impl SessionLink for ChannelLink {
    fn send_to_other_clients(&mut self, msg: &StateMessage) {
        try_deliver(&self.tx, msg, None);
    }
}

// =============================================================================
// RELAY
// =============================================================================

/// Relay-side fan-out over every attached endpoint.
#[derive(Default)]
pub struct Hub {
    peers: BTreeMap<EndpointId, mpsc::Sender<StateMessage>>,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, endpoint: EndpointId, tx: mpsc::Sender<StateMessage>) {
        self.peers.insert(endpoint, tx);
    }

    /// Returns whether the endpoint was attached.
    pub fn detach(&mut self, endpoint: EndpointId) -> bool {
        self.peers.remove(&endpoint).is_some()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Send to one endpoint only.
    pub fn send_to(&self, endpoint: EndpointId, msg: &StateMessage) -> bool {
        self.peers
            .get(&endpoint)
            .is_some_and(|tx| try_deliver(tx, msg, Some(endpoint)))
    }

    /// Forward a message from `origin` to every other endpoint.
    pub fn relay_from(&self, origin: EndpointId, msg: &StateMessage) -> usize {
        self.peers
            .iter()
            .filter(|(id, _)| **id != origin)
            .filter(|(id, tx)| try_deliver(tx, msg, Some(**id)))
            .count()
    }
}

impl SessionLink for Hub {
    /// The relay itself is not an endpoint, so "others" is everyone.
    fn send_to_other_clients(&mut self, msg: &StateMessage) {
        for (id, tx) in &self.peers {
            try_deliver(tx, msg, Some(*id));
        }
    }
}
