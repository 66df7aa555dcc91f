//! In-situ link bridge — couples a running simulation to the viewer.
//!
//! DESIGN
//! ======
//! Two proxy trees are involved. The in-situ tree mirrors the simulation's
//! own pipeline and is reloaded wholesale on every CONNECTED. The viewer
//! tree holds the extract producers: one trivial producer proxy per
//! registered `(group, name, port)` extract.
//!
//! The bridge owns a `ReplicationPolicy` for the in-situ tree. Local edits
//! to that tree mark it dirty; the next timestep (or an explicit flush)
//! sends the whole in-situ document back to the simulation.
//!
//! STATES
//! ======
//! `Disconnected → Connected → Paused ⇄ Running → Disconnected`.
//! Extract registrations, the id map and the pause flag survive a
//! disconnect. The next connect replaces the id map and the data-information
//! cache, never merges them, and re-applies a pending pause to the new
//! simulation.
//!
//! LIVE CHANGED
//! ============
//! While the simulation is paused it only polls for changes once per
//! `live_changed` call. The bridge sends it at most once per pause episode:
//! a latch is set on send and cleared by every inbound coupling event and
//! by every new pause.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use frames::DataSummary;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::idmap::{IdMap, IdMapError, IdPairOrder};
use crate::message::{self, ErrorCode, MessageKind, ProxyId, StateMessage, Variant};
use crate::proxy::{MutationObserver, ProxyTree};
use crate::replication::{ReplicationError, ReplicationPolicy};
use crate::scene::{SceneDocument, SceneError};

const ACTION_CONNECTED: i64 = 1;
const ACTION_NEXT_TIMESTEP: i64 = 2;
const ACTION_DISCONNECTED: i64 = 3;

/// Group and name of the producer proxy created for each extract.
const EXTRACT_GROUP: &str = "sources";
const EXTRACT_PRODUCER: &str = "PVTrivialProducer";

const LINK_PROXY_NAME: &str = "LiveInsituLink";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum InsituError {
    #[error("malformed coupled state: {0}")]
    MalformedCoupledState(#[source] SceneError),
    #[error("malformed coupling event: {0}")]
    MalformedEvent(&'static str),
    #[error("simulation is not connected")]
    NotConnected,
    #[error("extract already registered: {0}")]
    ExtractExists(ExtractKey),
    #[error("unknown object: {0}")]
    UnknownObject(ProxyId),
    #[error("invalid id mapping: {0}")]
    InvalidIdMapping(#[source] IdMapError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

impl ErrorCode for InsituError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedCoupledState(_) => "E_MALFORMED_COUPLED_STATE",
            Self::MalformedEvent(_) => "E_MALFORMED_COUPLING_EVENT",
            Self::NotConnected => "E_NOT_CONNECTED",
            Self::ExtractExists(_) => "E_EXTRACT_EXISTS",
            Self::UnknownObject(_) => "E_UNKNOWN_OBJECT",
            Self::InvalidIdMapping(_) => "E_INVALID_ID_MAPPING",
            Self::Replication(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::NotConnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
    Paused,
    Running,
}

impl LinkState {
    #[must_use]
    pub fn is_connected(self) -> bool {
        self != Self::Disconnected
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtractKey {
    pub group: String,
    pub name: String,
    pub port: u32,
}

impl ExtractKey {
    #[must_use]
    pub fn new(group: &str, name: &str, port: u32) -> Self {
        Self { group: group.to_owned(), name: name.to_owned(), port }
    }
}

impl fmt::Display for ExtractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.name, self.port)
    }
}

/// One data-information record from the simulation: producer id in the
/// simulation's id space, output port, encoded [`DataSummary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataInformationEntry {
    pub proxy: ProxyId,
    pub port: u32,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsituEvent {
    /// Carries the simulation's scene document.
    Connected(String),
    NextTimestepAvailable,
    Disconnected,
    UpdateDataInformation(Vec<DataInformationEntry>),
    /// Flat alternating id pairs.
    IdMapping(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectionCreated,
    ConnectionClosed,
    Updated,
    /// Viewer-space ids whose data information was refreshed.
    DataInformationUpdated(Vec<ProxyId>),
}

/// Calls from the viewer into the simulation side.
pub trait SimulationLink {
    /// Replace the simulation's in-situ pipeline with `document`.
    fn update_insitu_state(&mut self, document: &str);
    fn live_changed(&mut self);
    fn register_extract(&mut self, key: &ExtractKey, proxy: ProxyId);
    fn unregister_extract(&mut self, key: &ExtractKey, proxy: ProxyId);
    fn set_simulation_paused(&mut self, paused: bool);
}

/// Simulation side of a viewer that has no simulation attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSimulation;

impl SimulationLink for NoSimulation {
    fn update_insitu_state(&mut self, _document: &str) {}
    fn live_changed(&mut self) {}
    fn register_extract(&mut self, _key: &ExtractKey, _proxy: ProxyId) {}
    fn unregister_extract(&mut self, _key: &ExtractKey, _proxy: ProxyId) {}
    fn set_simulation_paused(&mut self, _paused: bool) {}
}

/// Everything a coupling transition may touch.
pub struct CouplingContext<'a> {
    pub insitu: &'a mut dyn ProxyTree,
    pub viewer: &'a mut dyn ProxyTree,
    pub simulation: &'a mut dyn SimulationLink,
}

// =============================================================================
// WIRE
// =============================================================================

impl InsituEvent {
    /// Parse every coupling field of a message, in field order.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEvent` for messages outside the coupling group and
    /// for fields whose values do not have the expected shape.
    pub fn from_message(msg: &StateMessage) -> Result<Vec<Self>, InsituError> {
        if !message::is_coupling(msg) {
            return Err(InsituError::MalformedEvent("not a coupling message"));
        }
        let mut events = Vec::new();
        for field in msg.fields() {
            let values = field.values.as_slice();
            match field.key.as_str() {
                message::LIVE_ACTION => events.push(parse_live_action(values)?),
                message::UPDATE_DATA_INFORMATION => {
                    events.push(Self::UpdateDataInformation(parse_data_information(values)?));
                }
                message::ID_MAPPING => {
                    let ids = values
                        .iter()
                        .map(Variant::as_id)
                        .collect::<Option<Vec<_>>>()
                        .ok_or(InsituError::MalformedEvent("id mapping holds a non-id value"))?;
                    events.push(Self::IdMapping(ids));
                }
                _ => {}
            }
        }
        Ok(events)
    }

    /// Encode as a coupling message, the way the simulation side sends it.
    #[must_use]
    pub fn to_message(&self) -> StateMessage {
        let msg = StateMessage::new(MessageKind::UserData, 0)
            .with_value(message::PROXY_GROUP, Variant::Text(message::COUPLING_GROUP.to_owned()))
            .with_value(message::PROXY_NAME, Variant::Text(LINK_PROXY_NAME.to_owned()));
        match self {
            Self::Connected(state) => msg.with_field(
                message::LIVE_ACTION,
                vec![Variant::Integer(ACTION_CONNECTED), Variant::Text(state.clone())],
            ),
            Self::NextTimestepAvailable => msg.with_value(message::LIVE_ACTION, Variant::Integer(ACTION_NEXT_TIMESTEP)),
            Self::Disconnected => msg.with_value(message::LIVE_ACTION, Variant::Integer(ACTION_DISCONNECTED)),
            Self::UpdateDataInformation(entries) => {
                let values = entries
                    .iter()
                    .flat_map(|e| {
                        [Variant::ProxyId(e.proxy), Variant::Integer(i64::from(e.port)), Variant::Binary(e.blob.clone())]
                    })
                    .collect();
                msg.with_field(message::UPDATE_DATA_INFORMATION, values)
            }
            Self::IdMapping(ids) => msg.with_field(message::ID_MAPPING, ids.iter().copied().map(Variant::Id).collect()),
        }
    }
}

fn parse_live_action(values: &[Variant]) -> Result<InsituEvent, InsituError> {
    let action = values
        .first()
        .and_then(Variant::as_integer)
        .ok_or(InsituError::MalformedEvent("live action without code"))?;
    match action {
        ACTION_CONNECTED => {
            let state = values
                .get(1)
                .and_then(Variant::as_text)
                .ok_or(InsituError::MalformedEvent("connected without state"))?;
            Ok(InsituEvent::Connected(state.to_owned()))
        }
        ACTION_NEXT_TIMESTEP => Ok(InsituEvent::NextTimestepAvailable),
        ACTION_DISCONNECTED => Ok(InsituEvent::Disconnected),
        _ => Err(InsituError::MalformedEvent("unknown live action")),
    }
}

fn parse_data_information(values: &[Variant]) -> Result<Vec<DataInformationEntry>, InsituError> {
    if values.len() % 3 != 0 {
        return Err(InsituError::MalformedEvent("data information is not (proxy, port, blob) triples"));
    }
    values
        .chunks_exact(3)
        .map(|triple| {
            let proxy = triple[0]
                .as_id()
                .and_then(|id| ProxyId::try_from(id).ok())
                .ok_or(InsituError::MalformedEvent("bad data information proxy id"))?;
            let port = triple[1]
                .as_integer()
                .and_then(|p| u32::try_from(p).ok())
                .ok_or(InsituError::MalformedEvent("bad data information port"))?;
            let blob = triple[2]
                .as_binary()
                .ok_or(InsituError::MalformedEvent("data information without payload"))?
                .to_vec();
            Ok(DataInformationEntry { proxy, port, blob })
        })
        .collect()
}

// =============================================================================
// BRIDGE
// =============================================================================

pub struct InsituLinkBridge {
    state: LinkState,
    id_order: IdPairOrder,
    id_map: IdMap,
    extracts: BTreeMap<ExtractKey, ProxyId>,
    data_info: BTreeMap<(ProxyId, u32), DataSummary>,
    paused: bool,
    live_changed_sent: bool,
    replication: ReplicationPolicy,
    events: EventBus<LinkEvent>,
}

impl InsituLinkBridge {
    #[must_use]
    pub fn new(id_order: IdPairOrder) -> Self {
        Self {
            state: LinkState::Disconnected,
            id_order,
            id_map: IdMap::new(),
            extracts: BTreeMap::new(),
            data_info: BTreeMap::new(),
            paused: false,
            live_changed_sent: false,
            replication: ReplicationPolicy::new(),
            events: EventBus::new(),
        }
    }

    /// Observer to install on the in-situ tree so local edits get pushed.
    #[must_use]
    pub fn observer(&self) -> Rc<dyn MutationObserver> {
        self.replication.observer()
    }

    pub fn subscribe(&mut self) -> tokio::sync::mpsc::UnboundedReceiver<LinkEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    #[must_use]
    pub fn id_map(&self) -> &IdMap {
        &self.id_map
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[must_use]
    pub fn has_extract(&self, group: &str, name: &str, port: u32) -> bool {
        self.extracts.contains_key(&ExtractKey::new(group, name, port))
    }

    #[must_use]
    pub fn extract_proxy(&self, key: &ExtractKey) -> Option<ProxyId> {
        self.extracts.get(key).copied()
    }

    /// Cached summary for a viewer-space producer port.
    #[must_use]
    pub fn data_information(&self, proxy: ProxyId, port: u32) -> Option<&DataSummary> {
        self.data_info.get(&(proxy, port))
    }

    /// Decode and apply every coupling event carried by `msg`.
    ///
    /// # Errors
    ///
    /// Returns the first parse or transition error. Events before the
    /// failing one stay applied.
    pub fn handle_message(&mut self, ctx: &mut CouplingContext<'_>, msg: &StateMessage) -> Result<(), InsituError> {
        for event in InsituEvent::from_message(msg)? {
            self.handle(ctx, event)?;
        }
        Ok(())
    }

    /// Apply one coupling event.
    ///
    /// # Errors
    ///
    /// `MalformedCoupledState` for an unparsable CONNECTED document,
    /// `NotConnected` for timestep/data events before CONNECTED,
    /// `InvalidIdMapping` for a bad id table. State, including the
    /// live-changed latch, is unchanged on error.
    pub fn handle(&mut self, ctx: &mut CouplingContext<'_>, event: InsituEvent) -> Result<(), InsituError> {
        let result = match event {
            InsituEvent::Connected(state) => self.on_connected(ctx, &state),
            InsituEvent::NextTimestepAvailable => self.on_next_timestep(ctx),
            InsituEvent::Disconnected => {
                info!(previous = ?self.state, "insitu: simulation disconnected");
                self.state = LinkState::Disconnected;
                self.events.publish(LinkEvent::ConnectionClosed);
                Ok(())
            }
            InsituEvent::UpdateDataInformation(entries) => self.on_data_information(ctx, entries),
            InsituEvent::IdMapping(ids) => {
                self.id_map = IdMap::from_alternating(&ids, self.id_order).map_err(InsituError::InvalidIdMapping)?;
                debug!(pairs = self.id_map.len(), "insitu: id map replaced");
                Ok(())
            }
        };
        if result.is_ok() {
            self.live_changed_sent = false;
        }
        result
    }

    fn on_connected(&mut self, ctx: &mut CouplingContext<'_>, state: &str) -> Result<(), InsituError> {
        let doc = SceneDocument::parse(state).map_err(InsituError::MalformedCoupledState)?;

        let mapping = {
            let _scope = self.replication.enter_remote_scope()?;
            ctx.insitu.clear();
            ctx.insitu.load_document(&doc)
        };
        self.id_map = IdMap::from_pairs(mapping).map_err(InsituError::InvalidIdMapping)?;
        self.data_info.clear();
        self.replication.clear();

        for (key, proxy) in &self.extracts {
            ctx.simulation.register_extract(key, *proxy);
        }
        if self.paused {
            ctx.simulation.set_simulation_paused(true);
            self.state = LinkState::Paused;
        } else {
            self.state = LinkState::Connected;
        }
        info!(
            proxies = doc.proxies.len(),
            extracts = self.extracts.len(),
            state = ?self.state,
            "insitu: simulation connected"
        );
        self.events.publish(LinkEvent::ConnectionCreated);
        Ok(())
    }

    fn on_next_timestep(&mut self, ctx: &mut CouplingContext<'_>) -> Result<(), InsituError> {
        if !self.state.is_connected() {
            return Err(InsituError::NotConnected);
        }
        for (key, proxy) in &self.extracts {
            if ctx.viewer.mark_modified(*proxy).is_err() {
                warn!(extract = %key, proxy_id = proxy, "insitu: extract producer missing from viewer");
            }
        }
        self.push_updated_state(ctx);
        if self.state != LinkState::Paused {
            self.state = LinkState::Running;
        }
        debug!(state = ?self.state, "insitu: next timestep available");
        self.events.publish(LinkEvent::Updated);
        Ok(())
    }

    fn on_data_information(
        &mut self,
        ctx: &mut CouplingContext<'_>,
        entries: Vec<DataInformationEntry>,
    ) -> Result<(), InsituError> {
        if !self.state.is_connected() {
            return Err(InsituError::NotConnected);
        }
        let mut affected: Vec<ProxyId> = Vec::new();
        for entry in entries {
            let summary = match frames::decode_summary(&entry.blob) {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(proxy_id = entry.proxy, port = entry.port, error = %e, "insitu: undecodable data information skipped");
                    continue;
                }
            };
            let Some(local) = self.id_map.local_for(entry.proxy) else {
                warn!(proxy_id = entry.proxy, port = entry.port, "insitu: data information for unmapped proxy skipped");
                continue;
            };
            self.data_info.insert((local, entry.port), summary);
            if !affected.contains(&local) {
                affected.push(local);
            }
        }
        for id in &affected {
            if ctx.insitu.mark_modified(*id).and_then(|()| ctx.insitu.update(*id)).is_err() {
                warn!(proxy_id = id, "insitu: data information for unknown proxy");
            }
        }
        debug!(refreshed = affected.len(), "insitu: data information updated");
        self.events.publish(LinkEvent::DataInformationUpdated(affected));
        Ok(())
    }

    /// Send the whole in-situ document if anything was edited locally.
    fn push_updated_state(&mut self, ctx: &mut CouplingContext<'_>) -> bool {
        if !self.replication.has_pending() {
            return false;
        }
        self.replication.clear();
        let document = ctx.insitu.save_document().to_xml();
        debug!(bytes = document.len(), "insitu: pushing updated state");
        ctx.simulation.update_insitu_state(&document);
        true
    }

    fn request_live_changed(&mut self, simulation: &mut dyn SimulationLink) {
        if self.live_changed_sent || !self.paused || !self.state.is_connected() {
            return;
        }
        debug!("insitu: live changed");
        simulation.live_changed();
        self.live_changed_sent = true;
    }

    /// Create a producer proxy in the viewer for a simulation output and
    /// register it.
    ///
    /// # Errors
    ///
    /// Returns `ExtractExists` if the key is already registered.
    pub fn create_extract(
        &mut self,
        ctx: &mut CouplingContext<'_>,
        group: &str,
        name: &str,
        port: u32,
    ) -> Result<ProxyId, InsituError> {
        let key = ExtractKey::new(group, name, port);
        if self.extracts.contains_key(&key) {
            return Err(InsituError::ExtractExists(key));
        }
        let proxy = ctx.viewer.create_proxy(EXTRACT_GROUP, EXTRACT_PRODUCER);
        if self.state.is_connected() {
            ctx.simulation.register_extract(&key, proxy);
        }
        info!(extract = %key, proxy_id = proxy, "insitu: extract created");
        self.extracts.insert(key, proxy);
        self.request_live_changed(&mut *ctx.simulation);
        Ok(proxy)
    }

    /// Unregister the extract produced by `proxy` and drop the producer.
    ///
    /// # Errors
    ///
    /// Returns `UnknownObject` if no extract uses `proxy`.
    pub fn remove_extract(&mut self, ctx: &mut CouplingContext<'_>, proxy: ProxyId) -> Result<ExtractKey, InsituError> {
        let key = self
            .extracts
            .iter()
            .find_map(|(key, p)| (*p == proxy).then(|| key.clone()))
            .ok_or(InsituError::UnknownObject(proxy))?;
        self.extracts.remove(&key);
        if self.state.is_connected() {
            ctx.simulation.unregister_extract(&key, proxy);
        }
        if ctx.viewer.remove_proxy(proxy).is_err() {
            warn!(extract = %key, proxy_id = proxy, "insitu: extract producer already gone");
        }
        info!(extract = %key, proxy_id = proxy, "insitu: extract removed");
        self.request_live_changed(&mut *ctx.simulation);
        Ok(key)
    }

    /// Pause or resume the simulation. A new pause starts a new
    /// live-changed episode.
    pub fn set_simulation_paused(&mut self, simulation: &mut dyn SimulationLink, paused: bool) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        if paused {
            self.live_changed_sent = false;
        }
        if self.state.is_connected() {
            self.state = if paused { LinkState::Paused } else { LinkState::Running };
            simulation.set_simulation_paused(paused);
        }
        info!(paused, state = ?self.state, "insitu: simulation pause toggled");
    }

    /// Push in-situ edits now and ask a paused simulation to pick them up.
    /// Returns whether a document was sent.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` without a simulation.
    pub fn flush_local_edits(&mut self, ctx: &mut CouplingContext<'_>) -> Result<bool, InsituError> {
        if !self.state.is_connected() {
            return Err(InsituError::NotConnected);
        }
        let pushed = self.push_updated_state(ctx);
        self.request_live_changed(&mut *ctx.simulation);
        Ok(pushed)
    }
}

#[cfg(test)]
#[path = "insitu_test.rs"]
mod tests;
