//! Client session — the dispatch layer that wires the components together.
//!
//! DESIGN
//! ======
//! Components never call each other. `CollaborationManager::dispatch` says
//! what an inbound message means (`Routed`), and the session applies it:
//! renders go to the coalescer, coupling traffic to the in-situ bridge, and
//! everything else to the replication policy. Local writes come in through
//! the session too, so the master gate sits in one place.
//!
//! The viewer tree reports its writes to the session's `ReplicationPolicy`;
//! the in-situ tree reports to the bridge's own policy.

use tracing::{debug, warn};

use crate::collaboration::{CollabError, CollaborationManager, Routed};
use crate::config::SessionConfig;
use crate::insitu::{CouplingContext, ExtractKey, InsituError, InsituLinkBridge, SimulationLink};
use crate::link::SessionLink;
use crate::message::{self, ErrorCode, ProxyId, StateMessage, Variant, ViewId};
use crate::proxy::{ProxyArena, ProxyError, ProxyTree};
use crate::render::{RenderCoalescer, ViewHost};
use crate::replication::{ReplicationError, ReplicationPolicy};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Collab(#[from] CollabError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error(transparent)]
    Insitu(#[from] InsituError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Collab(e) => e.error_code(),
            Self::Replication(e) => e.error_code(),
            Self::Insitu(e) => e.error_code(),
            Self::Proxy(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Collab(e) => e.retryable(),
            Self::Insitu(e) => e.retryable(),
            Self::Replication(_) | Self::Proxy(_) => false,
        }
    }
}

/// What one timer tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pushed: usize,
    pub rendered: usize,
}

pub struct Session<L, S> {
    collab: CollaborationManager<L>,
    replication: ReplicationPolicy,
    tree: ProxyArena,
    renders: RenderCoalescer,
    bridge: InsituLinkBridge,
    insitu: ProxyArena,
    simulation: S,
}

impl<L: SessionLink, S: SimulationLink> Session<L, S> {
    pub fn new(link: L, simulation: S, config: &SessionConfig) -> Self {
        let replication = ReplicationPolicy::new();
        let bridge = InsituLinkBridge::new(config.id_pair_order);
        Self {
            collab: CollaborationManager::new(link),
            tree: ProxyArena::new().with_observer(replication.observer()),
            insitu: ProxyArena::new().with_observer(bridge.observer()),
            replication,
            renders: RenderCoalescer::new(),
            bridge,
            simulation,
        }
    }

    pub fn collab(&self) -> &CollaborationManager<L> {
        &self.collab
    }

    pub fn collab_mut(&mut self) -> &mut CollaborationManager<L> {
        &mut self.collab
    }

    pub fn tree(&self) -> &ProxyArena {
        &self.tree
    }

    pub fn insitu_tree(&self) -> &ProxyArena {
        &self.insitu
    }

    pub fn bridge(&self) -> &InsituLinkBridge {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut InsituLinkBridge {
        &mut self.bridge
    }

    pub fn renders(&self) -> &RenderCoalescer {
        &self.renders
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Handle one message delivered by the link.
    ///
    /// # Errors
    ///
    /// Propagates dispatch, replication and coupling errors. The message is
    /// dropped; session state stays consistent.
    pub fn receive(&mut self, msg: StateMessage) -> Result<(), SessionError> {
        match self.collab.dispatch(msg)? {
            Routed::Handled => {}
            Routed::Render(view) => {
                self.renders.request(view);
            }
            Routed::ApplyState(msg) if message::is_coupling(&msg) => {
                let Self { bridge, insitu, tree, simulation, .. } = self;
                let mut ctx = CouplingContext { insitu, viewer: tree, simulation };
                bridge.handle_message(&mut ctx, &msg)?;
            }
            Routed::ApplyState(msg) => self.replication.adopt_remote(&mut self.tree, &msg)?,
        }
        Ok(())
    }

    // =========================================================================
    // LOCAL WRITES
    // =========================================================================

    fn require_local_master(&self) -> Result<(), SessionError> {
        let local = self.collab.local_endpoint().ok_or(CollabError::Detached)?;
        self.collab.require_master(local)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `NotAuthorized` unless the local endpoint is master, and
    /// `UnknownObject` for ids not in the tree.
    pub fn set_property(&mut self, id: ProxyId, key: &str, values: Vec<Variant>) -> Result<(), SessionError> {
        self.require_local_master()?;
        self.tree.set_property(id, key, values)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `NotAuthorized` unless the local endpoint is master.
    pub fn create_proxy(&mut self, group: &str, name: &str) -> Result<ProxyId, SessionError> {
        self.require_local_master()?;
        Ok(self.tree.create_proxy(group, name))
    }

    /// # Errors
    ///
    /// Returns `NotAuthorized` unless the local endpoint is master and
    /// `ExtractExists` for a duplicate key.
    pub fn create_extract(&mut self, group: &str, name: &str, port: u32) -> Result<ProxyId, SessionError> {
        self.require_local_master()?;
        let Self { bridge, insitu, tree, simulation, .. } = self;
        let mut ctx = CouplingContext { insitu, viewer: tree, simulation };
        Ok(bridge.create_extract(&mut ctx, group, name, port)?)
    }

    /// # Errors
    ///
    /// Returns `NotAuthorized` unless the local endpoint is master and
    /// `UnknownObject` if no extract uses `proxy`.
    pub fn remove_extract(&mut self, proxy: ProxyId) -> Result<ExtractKey, SessionError> {
        self.require_local_master()?;
        let Self { bridge, insitu, tree, simulation, .. } = self;
        let mut ctx = CouplingContext { insitu, viewer: tree, simulation };
        Ok(bridge.remove_extract(&mut ctx, proxy)?)
    }

    /// Edit the in-situ pipeline and hand the change to the simulation.
    ///
    /// # Errors
    ///
    /// Returns `NotAuthorized` unless the local endpoint is master,
    /// `UnknownObject` for ids not in the in-situ tree, and `NotConnected`
    /// without a simulation.
    pub fn set_insitu_property(&mut self, id: ProxyId, key: &str, values: Vec<Variant>) -> Result<(), SessionError> {
        self.require_local_master()?;
        if !self.bridge.state().is_connected() {
            return Err(InsituError::NotConnected.into());
        }
        self.insitu.set_property(id, key, values)?;
        let Self { bridge, insitu, tree, simulation, .. } = self;
        let mut ctx = CouplingContext { insitu, viewer: tree, simulation };
        bridge.flush_local_edits(&mut ctx)?;
        Ok(())
    }

    pub fn set_simulation_paused(&mut self, paused: bool) {
        self.bridge.set_simulation_paused(&mut self.simulation, paused);
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Broadcast every dirty object.
    ///
    /// # Errors
    ///
    /// Returns `ReentrantApply` if called from inside a push or apply.
    pub fn push(&mut self) -> Result<usize, SessionError> {
        Ok(self.replication.push(&self.tree, self.collab.link_mut())?)
    }

    /// Called by the view after a locally initiated render.
    pub fn end_render(&mut self, view: ViewId) {
        if let Some(msg) = self.renders.end_render(view) {
            self.collab.link_mut().send_to_other_clients(&msg);
        }
    }

    /// Force the coalesced renders.
    pub fn render_tick<V>(&mut self, views: &mut V) -> usize
    where
        V: ViewHost + ?Sized,
    {
        let Self { renders, collab, .. } = self;
        renders.drain(views, &mut |view| {
            if let Some(msg) = renders.end_render(view) {
                collab.link_mut().send_to_other_clients(&msg);
            }
        })
    }

    /// One timer tick: push local edits, then drain pending renders.
    ///
    /// # Errors
    ///
    /// Returns `ReentrantApply` if called from inside a push or apply.
    pub fn tick<V>(&mut self, views: &mut V) -> Result<TickReport, SessionError>
    where
        V: ViewHost + ?Sized,
    {
        let pushed = self.push()?;
        let rendered = self.render_tick(views);
        if pushed > 0 || rendered > 0 {
            debug!(pushed, rendered, "session: tick");
        }
        Ok(TickReport { pushed, rendered })
    }
}

/// Log a session error with its code.
pub(crate) fn report(err: &SessionError, context: &'static str) {
    warn!(code = err.error_code(), retryable = err.retryable(), error = %err, context, "session: operation failed");
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
