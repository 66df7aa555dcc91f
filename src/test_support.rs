//! Recording collaborators for unit tests.

use crate::insitu::{ExtractKey, SimulationLink};
use crate::link::SessionLink;
use crate::message::{ProxyId, StateMessage, ViewId};
use crate::render::ViewHost;

#[derive(Default)]
pub struct RecordingLink {
    pub sent: Vec<StateMessage>,
}

impl SessionLink for RecordingLink {
    fn send_to_other_clients(&mut self, msg: &StateMessage) {
        self.sent.push(msg.clone());
    }
}

/// Renders instantly and reports end-of-render for every view.
#[derive(Default)]
pub struct RecordingViews {
    pub rendered: Vec<ViewId>,
}

impl ViewHost for RecordingViews {
    fn force_render(&mut self, view: ViewId, end_render: &mut dyn FnMut(ViewId)) {
        self.rendered.push(view);
        end_render(view);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    UpdateState(String),
    LiveChanged,
    Register(ExtractKey, ProxyId),
    Unregister(ExtractKey, ProxyId),
    Paused(bool),
}

#[derive(Default)]
pub struct RecordingSimulation {
    pub calls: Vec<SimCall>,
}

impl RecordingSimulation {
    pub fn live_changed_count(&self) -> usize {
        self.calls.iter().filter(|c| **c == SimCall::LiveChanged).count()
    }

    pub fn state_pushes(&self) -> usize {
        self.calls.iter().filter(|c| matches!(c, SimCall::UpdateState(_))).count()
    }
}

impl SimulationLink for RecordingSimulation {
    fn update_insitu_state(&mut self, document: &str) {
        self.calls.push(SimCall::UpdateState(document.to_owned()));
    }

    fn live_changed(&mut self) {
        self.calls.push(SimCall::LiveChanged);
    }

    fn register_extract(&mut self, key: &ExtractKey, proxy: ProxyId) {
        self.calls.push(SimCall::Register(key.clone(), proxy));
    }

    fn unregister_extract(&mut self, key: &ExtractKey, proxy: ProxyId) {
        self.calls.push(SimCall::Unregister(key.clone(), proxy));
    }

    fn set_simulation_paused(&mut self, paused: bool) {
        self.calls.push(SimCall::Paused(paused));
    }
}
