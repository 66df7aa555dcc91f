use super::*;
use crate::events::drain;
use crate::proxy::ProxyArena;
use crate::test_support::{RecordingSimulation, SimCall};

const SCENE: &str = r#"<ServerManagerState>
    <Proxy group="sources" type="Wavelet" id="40"/>
    <Proxy group="filters" type="Contour" id="41">
        <Property name="ContourValues"><Element type="int" value="5"/></Property>
    </Proxy>
</ServerManagerState>"#;

struct Harness {
    bridge: InsituLinkBridge,
    insitu: ProxyArena,
    viewer: ProxyArena,
    simulation: RecordingSimulation,
}

impl Harness {
    fn new() -> Self {
        Self::with_order(IdPairOrder::default())
    }

    fn with_order(order: IdPairOrder) -> Self {
        let bridge = InsituLinkBridge::new(order);
        let insitu = ProxyArena::new().with_observer(bridge.observer());
        Self { bridge, insitu, viewer: ProxyArena::starting_at(100), simulation: RecordingSimulation::default() }
    }

    fn step<R>(&mut self, f: impl FnOnce(&mut InsituLinkBridge, &mut CouplingContext<'_>) -> R) -> R {
        let Self { bridge, insitu, viewer, simulation } = self;
        let mut ctx = CouplingContext { insitu, viewer, simulation };
        f(bridge, &mut ctx)
    }

    fn send(&mut self, event: InsituEvent) -> Result<(), InsituError> {
        self.step(|bridge, ctx| bridge.handle(ctx, event))
    }

    fn create_extract(&mut self, name: &str) -> Result<ProxyId, InsituError> {
        self.step(|bridge, ctx| bridge.create_extract(ctx, "sources", name, 0))
    }

    fn pause(&mut self, paused: bool) {
        self.bridge.set_simulation_paused(&mut self.simulation, paused);
    }
}

fn summary_blob(points: u64) -> Vec<u8> {
    frames::encode_summary(&DataSummary {
        data_type: "vtkImageData".into(),
        number_of_points: points,
        number_of_cells: points / 2,
        number_of_blocks: 1,
        memory_size_kib: 4,
        bounds: vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0],
        array_names: vec!["RTData".into()],
    })
}

// =============================================================================
// CONNECTION
// =============================================================================

#[test]
fn connected_loads_scene_and_builds_id_map() {
    let mut h = Harness::new();
    let mut events = h.bridge.subscribe();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();

    assert_eq!(h.bridge.state(), LinkState::Connected);
    assert_eq!(h.insitu.len(), 2);
    assert_eq!(h.bridge.id_map().local_for(40), Some(1));
    assert_eq!(h.bridge.id_map().local_for(41), Some(2));
    assert_eq!(h.insitu.property(2, "ContourValues").unwrap(), Some(&[Variant::Integer(5)][..]));
    assert_eq!(drain(&mut events), vec![LinkEvent::ConnectionCreated]);
}

#[test]
fn loading_the_scene_does_not_count_as_a_local_edit() {
    let mut h = Harness::new();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    h.send(InsituEvent::NextTimestepAvailable).unwrap();
    assert_eq!(h.simulation.state_pushes(), 0);
}

#[test]
fn empty_scene_connects_and_runs_on_first_timestep() {
    let mut h = Harness::new();
    h.send(InsituEvent::Connected("<validSceneXML/>".into())).unwrap();
    assert_eq!(h.bridge.state(), LinkState::Connected);
    assert!(h.insitu.is_empty());

    h.send(InsituEvent::NextTimestepAvailable).unwrap();
    assert_eq!(h.bridge.state(), LinkState::Running);
}

#[test]
fn malformed_scene_keeps_previous_state() {
    let mut h = Harness::new();
    let err = h.send(InsituEvent::Connected("{\"proxies\":[]}".into())).unwrap_err();
    assert!(matches!(err, InsituError::MalformedCoupledState(_)));
    assert_eq!(err.error_code(), "E_MALFORMED_COUPLED_STATE");
    assert_eq!(h.bridge.state(), LinkState::Disconnected);

    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    assert!(h.send(InsituEvent::Connected("<ServerManagerState>".into())).is_err());
    assert_eq!(h.bridge.state(), LinkState::Connected);
    assert_eq!(h.insitu.len(), 2);
    assert_eq!(h.bridge.id_map().len(), 2);
}

#[test]
fn reconnect_replaces_id_map_wholesale() {
    let mut h = Harness::new();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    h.send(InsituEvent::Disconnected).unwrap();
    assert_eq!(h.bridge.state(), LinkState::Disconnected);
    assert_eq!(h.bridge.id_map().len(), 2);

    h.send(InsituEvent::Connected(r#"<S><Proxy group="sources" type="Sphere" id="77"/></S>"#.into()))
        .unwrap();
    let pairs: Vec<_> = h.bridge.id_map().iter().collect();
    assert_eq!(pairs, vec![(77, 3)]);
    assert_eq!(h.bridge.id_map().local_for(40), None);
    assert_eq!(h.bridge.id_map().sim_for(3), Some(77));
}

#[test]
fn events_before_connect_are_rejected() {
    let mut h = Harness::new();
    assert!(matches!(h.send(InsituEvent::NextTimestepAvailable), Err(InsituError::NotConnected)));
    assert!(matches!(h.send(InsituEvent::UpdateDataInformation(vec![])), Err(InsituError::NotConnected)));
    assert!(h.send(InsituEvent::IdMapping(vec![1, 2])).is_ok());
    assert!(h.send(InsituEvent::Disconnected).is_ok());
}

// =============================================================================
// TIMESTEPS
// =============================================================================

#[test]
fn timestep_after_connect_marks_extracts_and_pushes_edits_first() {
    let mut h = Harness::new();
    let producer = h.create_extract("Contour").unwrap();
    assert!(h.simulation.calls.is_empty());

    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    let key = ExtractKey::new("sources", "Contour", 0);
    assert_eq!(h.simulation.calls, vec![SimCall::Register(key, producer)]);

    h.insitu.set_property(2, "ContourValues", vec![Variant::Integer(8)]).unwrap();
    let mut events = h.bridge.subscribe();
    h.send(InsituEvent::NextTimestepAvailable).unwrap();

    assert_eq!(h.viewer.modified_count(producer), 1);
    assert!(h.viewer.needs_update(producer));
    assert_eq!(h.simulation.state_pushes(), 1);
    let Some(SimCall::UpdateState(document)) = h.simulation.calls.last() else {
        panic!("expected a state push");
    };
    let pushed = SceneDocument::parse(document).unwrap();
    assert_eq!(pushed.proxies[1].properties["ContourValues"], vec![Variant::Integer(8)]);
    assert_eq!(h.bridge.state(), LinkState::Running);
    assert_eq!(drain(&mut events), vec![LinkEvent::Updated]);

    // Nothing new to push on the next step.
    h.send(InsituEvent::NextTimestepAvailable).unwrap();
    assert_eq!(h.simulation.state_pushes(), 1);
    assert_eq!(h.viewer.modified_count(producer), 2);
}

#[test]
fn paused_simulation_stays_paused_on_timestep() {
    let mut h = Harness::new();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    h.pause(true);
    assert_eq!(h.bridge.state(), LinkState::Paused);
    h.send(InsituEvent::NextTimestepAvailable).unwrap();
    assert_eq!(h.bridge.state(), LinkState::Paused);
    h.pause(false);
    assert_eq!(h.bridge.state(), LinkState::Running);
    assert_eq!(h.simulation.calls, vec![SimCall::Paused(true), SimCall::Paused(false)]);
}

#[test]
fn pause_carries_over_to_the_next_simulation() {
    let mut h = Harness::new();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    h.pause(true);
    h.send(InsituEvent::Disconnected).unwrap();
    assert!(h.bridge.is_paused());

    h.simulation.calls.clear();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    assert_eq!(h.bridge.state(), LinkState::Paused);
    assert_eq!(h.simulation.calls, vec![SimCall::Paused(true)]);

    h.pause(true);
    h.send(InsituEvent::NextTimestepAvailable).unwrap();
    assert_eq!(h.bridge.state(), LinkState::Paused);
    assert_eq!(h.simulation.calls, vec![SimCall::Paused(true)]);
}

// =============================================================================
// LIVE CHANGED
// =============================================================================

#[test]
fn extract_burst_sends_one_live_changed_per_pause() {
    let mut h = Harness::new();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    h.pause(true);
    for name in ["A", "B", "C", "D"] {
        h.create_extract(name).unwrap();
    }
    assert_eq!(h.simulation.live_changed_count(), 1);

    // A new pause episode re-arms the latch.
    h.pause(false);
    h.pause(true);
    h.create_extract("E").unwrap();
    assert_eq!(h.simulation.live_changed_count(), 2);
}

#[test]
fn inbound_event_rearms_live_changed() {
    let mut h = Harness::new();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    h.pause(true);
    h.create_extract("A").unwrap();
    h.create_extract("B").unwrap();
    h.send(InsituEvent::IdMapping(vec![40, 1])).unwrap();
    h.create_extract("C").unwrap();
    assert_eq!(h.simulation.live_changed_count(), 2);
}

#[test]
fn failed_event_keeps_live_changed_latch() {
    let mut h = Harness::new();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    h.pause(true);
    h.create_extract("A").unwrap();
    assert!(h.send(InsituEvent::IdMapping(vec![1, 2, 3])).is_err());
    assert!(h.send(InsituEvent::Connected("not xml".into())).is_err());
    h.create_extract("B").unwrap();
    assert_eq!(h.simulation.live_changed_count(), 1);
}

#[test]
fn no_live_changed_while_running_or_disconnected() {
    let mut h = Harness::new();
    h.create_extract("A").unwrap();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    h.create_extract("B").unwrap();
    assert_eq!(h.simulation.live_changed_count(), 0);
}

#[test]
fn flush_pushes_edits_and_pokes_paused_simulation() {
    let mut h = Harness::new();
    assert!(matches!(h.step(|b, ctx| b.flush_local_edits(ctx)), Err(InsituError::NotConnected)));

    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    h.pause(true);
    assert!(!h.step(|b, ctx| b.flush_local_edits(ctx)).unwrap());
    assert_eq!(h.simulation.live_changed_count(), 1);

    h.insitu.set_property(1, "WholeExtent", vec![Variant::Integer(0)]).unwrap();
    assert!(h.step(|b, ctx| b.flush_local_edits(ctx)).unwrap());
    assert_eq!(h.simulation.state_pushes(), 1);
    assert_eq!(h.simulation.live_changed_count(), 1);
}

// =============================================================================
// EXTRACTS
// =============================================================================

#[test]
fn extracts_are_unique_and_removable() {
    let mut h = Harness::new();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    let producer = h.create_extract("Slice").unwrap();
    assert!(h.bridge.has_extract("sources", "Slice", 0));
    assert!(h.viewer.contains(producer));
    assert!(matches!(h.create_extract("Slice"), Err(InsituError::ExtractExists(_))));

    let key = h.step(|b, ctx| b.remove_extract(ctx, producer)).unwrap();
    assert_eq!(key.to_string(), "sources:Slice:0");
    assert!(!h.bridge.has_extract("sources", "Slice", 0));
    assert!(!h.viewer.contains(producer));
    assert!(h.simulation.calls.contains(&SimCall::Unregister(key, producer)));

    assert!(matches!(h.step(|b, ctx| b.remove_extract(ctx, producer)), Err(InsituError::UnknownObject(_))));
}

#[test]
fn extracts_survive_disconnect() {
    let mut h = Harness::new();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    let producer = h.create_extract("Slice").unwrap();
    h.send(InsituEvent::Disconnected).unwrap();
    assert!(h.bridge.has_extract("sources", "Slice", 0));

    h.simulation.calls.clear();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    assert_eq!(h.simulation.calls, vec![SimCall::Register(ExtractKey::new("sources", "Slice", 0), producer)]);
}

// =============================================================================
// DATA INFORMATION
// =============================================================================

#[test]
fn data_information_is_translated_cached_and_batched() {
    let mut h = Harness::new();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    let mut events = h.bridge.subscribe();
    let entries = vec![
        DataInformationEntry { proxy: 40, port: 0, blob: summary_blob(100) },
        DataInformationEntry { proxy: 40, port: 1, blob: summary_blob(200) },
        DataInformationEntry { proxy: 41, port: 0, blob: vec![0xff, 0xff, 0xff] },
    ];
    h.send(InsituEvent::UpdateDataInformation(entries)).unwrap();

    assert_eq!(h.bridge.data_information(1, 0).unwrap().number_of_points, 100);
    assert_eq!(h.bridge.data_information(1, 1).unwrap().number_of_points, 200);
    assert!(h.bridge.data_information(2, 0).is_none());
    assert_eq!(h.insitu.modified_count(1), 1);
    assert_eq!(h.insitu.update_count(1), 1);
    assert_eq!(h.insitu.update_count(2), 0);
    assert_eq!(drain(&mut events), vec![LinkEvent::DataInformationUpdated(vec![1])]);
}

#[test]
fn unmapped_data_information_is_skipped() {
    let mut h = Harness::new();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    let mut events = h.bridge.subscribe();
    // Sim id 1 is not in the map, even though local id 1 exists.
    let entries = vec![DataInformationEntry { proxy: 1, port: 0, blob: summary_blob(7) }];
    h.send(InsituEvent::UpdateDataInformation(entries)).unwrap();

    assert!(h.bridge.data_information(1, 0).is_none());
    assert_eq!(h.insitu.modified_count(1), 0);
    assert_eq!(drain(&mut events), vec![LinkEvent::DataInformationUpdated(vec![])]);
}

#[test]
fn reconnect_drops_cached_data_information() {
    let mut h = Harness::new();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    let entries = vec![DataInformationEntry { proxy: 40, port: 0, blob: summary_blob(9) }];
    h.send(InsituEvent::UpdateDataInformation(entries)).unwrap();
    assert!(h.bridge.data_information(1, 0).is_some());

    h.send(InsituEvent::Disconnected).unwrap();
    h.send(InsituEvent::Connected(SCENE.into())).unwrap();
    assert!(!h.insitu.contains(1));
    assert!(h.bridge.data_information(1, 0).is_none());
}

#[test]
fn id_mapping_lists_local_ids_first_by_default() {
    let mut h = Harness::new();
    h.send(InsituEvent::IdMapping(vec![5, 50, 6, 60])).unwrap();
    assert_eq!(h.bridge.id_map().local_for(50), Some(5));
    assert_eq!(h.bridge.id_map().sim_for(6), Some(60));

    let err = h.send(InsituEvent::IdMapping(vec![5, 50, 6])).unwrap_err();
    assert!(matches!(err, InsituError::InvalidIdMapping(IdMapError::OddLength(3))));
    assert_eq!(h.bridge.id_map().len(), 2);
}

#[test]
fn id_mapping_order_can_be_overridden() {
    let mut h = Harness::with_order(IdPairOrder::SimFirst);
    h.send(InsituEvent::IdMapping(vec![5, 50])).unwrap();
    assert_eq!(h.bridge.id_map().local_for(5), Some(50));
}

// =============================================================================
// WIRE
// =============================================================================

#[test]
fn coupling_messages_parse_in_field_order() {
    let events = vec![
        InsituEvent::Connected(SCENE.into()),
        InsituEvent::UpdateDataInformation(vec![DataInformationEntry { proxy: 40, port: 2, blob: vec![1, 2] }]),
        InsituEvent::IdMapping(vec![40, 1]),
        InsituEvent::NextTimestepAvailable,
    ];
    for event in events {
        let msg = event.to_message();
        assert!(message::is_coupling(&msg));
        assert_eq!(InsituEvent::from_message(&msg).unwrap(), vec![event]);
    }
}

#[test]
fn malformed_coupling_fields_are_rejected() {
    let base = InsituEvent::Disconnected.to_message();
    assert!(InsituEvent::from_message(&message::render(1)).is_err());

    let bad_action = StateMessage::new(MessageKind::UserData, 0)
        .with_value(message::PROXY_GROUP, Variant::Text(message::COUPLING_GROUP.into()))
        .with_value(message::LIVE_ACTION, Variant::Integer(99));
    assert!(matches!(InsituEvent::from_message(&bad_action), Err(InsituError::MalformedEvent(_))));

    let short_triple = base.clone().with_field(message::UPDATE_DATA_INFORMATION, vec![Variant::ProxyId(1)]);
    assert!(InsituEvent::from_message(&short_triple).is_err());

    let text_ids = base.with_value(message::ID_MAPPING, Variant::Text("1".into()));
    assert!(InsituEvent::from_message(&text_ids).is_err());
}

#[test]
fn handle_message_applies_every_event() {
    let mut h = Harness::new();
    let connect = InsituEvent::Connected(SCENE.into()).to_message();
    let step = InsituEvent::NextTimestepAvailable.to_message();
    h.step(|b, ctx| b.handle_message(ctx, &connect)).unwrap();
    h.step(|b, ctx| b.handle_message(ctx, &step)).unwrap();
    assert_eq!(h.bridge.state(), LinkState::Running);
}
