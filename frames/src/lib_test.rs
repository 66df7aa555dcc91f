use super::*;

fn sample_message() -> StateMessage {
    let summary = DataSummary {
        data_type: "vtkUnstructuredGrid".to_owned(),
        number_of_points: 1024,
        number_of_cells: 900,
        number_of_blocks: 1,
        memory_size_kib: 48,
        bounds: vec![0.0, 1.0, 0.0, 2.0, -1.0, 1.0],
        array_names: vec!["pressure".to_owned(), "velocity".to_owned()],
    };

    StateMessage::new(MessageKind::UserData, 77)
        .with_value("LiveAction", Variant::Integer(1))
        .with_field(
            "UpdateDataInformation",
            vec![Variant::ProxyId(12), Variant::Integer(0), Variant::Binary(encode_summary(&summary))],
        )
        .with_field("IdMapping", vec![Variant::Id(1), Variant::Id(100), Variant::Id(2), Variant::Id(200)])
        .with_value("note", Variant::Text("hello".to_owned()))
}

#[test]
fn kind_numeric_mapping_matches_wire_values() {
    assert_eq!(MessageKind::Render.as_i32(), 0);
    assert_eq!(MessageKind::Chat.as_i32(), 1);
    assert_eq!(MessageKind::InspectorTab.as_i32(), 2);
    assert_eq!(MessageKind::ProxyStateInvalid.as_i32(), 3);
    assert_eq!(MessageKind::UserData.as_i32(), 4);
    assert_eq!(MessageKind::Other.as_i32(), 5);
}

#[test]
fn unknown_kind_is_preserved_not_rejected() {
    assert_eq!(MessageKind::from_i32(42), MessageKind::Unknown(42));
    assert_eq!(MessageKind::Unknown(42).as_i32(), 42);

    let msg = StateMessage::new(MessageKind::Unknown(42), 3);
    let decoded = decode_message(&encode_message(&msg)).expect("decode should succeed");
    assert_eq!(decoded.kind(), MessageKind::Unknown(42));
}

#[test]
fn encode_decode_preserves_message() {
    let msg = sample_message();
    let decoded = decode_message(&encode_message(&msg)).expect("decode should succeed");
    assert_eq!(decoded, msg);
}

#[test]
fn field_order_and_repeated_keys_survive_the_wire() {
    let msg = StateMessage::new(MessageKind::Other, 0)
        .with_value("b", Variant::Integer(1))
        .with_value("a", Variant::Integer(2))
        .with_value("b", Variant::Integer(3));
    let decoded = decode_message(&encode_message(&msg)).expect("decode should succeed");
    let keys: Vec<&str> = decoded.fields().iter().map(|f| f.key.as_str()).collect();
    assert_eq!(keys, vec!["b", "a", "b"]);
    assert_eq!(decoded.value("b"), Some(&Variant::Integer(1)));
}

#[test]
fn binary_blob_carries_independent_summary() {
    let msg = sample_message();
    let decoded = decode_message(&encode_message(&msg)).expect("decode should succeed");
    let field = decoded.field("UpdateDataInformation").expect("field present");
    let blob = field.values[2].as_binary().expect("binary variant");
    let summary = decode_summary(blob).expect("summary decodes");
    assert_eq!(summary.data_type, "vtkUnstructuredGrid");
    assert_eq!(summary.number_of_points, 1024);
    assert_eq!(summary.array_names, vec!["pressure", "velocity"]);
}

#[test]
fn decode_rejects_garbage_bytes() {
    let err = decode_message(&[0xff, 0xff, 0xff]).expect_err("garbage should not decode");
    assert!(matches!(err, CodecError::Decode(_)));
}

#[test]
fn decode_rejects_empty_variant() {
    let wire = WireMessage {
        kind: 4,
        target_id: 1,
        fields: vec![WireField { key: "k".to_owned(), values: vec![WireVariant { value: None }] }],
    };
    let err = decode_message(&wire.encode_to_vec()).expect_err("empty variant should fail");
    assert!(matches!(err, CodecError::EmptyVariant(key) if key == "k"));
}

#[test]
fn variant_accessors_are_typed() {
    assert_eq!(Variant::Integer(5).as_integer(), Some(5));
    assert_eq!(Variant::Text("x".into()).as_integer(), None);
    assert_eq!(Variant::ProxyId(9).as_id(), Some(9));
    assert_eq!(Variant::Integer(-1).as_id(), None);
    assert_eq!(Variant::Id(u64::MAX).as_id(), Some(u64::MAX));
}

#[test]
fn variant_serializes_with_snake_case_tags() {
    let json = serde_json::to_string(&Variant::ProxyId(3)).expect("serialize");
    assert_eq!(json, r#"{"proxy_id":3}"#);
}
