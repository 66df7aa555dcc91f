use super::*;

fn sample_state() -> ProxyState {
    let mut properties = BTreeMap::new();
    properties.insert("Radius".to_owned(), vec![Variant::Integer(3)]);
    properties.insert("FileName".to_owned(), vec![Variant::Text("can.ex2".to_owned())]);
    ProxyState { group: "sources".to_owned(), name: "Sphere".to_owned(), properties }
}

#[test]
fn proxy_state_message_is_user_data_for_target() {
    let msg = proxy_state(9, &sample_state());
    assert_eq!(msg.kind(), MessageKind::UserData);
    assert_eq!(msg.target_id(), 9);
    assert_eq!(msg.value(PROXY_GROUP).and_then(Variant::as_text), Some("sources"));
    assert!(msg.has_field("property:Radius"));
}

#[test]
fn parse_proxy_state_inverts_builder() {
    let state = sample_state();
    let parsed = parse_proxy_state(&proxy_state(1, &state)).expect("state should parse");
    assert_eq!(parsed, state);
}

#[test]
fn parse_proxy_state_requires_group_and_name() {
    let msg = StateMessage::new(MessageKind::UserData, 1).with_value(PROXY_NAME, Variant::Text("x".into()));
    assert!(parse_proxy_state(&msg).is_none());
}

#[test]
fn chat_carries_author_and_text() {
    let msg = chat(4, "hello");
    assert_eq!(msg.kind(), MessageKind::Chat);
    assert_eq!(msg.value(CHAT_AUTHOR).and_then(endpoint_value), Some(4));
    assert_eq!(msg.value(CHAT_TEXT).and_then(Variant::as_text), Some("hello"));
}

#[test]
fn coupling_messages_are_tagged_by_group() {
    let coupling = StateMessage::new(MessageKind::UserData, 0)
        .with_value(PROXY_GROUP, Variant::Text(COUPLING_GROUP.to_owned()));
    assert!(is_coupling(&coupling));
    assert!(!is_coupling(&proxy_state(1, &sample_state())));
}

#[test]
fn error_reply_uses_error_code() {
    let err = frames::CodecError::EmptyVariant("k".to_owned());
    let msg = error_reply(&err);
    assert_eq!(msg.value(ERROR_CODE).and_then(Variant::as_text), Some("E_EMPTY_VARIANT"));
}
