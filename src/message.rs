//! Message vocabulary — field keys and builders for every `StateMessage`
//! the core emits.
//!
//! DESIGN
//! ======
//! The transport never inspects payloads. Everything that gives a message
//! meaning (chat author, membership snapshot, proxy state) lives here as a
//! field-key constant plus a builder/parser pair so producers and consumers
//! cannot drift apart.

use std::collections::BTreeMap;

pub use frames::{Field, MessageKind, StateMessage, Variant};

use crate::proxy::ProxyState;

/// Numeric participant id, assigned by the relay on connect.
pub type EndpointId = u32;
/// Global id of a proxied object, stable for the object's lifetime.
pub type ProxyId = u32;
/// Global id of a view proxy.
pub type ViewId = u32;

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

pub const CHAT_AUTHOR: &str = "author";
pub const CHAT_TEXT: &str = "txt";

/// Membership snapshot: alternating `Integer(id)`, `Text(name)` values.
pub const USER_LIST: &str = "user_list";
/// Current master id, or no values while there is none.
pub const MASTER: &str = "master";
/// Relay → new endpoint: the id it was assigned.
pub const WELCOME: &str = "welcome";
pub const FOLLOW_CAMERA: &str = "follow_camera";

pub const PROXY_GROUP: &str = "xml_group";
pub const PROXY_NAME: &str = "xml_name";
/// Prefix of the per-property fields of a proxy-state message.
pub const PROPERTY_PREFIX: &str = "property:";
/// Marks a proxy-state message as a deletion of its target.
pub const PROXY_REMOVED: &str = "removed";

/// Proxy group that tags in-situ coupling traffic.
pub const COUPLING_GROUP: &str = "catalyst_communication";
pub const LIVE_ACTION: &str = "LiveAction";
pub const UPDATE_DATA_INFORMATION: &str = "UpdateDataInformation";
pub const ID_MAPPING: &str = "IdMapping";

pub const ERROR_CODE: &str = "code";
pub const ERROR_MESSAGE: &str = "message";

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error replies.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

impl ErrorCode for frames::CodecError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "E_DECODE",
            Self::EmptyVariant(_) => "E_EMPTY_VARIANT",
        }
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

#[must_use]
pub fn render(view: ViewId) -> StateMessage {
    StateMessage::new(MessageKind::Render, view)
}

#[must_use]
pub fn chat(author: EndpointId, text: &str) -> StateMessage {
    StateMessage::new(MessageKind::Chat, 0)
        .with_value(CHAT_AUTHOR, Variant::Integer(i64::from(author)))
        .with_value(CHAT_TEXT, Variant::Text(text.to_owned()))
}

/// The tab index travels in the target id slot.
#[must_use]
pub fn inspector_tab(index: u32) -> StateMessage {
    StateMessage::new(MessageKind::InspectorTab, index)
}

#[must_use]
pub fn follow_camera(endpoint: EndpointId) -> StateMessage {
    StateMessage::new(MessageKind::Other, 0).with_value(FOLLOW_CAMERA, Variant::Integer(i64::from(endpoint)))
}

#[must_use]
pub fn welcome(endpoint: EndpointId) -> StateMessage {
    StateMessage::new(MessageKind::Other, 0).with_value(WELCOME, Variant::Integer(i64::from(endpoint)))
}

/// Structured error reply for a request the relay refused.
#[must_use]
pub fn error_reply(err: &(impl ErrorCode + ?Sized)) -> StateMessage {
    StateMessage::new(MessageKind::Other, 0)
        .with_value(ERROR_CODE, Variant::Text(err.error_code().to_owned()))
        .with_value(ERROR_MESSAGE, Variant::Text(err.to_string()))
}

/// Full authoritative state of one proxy.
#[must_use]
pub fn proxy_state(id: ProxyId, state: &ProxyState) -> StateMessage {
    let mut msg = StateMessage::new(MessageKind::UserData, id)
        .with_value(PROXY_GROUP, Variant::Text(state.group.clone()))
        .with_value(PROXY_NAME, Variant::Text(state.name.clone()));
    for (key, values) in &state.properties {
        msg = msg.with_field(format!("{PROPERTY_PREFIX}{key}"), values.clone());
    }
    msg
}

/// Deletion of one proxy. Applying it to a tree that never had the object
/// is a no-op.
#[must_use]
pub fn proxy_removed(id: ProxyId) -> StateMessage {
    StateMessage::new(MessageKind::UserData, id).with_value(PROXY_REMOVED, Variant::Integer(1))
}

#[must_use]
pub fn is_removal(msg: &StateMessage) -> bool {
    msg.kind() == MessageKind::UserData && msg.has_field(PROXY_REMOVED)
}

/// Inverse of [`proxy_state`]. `None` when group or name is missing.
#[must_use]
pub fn parse_proxy_state(msg: &StateMessage) -> Option<ProxyState> {
    let group = msg.value(PROXY_GROUP)?.as_text()?.to_owned();
    let name = msg.value(PROXY_NAME)?.as_text()?.to_owned();
    let properties = msg
        .fields()
        .iter()
        .filter_map(|f| {
            f.key
                .strip_prefix(PROPERTY_PREFIX)
                .map(|key| (key.to_owned(), f.values.clone()))
        })
        .collect::<BTreeMap<_, _>>();
    Some(ProxyState { group, name, properties })
}

/// Whether a message belongs to the in-situ coupling channel.
#[must_use]
pub fn is_coupling(msg: &StateMessage) -> bool {
    msg.kind() == MessageKind::UserData
        && msg
            .value(PROXY_GROUP)
            .and_then(Variant::as_text)
            .is_some_and(|group| group == COUPLING_GROUP)
}

/// Read an endpoint id out of an integer-like variant.
#[must_use]
pub fn endpoint_value(value: &Variant) -> Option<EndpointId> {
    value.as_id().and_then(|v| EndpointId::try_from(v).ok())
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
