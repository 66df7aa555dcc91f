//! Shared state-message model and protobuf codec for the collaboration link.
//!
//! This crate owns the wire representation used by the relay server and by
//! every client session. A [`StateMessage`] is opaque to the transport: the
//! relay only decodes it to look at control keys and otherwise forwards the
//! bytes untouched.

use prost::Message;
use serde::{Deserialize, Serialize};

/// Error returned by [`decode_message`] and [`decode_summary`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf message.
    #[error("failed to decode protobuf message: {0}")]
    Decode(#[from] prost::DecodeError),
    /// A variant on the wire carried no value.
    #[error("empty variant in field {0:?}")]
    EmptyVariant(String),
}

// =============================================================================
// MESSAGE KIND
// =============================================================================

/// Routing class of a [`StateMessage`].
///
/// Values outside the known range survive decoding as [`MessageKind::Unknown`]
/// so newer peers can talk to older ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Render,
    Chat,
    InspectorTab,
    ProxyStateInvalid,
    UserData,
    Other,
    Unknown(i32),
}

impl MessageKind {
    /// Convert kind into its wire integer.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Render => 0,
            Self::Chat => 1,
            Self::InspectorTab => 2,
            Self::ProxyStateInvalid => 3,
            Self::UserData => 4,
            Self::Other => 5,
            Self::Unknown(value) => value,
        }
    }

    /// Parse a kind from its wire integer. Never fails.
    #[must_use]
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Render,
            1 => Self::Chat,
            2 => Self::InspectorTab,
            3 => Self::ProxyStateInvalid,
            4 => Self::UserData,
            5 => Self::Other,
            other => Self::Unknown(other),
        }
    }
}

// =============================================================================
// PAYLOAD
// =============================================================================

/// One typed value inside a [`Field`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Integer(i64),
    Text(String),
    /// Independently serialized sub-message, e.g. a [`DataSummary`].
    Binary(Vec<u8>),
    ProxyId(u32),
    /// Unsigned 64-bit identifier (id-mapping tables).
    Id(u64),
}

impl Variant {
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_proxy_id(&self) -> Option<u32> {
        match self {
            Self::ProxyId(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of integer-like variants (`Integer`, `ProxyId`, `Id`).
    #[must_use]
    pub fn as_id(&self) -> Option<u64> {
        match self {
            Self::Id(v) => Some(*v),
            Self::ProxyId(v) => Some(u64::from(*v)),
            Self::Integer(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }
}

/// Named, ordered list of values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub key: String,
    pub values: Vec<Variant>,
}

/// The unit of replicated change.
///
/// Built once through the consuming `with_*` builders and read through
/// accessors afterwards; there is no way to mutate a message in place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateMessage {
    kind: MessageKind,
    target_id: u32,
    fields: Vec<Field>,
}

impl StateMessage {
    #[must_use]
    pub fn new(kind: MessageKind, target_id: u32) -> Self {
        Self { kind, target_id, fields: Vec::new() }
    }

    /// Append a field. Keys may repeat; order is preserved.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, values: Vec<Variant>) -> Self {
        self.fields.push(Field { key: key.into(), values });
        self
    }

    /// Append a single-valued field.
    #[must_use]
    pub fn with_value(self, key: impl Into<String>, value: Variant) -> Self {
        self.with_field(key, vec![value])
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn target_id(&self) -> u32 {
        self.target_id
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// First field with the given key.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// First value of the first field with the given key.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&Variant> {
        self.field(key).and_then(|f| f.values.first())
    }

    #[must_use]
    pub fn has_field(&self, key: &str) -> bool {
        self.field(key).is_some()
    }
}

// =============================================================================
// DATA SUMMARY
// =============================================================================

/// Summary of a producer's output, shipped inside [`Variant::Binary`].
#[derive(Clone, PartialEq, Message)]
pub struct DataSummary {
    #[prost(string, tag = "1")]
    pub data_type: String,
    #[prost(uint64, tag = "2")]
    pub number_of_points: u64,
    #[prost(uint64, tag = "3")]
    pub number_of_cells: u64,
    #[prost(uint32, tag = "4")]
    pub number_of_blocks: u32,
    #[prost(uint64, tag = "5")]
    pub memory_size_kib: u64,
    /// `[xmin, xmax, ymin, ymax, zmin, zmax]`, empty when unknown.
    #[prost(double, repeated, tag = "6")]
    pub bounds: Vec<f64>,
    #[prost(string, repeated, tag = "7")]
    pub array_names: Vec<String>,
}

/// Encode a data summary into the bytes carried by a binary variant.
#[must_use]
pub fn encode_summary(summary: &DataSummary) -> Vec<u8> {
    summary.encode_to_vec()
}

/// Decode a data summary from a binary variant.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes.
pub fn decode_summary(bytes: &[u8]) -> Result<DataSummary, CodecError> {
    Ok(DataSummary::decode(bytes)?)
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode a state message into protobuf bytes.
#[must_use]
pub fn encode_message(msg: &StateMessage) -> Vec<u8> {
    message_to_wire(msg).encode_to_vec()
}

/// Decode protobuf bytes into a state message.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes and
/// [`CodecError::EmptyVariant`] when a variant has no value set.
pub fn decode_message(bytes: &[u8]) -> Result<StateMessage, CodecError> {
    let wire = WireMessage::decode(bytes)?;
    wire_to_message(wire)
}

fn message_to_wire(msg: &StateMessage) -> WireMessage {
    WireMessage {
        kind: msg.kind.as_i32(),
        target_id: msg.target_id,
        fields: msg
            .fields
            .iter()
            .map(|f| WireField { key: f.key.clone(), values: f.values.iter().map(variant_to_wire).collect() })
            .collect(),
    }
}

fn wire_to_message(wire: WireMessage) -> Result<StateMessage, CodecError> {
    let mut fields = Vec::with_capacity(wire.fields.len());
    for field in wire.fields {
        let mut values = Vec::with_capacity(field.values.len());
        for value in field.values {
            let Some(value) = value.value else {
                return Err(CodecError::EmptyVariant(field.key));
            };
            values.push(wire_to_variant(value));
        }
        fields.push(Field { key: field.key, values });
    }

    Ok(StateMessage { kind: MessageKind::from_i32(wire.kind), target_id: wire.target_id, fields })
}

fn variant_to_wire(variant: &Variant) -> WireVariant {
    let value = match variant {
        Variant::Integer(v) => wire_variant::Value::Integer(*v),
        Variant::Text(v) => wire_variant::Value::Text(v.clone()),
        Variant::Binary(v) => wire_variant::Value::Binary(v.clone()),
        Variant::ProxyId(v) => wire_variant::Value::ProxyId(*v),
        Variant::Id(v) => wire_variant::Value::Id(*v),
    };
    WireVariant { value: Some(value) }
}

fn wire_to_variant(value: wire_variant::Value) -> Variant {
    match value {
        wire_variant::Value::Integer(v) => Variant::Integer(v),
        wire_variant::Value::Text(v) => Variant::Text(v),
        wire_variant::Value::Binary(v) => Variant::Binary(v),
        wire_variant::Value::ProxyId(v) => Variant::ProxyId(v),
        wire_variant::Value::Id(v) => Variant::Id(v),
    }
}

#[derive(Clone, PartialEq, Message)]
struct WireMessage {
    #[prost(int32, tag = "1")]
    kind: i32,
    #[prost(uint32, tag = "2")]
    target_id: u32,
    #[prost(message, repeated, tag = "3")]
    fields: Vec<WireField>,
}

#[derive(Clone, PartialEq, Message)]
struct WireField {
    #[prost(string, tag = "1")]
    key: String,
    #[prost(message, repeated, tag = "2")]
    values: Vec<WireVariant>,
}

#[derive(Clone, PartialEq, Message)]
struct WireVariant {
    #[prost(oneof = "wire_variant::Value", tags = "1, 2, 3, 4, 5")]
    value: Option<wire_variant::Value>,
}

mod wire_variant {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(int64, tag = "1")]
        Integer(i64),
        #[prost(string, tag = "2")]
        Text(String),
        #[prost(bytes = "vec", tag = "3")]
        Binary(Vec<u8>),
        #[prost(uint32, tag = "4")]
        ProxyId(u32),
        #[prost(uint64, tag = "5")]
        Id(u64),
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
