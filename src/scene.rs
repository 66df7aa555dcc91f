//! Scene document — whole-tree serialization of proxy state.
//!
//! Used for the state blob a simulation sends on connect and for the full
//! in-situ state pushed back to it. XML on the outside, `ProxyTree` on the
//! inside:
//!
//! ```text
//! <ServerManagerState>
//!   <Proxy group="filters" type="Contour" id="41">
//!     <Property name="ContourValues">
//!       <Element type="int" value="5"/>
//!     </Property>
//!   </Proxy>
//! </ServerManagerState>
//! ```
//!
//! Any root element is accepted. Only `Proxy` children of the root are
//! loaded and anything else is skipped. An `Element` without a `type` is
//! text; `binary` values are base64.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use crate::message::{ErrorCode, ProxyId, Variant};

const ROOT: &str = "ServerManagerState";

#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    #[error("invalid scene xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("invalid scene attribute: {0}")]
    Attribute(String),
    #[error("malformed scene document: {0}")]
    Malformed(&'static str),
    #[error("duplicate proxy id in scene document: {0}")]
    DuplicateId(ProxyId),
}

impl ErrorCode for SceneError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Xml(_) | Self::Attribute(_) | Self::Malformed(_) => "E_SCENE_PARSE",
            Self::DuplicateId(_) => "E_SCENE_DUPLICATE_ID",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SceneDocument {
    pub proxies: Vec<SceneProxy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneProxy {
    /// Id in the producer's id space.
    pub id: ProxyId,
    pub group: String,
    pub name: String,
    pub properties: BTreeMap<String, Vec<Variant>>,
}

impl SceneDocument {
    /// Parse a document and reject duplicate proxy ids.
    ///
    /// # Errors
    ///
    /// Returns `Xml` / `Attribute` for text that is not well-formed XML,
    /// `Malformed` for missing or mistyped proxy attributes, and
    /// `DuplicateId` when two proxies share an id.
    pub fn parse(text: &str) -> Result<Self, SceneError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut builder = Builder::default();
        let mut depth = 0_usize;
        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    builder.open(&e, depth)?;
                    depth += 1;
                }
                Event::Empty(e) => {
                    builder.open(&e, depth)?;
                    builder.close(depth);
                }
                Event::End(_) => {
                    depth = depth.checked_sub(1).ok_or(SceneError::Malformed("unmatched end tag"))?;
                    builder.close(depth);
                }
                Event::Text(_) | Event::CData(_) if depth == 0 => {
                    return Err(SceneError::Malformed("text outside the root element"));
                }
                Event::Eof => break,
                _ => {}
            }
        }
        if depth != 0 {
            return Err(SceneError::Malformed("unclosed element"));
        }
        if !builder.root_seen {
            return Err(SceneError::Malformed("no root element"));
        }
        Ok(builder.doc)
    }

    #[must_use]
    pub fn to_xml(&self) -> String {
        let mut out = format!("<{ROOT}>");
        for proxy in &self.proxies {
            let _ = write!(
                out,
                r#"<Proxy group="{}" type="{}" id="{}">"#,
                escape(proxy.group.as_str()),
                escape(proxy.name.as_str()),
                proxy.id
            );
            for (name, values) in &proxy.properties {
                let _ = write!(out, r#"<Property name="{}">"#, escape(name.as_str()));
                for value in values {
                    write_element(&mut out, value);
                }
                out.push_str("</Property>");
            }
            out.push_str("</Proxy>");
        }
        let _ = write!(out, "</{ROOT}>");
        out
    }
}

fn write_element(out: &mut String, value: &Variant) {
    let _ = match value {
        Variant::Text(text) => write!(out, r#"<Element value="{}"/>"#, escape(text.as_str())),
        Variant::Integer(v) => write!(out, r#"<Element type="int" value="{v}"/>"#),
        Variant::ProxyId(v) => write!(out, r#"<Element type="proxy" value="{v}"/>"#),
        Variant::Id(v) => write!(out, r#"<Element type="id" value="{v}"/>"#),
        Variant::Binary(bytes) => write!(out, r#"<Element type="binary" value="{}"/>"#, STANDARD.encode(bytes)),
    };
}

// =============================================================================
// PARSER
// =============================================================================

/// Element-at-a-time document builder. `depth` is the depth of the element
/// being opened or closed; the root is depth 0.
#[derive(Default)]
struct Builder {
    doc: SceneDocument,
    seen: HashSet<ProxyId>,
    root_seen: bool,
    proxy: Option<SceneProxy>,
    property: Option<(String, Vec<Variant>)>,
}

impl Builder {
    fn open(&mut self, e: &BytesStart<'_>, depth: usize) -> Result<(), SceneError> {
        match (depth, e.local_name().as_ref()) {
            (0, _) => {
                if self.root_seen {
                    return Err(SceneError::Malformed("more than one root element"));
                }
                self.root_seen = true;
            }
            (1, b"Proxy") => {
                let id = required(e, "id")?
                    .parse::<ProxyId>()
                    .map_err(|_| SceneError::Malformed("proxy id is not an unsigned integer"))?;
                if !self.seen.insert(id) {
                    return Err(SceneError::DuplicateId(id));
                }
                let group = required(e, "group")?;
                let name = required(e, "type")?;
                self.proxy = Some(SceneProxy { id, group, name, properties: BTreeMap::new() });
            }
            (2, b"Property") if self.proxy.is_some() => {
                self.property = Some((required(e, "name")?, Vec::new()));
            }
            (3, b"Element") => {
                if let Some((_, values)) = &mut self.property {
                    values.push(element_value(e)?);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, depth: usize) {
        match depth {
            1 => {
                if let Some(proxy) = self.proxy.take() {
                    self.doc.proxies.push(proxy);
                }
            }
            2 => {
                if let (Some((name, values)), Some(proxy)) = (self.property.take(), self.proxy.as_mut()) {
                    proxy.properties.insert(name, values);
                }
            }
            _ => {}
        }
    }
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Result<Option<String>, SceneError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| SceneError::Attribute(err.to_string()))?;
        if attr.key.as_ref() == key.as_bytes() {
            let value = attr.unescape_value().map_err(|err| SceneError::Attribute(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn required(e: &BytesStart<'_>, key: &'static str) -> Result<String, SceneError> {
    attribute(e, key)?.ok_or(SceneError::Malformed(match key {
        "id" => "proxy without id",
        "group" => "proxy without group",
        "type" => "proxy without type",
        _ => "property without name",
    }))
}

fn element_value(e: &BytesStart<'_>) -> Result<Variant, SceneError> {
    let value = attribute(e, "value")?.ok_or(SceneError::Malformed("element without value"))?;
    let mistyped = || SceneError::Malformed("element value does not match its type");
    match attribute(e, "type")?.as_deref() {
        None | Some("text") => Ok(Variant::Text(value)),
        Some("int") => value.parse().map(Variant::Integer).map_err(|_| mistyped()),
        Some("proxy") => value.parse().map(Variant::ProxyId).map_err(|_| mistyped()),
        Some("id") => value.parse().map(Variant::Id).map_err(|_| mistyped()),
        Some("binary") => STANDARD.decode(value).map(Variant::Binary).map_err(|_| mistyped()),
        Some(_) => Err(SceneError::Malformed("unknown element type")),
    }
}
