//! Context payloads — items, formats, and context-type matching.
//!
//! A [`Context`] is an ordered list of [`ContextItem`]s. Each item
//! describes one entity (an instrument, a contact) in one or more
//! formats at once. Known formats are decoded into typed structs;
//! anything else is carried as [`ContextData::Opaque`] bytes so that
//! newer formats pass through untouched.

use std::collections::BTreeSet;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Wildcard sentinel for handlers that accept any context type.
pub const ANY_CONTEXT_TYPE: &str = "*";

pub const INSTRUMENT_FORMAT: &str = "fdc3.instrument";
pub const CONTACT_FORMAT: &str = "fdc3.contact";
pub const ORGANIZATION_FORMAT: &str = "fdc3.organization";

/// Context validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context has no items")]
    Empty,
    #[error("context item has no formats")]
    EmptyItem,
    #[error("duplicate format {0} in context item")]
    DuplicateFormat(String),
    #[error("malformed {format} payload: {reason}")]
    Malformed { format: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub figi: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lei: Option<String>,
}

/// One representation of a context item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireFormat", into = "WireFormat")]
pub enum ContextData {
    Instrument(Instrument),
    Contact(Contact),
    Organization(Organization),
    /// A format this crate has no schema for.
    Opaque { format: String, bytes: Vec<u8> },
}

impl ContextData {
    /// The format name, e.g. `fdc3.instrument`.
    pub fn format(&self) -> &str {
        match self {
            ContextData::Instrument(_) => INSTRUMENT_FORMAT,
            ContextData::Contact(_) => CONTACT_FORMAT,
            ContextData::Organization(_) => ORGANIZATION_FORMAT,
            ContextData::Opaque { format, .. } => format,
        }
    }
}

/// Serialized shape of a [`ContextData`]: `{format, data?, bytes?}`.
///
/// Known formats carry a structured `data` map; opaque formats carry
/// raw `bytes`.
#[derive(Debug, Serialize, Deserialize)]
struct WireFormat {
    format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    bytes: Option<Vec<u8>>,
}

impl From<ContextData> for WireFormat {
    fn from(value: ContextData) -> Self {
        let (format, data, bytes) = match value {
            ContextData::Instrument(i) => (INSTRUMENT_FORMAT.to_string(), serde_json::to_value(i).ok(), None),
            ContextData::Contact(c) => (CONTACT_FORMAT.to_string(), serde_json::to_value(c).ok(), None),
            ContextData::Organization(o) => {
                (ORGANIZATION_FORMAT.to_string(), serde_json::to_value(o).ok(), None)
            }
            ContextData::Opaque { format, bytes } => (format, None, Some(bytes)),
        };
        WireFormat { format, data, bytes }
    }
}

impl TryFrom<WireFormat> for ContextData {
    type Error = ContextError;

    fn try_from(wire: WireFormat) -> Result<Self, Self::Error> {
        match wire.format.as_str() {
            INSTRUMENT_FORMAT => Ok(ContextData::Instrument(decode_known(&wire.format, wire.data)?)),
            CONTACT_FORMAT => Ok(ContextData::Contact(decode_known(&wire.format, wire.data)?)),
            ORGANIZATION_FORMAT => {
                Ok(ContextData::Organization(decode_known(&wire.format, wire.data)?))
            }
            _ => {
                // Unknown formats keep their payload verbatim. A structured
                // `data` value is kept as its JSON encoding.
                let bytes = match (wire.bytes, wire.data) {
                    (Some(bytes), _) => bytes,
                    (None, Some(data)) => data.to_string().into_bytes(),
                    (None, None) => Vec::new(),
                };
                Ok(ContextData::Opaque {
                    format: wire.format,
                    bytes,
                })
            }
        }
    }
}

fn decode_known<T: DeserializeOwned>(
    format: &str,
    data: Option<serde_json::Value>,
) -> Result<T, ContextError> {
    let value = data.unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
    serde_json::from_value(value).map_err(|e| ContextError::Malformed {
        format: format.to_string(),
        reason: e.to_string(),
    })
}

/// A single entity expressed in one or more formats.
///
/// Format names are unique within an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawItem", into = "RawItem")]
pub struct ContextItem {
    formats: Vec<ContextData>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawItem {
    formats: Vec<ContextData>,
}

impl From<ContextItem> for RawItem {
    fn from(item: ContextItem) -> Self {
        RawItem {
            formats: item.formats,
        }
    }
}

impl TryFrom<RawItem> for ContextItem {
    type Error = ContextError;

    fn try_from(raw: RawItem) -> Result<Self, Self::Error> {
        ContextItem::new(raw.formats)
    }
}

impl ContextItem {
    pub fn new(formats: Vec<ContextData>) -> Result<Self, ContextError> {
        if formats.is_empty() {
            return Err(ContextError::EmptyItem);
        }
        let mut seen = BTreeSet::new();
        for data in &formats {
            if !seen.insert(data.format()) {
                return Err(ContextError::DuplicateFormat(data.format().to_string()));
            }
        }
        Ok(Self { formats })
    }

    /// An item with exactly one representation.
    pub fn single(data: ContextData) -> Self {
        Self {
            formats: vec![data],
        }
    }

    pub fn formats(&self) -> &[ContextData] {
        &self.formats
    }

    pub fn get(&self, format: &str) -> Option<&ContextData> {
        self.formats.iter().find(|d| d.format() == format)
    }

    pub fn format_names(&self) -> impl Iterator<Item = &str> {
        self.formats.iter().map(ContextData::format)
    }

    /// Comma-separated list of every format this item is expressed in.
    pub fn format_list(&self) -> String {
        self.format_names().collect::<Vec<_>>().join(",")
    }
}

/// A context payload: an ordered list of items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub items: Vec<ContextItem>,
}

impl Context {
    pub fn new(items: Vec<ContextItem>) -> Self {
        Self { items }
    }

    /// A context with one single-format item.
    pub fn single(data: ContextData) -> Self {
        Self {
            items: vec![ContextItem::single(data)],
        }
    }

    /// Reject contexts that cannot be matched against any handler.
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.items.is_empty() {
            return Err(ContextError::Empty);
        }
        Ok(())
    }

    /// Union of the format names across all items.
    pub fn types(&self) -> BTreeSet<String> {
        self.items
            .iter()
            .flat_map(|item| item.format_names().map(str::to_string))
            .collect()
    }
}

/// The context types a handler declares support for.
///
/// Never empty: a handler indifferent to type is [`ContextTypes::Any`],
/// serialized as `["*"]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub enum ContextTypes {
    #[default]
    Any,
    Only(BTreeSet<String>),
}

impl From<Vec<String>> for ContextTypes {
    fn from(types: Vec<String>) -> Self {
        ContextTypes::of(types)
    }
}

impl From<ContextTypes> for Vec<String> {
    fn from(types: ContextTypes) -> Self {
        match types {
            ContextTypes::Any => vec![ANY_CONTEXT_TYPE.to_string()],
            ContextTypes::Only(set) => set.into_iter().collect(),
        }
    }
}

impl ContextTypes {
    /// Build a type set. Empty input or a `*` entry yields [`ContextTypes::Any`].
    pub fn of<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = types.into_iter().map(Into::into).collect();
        if set.is_empty() || set.contains(ANY_CONTEXT_TYPE) {
            ContextTypes::Any
        } else {
            ContextTypes::Only(set)
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, ContextTypes::Any)
    }

    pub fn accepts_type(&self, context_type: &str) -> bool {
        match self {
            ContextTypes::Any => true,
            ContextTypes::Only(set) => set.contains(context_type),
        }
    }

    /// A handler accepts a context when every item offers at least one
    /// format the handler understands.
    pub fn accepts(&self, context: &Context) -> bool {
        match self {
            ContextTypes::Any => true,
            ContextTypes::Only(_) => context
                .items
                .iter()
                .all(|item| item.format_names().any(|f| self.accepts_type(f))),
        }
    }

    /// Whether any of the requested types is accepted.
    pub fn accepts_any_of(&self, types: &[String]) -> bool {
        types.iter().any(|t| self.accepts_type(t))
    }

    /// Whether two declarations could both claim the same context.
    pub fn overlaps(&self, other: &ContextTypes) -> bool {
        match (self, other) {
            (ContextTypes::Any, _) | (_, ContextTypes::Any) => true,
            (ContextTypes::Only(a), ContextTypes::Only(b)) => !a.is_disjoint(b),
        }
    }
}

impl fmt::Display for ContextTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextTypes::Any => f.write_str(ANY_CONTEXT_TYPE),
            ContextTypes::Only(set) => {
                let joined = set.iter().map(String::as_str).collect::<Vec<_>>().join(",");
                f.write_str(&joined)
            }
        }
    }
}
