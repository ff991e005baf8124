//! Core data model types for the record crate.
//!
//! ```text
//! Record
//! ├── resource_type: String   ("Patient", "Practitioner", ...)
//! ├── id: RecordId
//! ├── golden: bool
//! └── fields: BTreeMap<path, Vec<FieldValue>>
//!     ├── Text(String)
//!     └── Identifier { system, value }
//! ```
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::RecordError;
use crate::flatten::{flatten_resource, is_golden_resource};
use crate::IDENTIFIER_PATH;

/// Logical id of a record within its resource type.
pub type RecordId = String;

/// A single value found at a field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldValue {
    /// Any scalar rendered as text (strings, dates, codes, numbers, booleans).
    Text(String),
    /// An identifier with an optional namespace.
    Identifier {
        system: Option<String>,
        value: String,
    },
}

impl FieldValue {
    pub fn text<S: Into<String>>(value: S) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn identifier<S: Into<String>>(system: Option<&str>, value: S) -> Self {
        FieldValue::Identifier {
            system: system.map(str::to_string),
            value: value.into(),
        }
    }

    /// The textual part of the value. Identifiers yield their `value`.
    pub fn as_text(&self) -> &str {
        match self {
            FieldValue::Text(text) => text,
            FieldValue::Identifier { value, .. } => value,
        }
    }

    /// Namespace of an identifier, `None` for text.
    pub fn system(&self) -> Option<&str> {
        match self {
            FieldValue::Text(_) => None,
            FieldValue::Identifier { system, .. } => system.as_deref(),
        }
    }

    /// Search token form: `system|value` for identifiers with a system,
    /// the bare text otherwise.
    pub fn search_token(&self) -> String {
        match self {
            FieldValue::Identifier {
                system: Some(system),
                value,
            } => format!("{system}|{value}"),
            other => other.as_text().to_string(),
        }
    }

    /// Whitespace-only values carry no information.
    pub fn is_blank(&self) -> bool {
        self.as_text().trim().is_empty()
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.search_token())
    }
}

/// Immutable snapshot of a resource as seen by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    resource_type: String,
    id: RecordId,
    #[serde(default)]
    golden: bool,
    #[serde(default)]
    fields: BTreeMap<String, Vec<FieldValue>>,
}

impl Record {
    pub fn new<T: Into<String>, I: Into<RecordId>>(resource_type: T, id: I) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            golden: false,
            fields: BTreeMap::new(),
        }
    }

    /// Build a record from a JSON resource.
    pub fn from_json(resource: &JsonValue) -> Result<Self, RecordError> {
        let object = resource.as_object().ok_or(RecordError::NotAnObject)?;

        let resource_type = object
            .get("resourceType")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(RecordError::MissingResourceType)?;

        let id = object
            .get("id")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RecordError::MissingId(resource_type.to_string()))?;

        let fields = flatten_resource(resource);
        let golden = is_golden_resource(resource);
        debug!(
            resource_type,
            record_id = id,
            paths = fields.len(),
            golden,
            "record_flattened"
        );

        Ok(Self {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            golden,
            fields,
        })
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `Type/id`, used in logs and traces.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    pub fn is_golden(&self) -> bool {
        self.golden
    }

    pub fn with_golden(mut self, golden: bool) -> Self {
        self.golden = golden;
        self
    }

    pub fn with_value<P: Into<String>>(mut self, path: P, value: FieldValue) -> Self {
        self.push_value(path, value);
        self
    }

    pub fn with_text<P: Into<String>, S: Into<String>>(self, path: P, text: S) -> Self {
        self.with_value(path, FieldValue::text(text))
    }

    pub fn with_identifier<S: Into<String>>(self, system: Option<&str>, value: S) -> Self {
        self.with_value(IDENTIFIER_PATH, FieldValue::identifier(system, value))
    }

    pub fn push_value<P: Into<String>>(&mut self, path: P, value: FieldValue) {
        self.fields.entry(path.into()).or_default().push(value);
    }

    /// Drop every value stored at `path`.
    pub fn clear_path(&mut self, path: &str) {
        self.fields.remove(path);
    }

    /// Values at `path`, in insertion order. Missing paths yield an empty slice.
    pub fn values(&self, path: &str) -> &[FieldValue] {
        self.fields.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Values at `path` that are not blank.
    pub fn populated_values(&self, path: &str) -> Vec<&FieldValue> {
        self.values(path).iter().filter(|v| !v.is_blank()).collect()
    }

    /// True when `path` has no values or only blank ones.
    pub fn is_empty_at(&self, path: &str) -> bool {
        self.values(path).iter().all(FieldValue::is_blank)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, Vec<FieldValue>> {
        &self.fields
    }

    /// Identifier values issued under `system`.
    pub fn identifiers_in(&self, system: &str) -> Vec<&str> {
        self.values(IDENTIFIER_PATH)
            .iter()
            .filter(|v| v.system() == Some(system))
            .map(FieldValue::as_text)
            .filter(|v| !v.trim().is_empty())
            .collect()
    }

    /// Copy of this record's fields under a new id, flagged golden.
    pub fn to_golden<I: Into<RecordId>>(&self, golden_id: I) -> Record {
        Record {
            resource_type: self.resource_type.clone(),
            id: golden_id.into(),
            golden: true,
            fields: self.fields.clone(),
        }
    }
}
