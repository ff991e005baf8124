//! MDM Record Layer
//!
//! Everything the matching core knows about a resource lives in a [`Record`]:
//! its resource type, its id, whether it is a golden record, and a map from
//! dotted field paths (`name.given`, `identifier`) to the values found there.
//!
//! ## What we do here
//!
//! - **Model the snapshot** - records are plain data, cloned into the matcher
//!   and never mutated while a match runs.
//! - **Flatten resources** - [`Record::from_json`] turns a FHIR-style JSON
//!   resource into path/value pairs. Arrays are transparent, identifiers keep
//!   their `system|value` structure.
//! - **Define emptiness** - a whitespace-only value is blank, and a path with
//!   only blank values counts as empty. Matchers rely on this.
//!
//! ## Example
//!
//! ```
//! use record::{FieldValue, Record};
//! use serde_json::json;
//!
//! let resource = json!({
//!     "resourceType": "Patient",
//!     "id": "pat-1",
//!     "name": [{ "given": ["Jose", "Martin"], "family": "Fernandez" }],
//!     "identifier": [{ "system": "http://acme.org/mrn", "value": "12345" }]
//! });
//!
//! let record = Record::from_json(&resource).unwrap();
//! assert_eq!(record.resource_type(), "Patient");
//! assert_eq!(record.values("name.given").len(), 2);
//! assert_eq!(
//!     record.values("identifier")[0],
//!     FieldValue::identifier(Some("http://acme.org/mrn"), "12345")
//! );
//! ```

mod error;
mod flatten;
mod types;

pub use crate::error::RecordError;
pub use crate::flatten::flatten_resource;
pub use crate::types::{FieldValue, Record, RecordId};

/// Tag code that marks a resource as a golden record.
pub const GOLDEN_RECORD_TAG: &str = "GOLDEN_RECORD";

/// Tag system under which [`GOLDEN_RECORD_TAG`] is published.
pub const RECORD_STATUS_SYSTEM: &str = "http://hapifhir.io/fhir/NamingSystem/mdm-record-status";

/// Path under which identifiers are flattened.
pub const IDENTIFIER_PATH: &str = "identifier";
