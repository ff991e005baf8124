//! Error types produced by the record crate.
use thiserror::Error;

/// Errors raised while turning a resource into a [`Record`](crate::Record).
///
/// All variants are input problems; the caller handed us something that is not
/// a resource we can match on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RecordError {
    /// The resource is not a JSON object.
    #[error("resource must be a JSON object")]
    NotAnObject,

    /// `resourceType` is missing, not a string, or blank.
    #[error("resource is missing a resourceType")]
    MissingResourceType,

    /// `id` is missing, not a string, or blank.
    #[error("{0} resource is missing an id")]
    MissingId(String),
}
