use bincode::error::{DecodeError, EncodeError};
use candidate::{CandidateError, RepositoryError};
use matcher::MatchError;
use thiserror::Error;

use crate::types::LinkMatchResult;

/// Errors raised by link management.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LinkError {
    #[error("invalid mdm rules: {0}")]
    InvalidRules(String),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Candidate(#[from] CandidateError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("link backend error: {0}")]
    Backend(String),
    #[error("link encode error: {0}")]
    Encode(String),
    #[error("link decode error: {0}")]
    Decode(String),
    /// A bucket changed between read and commit. The operation may be retried.
    #[error("version conflict on `{key}`: expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("no link between {source_id} and golden record {golden_id}")]
    LinkNotFound { source_id: String, golden_id: String },
    #[error("{0} cannot be set manually")]
    InvalidManualResult(LinkMatchResult),
    #[error("golden record {0} not found")]
    GoldenNotFound(String),
    #[error("invalid merge: {0}")]
    InvalidMerge(String),
}

impl From<EncodeError> for LinkError {
    fn from(e: EncodeError) -> Self {
        LinkError::Encode(e.to_string())
    }
}

impl From<DecodeError> for LinkError {
    fn from(e: DecodeError) -> Self {
        LinkError::Decode(e.to_string())
    }
}

impl LinkError {
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        LinkError::Backend(err.to_string())
    }

    /// Failures that a fresh attempt may not hit again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkError::VersionConflict { .. })
    }
}
