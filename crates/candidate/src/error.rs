use thiserror::Error;

/// Failures reported by a [`RecordRepository`](crate::RecordRepository).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RepositoryError {
    #[error("repository backend error: {0}")]
    Backend(String),
    #[error("record {0} not found")]
    NotFound(String),
    #[error("golden record creation failed: {0}")]
    GoldenCreation(String),
}

impl RepositoryError {
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        RepositoryError::Backend(err.to_string())
    }
}

/// Errors raised while building or running candidate searches.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CandidateError {
    #[error("unknown search parameter `{search_param}` for resource type {resource_type}")]
    UnknownSearchParam {
        resource_type: String,
        search_param: String,
    },
    #[error("cannot build a {expected} query from a {actual} record")]
    ResourceTypeMismatch { expected: String, actual: String },
    #[error("malformed candidate query `{query}`: {reason}")]
    MalformedQuery { query: String, reason: String },
    #[error("candidate search for {resource_type} returned {found} records, limit is {limit}")]
    TooManyCandidates {
        resource_type: String,
        found: usize,
        limit: usize,
    },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl CandidateError {
    pub(crate) fn malformed<Q: Into<String>, R: Into<String>>(query: Q, reason: R) -> Self {
        CandidateError::MalformedQuery {
            query: query.into(),
            reason: reason.into(),
        }
    }
}
