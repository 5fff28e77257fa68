//! Error taxonomy for batch jobs and sub-requests.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position of a job in the list submitted to the scheduler.
///
/// Ids are dense and ordered: the first submitted job is `JobId(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub usize);

impl JobId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Error codes raised while validating and executing batch requests.
pub mod error_codes {
    /// A batch body mixes object elements with array elements.
    pub const BATCH_INVALID_TYPE_MIX: &str = "batch.invalid.type.mix";
    /// A sub-request href escapes the path the batch endpoint is mounted under.
    pub const HREF_ACROSS_BOUNDARY: &str = "href.across.boundary";
    /// A sub-request targets the batch endpoint itself.
    pub const BATCH_NOT_ALLOWED_IN_BATCH: &str = "batch.not.allowed.in.batch";
    /// A batch element is neither a sub-request object nor a group array.
    pub const BATCH_INVALID_ELEMENT: &str = "batch.invalid.element";
    /// The batch (or one of its groups) has no elements.
    pub const BATCH_EMPTY: &str = "batch.empty";
    /// The batch has more sub-requests than configured.
    pub const BATCH_TOO_LARGE: &str = "batch.too.large";
    /// No registered route matches the href and verb.
    pub const ROUTE_NOT_FOUND: &str = "route.not.found";
    /// Sibling cancelled, or client went away.
    pub const CANCELLED: &str = "cancelled";
    /// Unexpected failure inside the scheduler.
    pub const INTERNAL_ERROR: &str = "internal.error";
}

/// Status carried by a sibling cancelled after a hard failure in a mutating batch.
pub const CASCADE_STATUS: u16 = 202;

/// Status carried by jobs cancelled because the client went away.
pub const CLIENT_CANCELLED_STATUS: u16 = 0;

/// Application-level failure with an HTTP-style status and a stable code.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code} ({status}): {message}")]
pub struct DomainError {
    pub status: u16,
    pub code: String,
    pub message: String,
    /// Job this error belongs to, when it was raised on behalf of several jobs.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlates_to: Option<JobId>,
}

impl DomainError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            correlates_to: None,
        }
    }

    /// Attributes the error to a specific job.
    pub fn correlated(mut self, id: JobId) -> Self {
        self.correlates_to = Some(id);
        self
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(400, code, message)
    }

    pub fn invalid_type_mix() -> Self {
        Self::bad_request(
            error_codes::BATCH_INVALID_TYPE_MIX,
            "batch elements must be all objects or all arrays",
        )
    }

    pub fn across_boundary(href: &str, base: &str) -> Self {
        Self::bad_request(
            error_codes::HREF_ACROSS_BOUNDARY,
            format!("href '{href}' is outside of '{base}'"),
        )
    }

    pub fn batch_in_batch(href: &str) -> Self {
        Self::bad_request(
            error_codes::BATCH_NOT_ALLOWED_IN_BATCH,
            format!("href '{href}' targets the batch endpoint"),
        )
    }

    pub fn invalid_element(index: usize, message: impl fmt::Display) -> Self {
        Self::bad_request(
            error_codes::BATCH_INVALID_ELEMENT,
            format!("invalid batch element at index {index}: {message}"),
        )
    }

    pub fn empty_batch() -> Self {
        Self::bad_request(error_codes::BATCH_EMPTY, "batch request cannot be empty")
    }

    pub fn batch_too_large(size: usize, max: usize) -> Self {
        Self::new(
            413,
            error_codes::BATCH_TOO_LARGE,
            format!("batch size {size} exceeds maximum allowed {max}"),
        )
    }

    pub fn route_not_found(verb: &str, href: &str) -> Self {
        Self::new(
            404,
            error_codes::ROUTE_NOT_FOUND,
            format!("no route for {verb} {href}"),
        )
    }
}

/// Outcome of a failed job.
///
/// The scheduler decides which job receives which variant; it never
/// suppresses an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Failure raised by the job's own logic (or by a hook on its behalf).
    #[error(transparent)]
    Domain(DomainError),

    /// A sibling failed in a mutating batch; this job was stopped early.
    #[error("cancelled because a sibling request failed")]
    Cascade,

    /// The client cancelled the root request.
    #[error("cancelled by client")]
    ClientCancelled,

    /// The scheduler itself failed.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl JobError {
    pub fn internal(message: impl Into<String>) -> Self {
        JobError::Internal {
            message: message.into(),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            JobError::Domain(err) => err.status,
            JobError::Cascade => CASCADE_STATUS,
            JobError::ClientCancelled => CLIENT_CANCELLED_STATUS,
            JobError::Internal { .. } => 500,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            JobError::Domain(err) => &err.code,
            JobError::Cascade | JobError::ClientCancelled => error_codes::CANCELLED,
            JobError::Internal { .. } => error_codes::INTERNAL_ERROR,
        }
    }

    pub fn correlates_to(&self) -> Option<JobId> {
        match self {
            JobError::Domain(err) => err.correlates_to,
            _ => None,
        }
    }

    /// True for the two cancellation variants.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, JobError::Cascade | JobError::ClientCancelled)
    }
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        JobError::Domain(err)
    }
}

/// Result type for job handlers.
pub type JobResult<T> = Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_code_per_variant() {
        let domain: JobError = DomainError::new(409, "row.conflict", "duplicate key").into();
        assert_eq!(domain.status(), 409);
        assert_eq!(domain.code(), "row.conflict");

        assert_eq!(JobError::Cascade.status(), 202);
        assert_eq!(JobError::Cascade.code(), "cancelled");

        assert_eq!(JobError::ClientCancelled.status(), 0);
        assert_eq!(JobError::ClientCancelled.code(), "cancelled");

        let internal = JobError::internal("boom");
        assert_eq!(internal.status(), 500);
        assert_eq!(internal.code(), "internal.error");
        assert!(internal.to_string().contains("boom"));
    }

    #[test]
    fn test_correlation_only_on_domain_errors() {
        let err: JobError = DomainError::bad_request("x", "y").correlated(JobId(3)).into();
        assert_eq!(err.correlates_to(), Some(JobId(3)));
        assert_eq!(JobError::Cascade.correlates_to(), None);
    }

    #[test]
    fn test_batch_validation_constructors_use_stable_codes() {
        assert_eq!(DomainError::invalid_type_mix().code, "batch.invalid.type.mix");
        assert_eq!(
            DomainError::across_boundary("/x", "/api/").code,
            "href.across.boundary"
        );
        assert_eq!(
            DomainError::batch_in_batch("/api/batch").code,
            "batch.not.allowed.in.batch"
        );
        let too_large = DomainError::batch_too_large(101, 100);
        assert_eq!(too_large.status, 413);
        assert!(too_large.message.contains("101"));
    }
}
