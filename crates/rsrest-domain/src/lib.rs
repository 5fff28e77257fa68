//! rsrest-domain: Core value types shared by the rsrest crates
//!
//! This crate contains:
//! - Request handles for batch sub-requests (arena with parent links)
//! - The job error taxonomy used by the batch scheduler
//! - Sub-request / sub-response value types
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                rsrest-domain                 │
//! ├─────────────────────────────────────────────┤
//! │  request.rs - Request arena & handles       │
//! │  error.rs   - DomainError / JobError        │
//! │  http.rs    - Verb, SubRequest, SubResponse │
//! └─────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod http;
pub mod request;

// Re-export commonly used types at the crate root
pub use error::{DomainError, JobError, JobId, JobResult, CASCADE_STATUS, CLIENT_CANCELLED_STATUS};
pub use http::{SubRequest, SubResponse, UnknownVerb, Verb};
pub use request::{RequestArena, RequestHandle, RequestId};
