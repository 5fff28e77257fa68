//! Batch endpoint: many sub-requests in one HTTP request.
//!
//! A batch body is either a flat array of `{href, verb, body}` objects or an
//! array of such arrays:
//!
//! 1. **Flat**: all sub-requests run as one phase-synchronized run, at most
//!    `concurrency` awake at a time
//! 2. **Grouped**: groups run one after another; the members of a group run
//!    together like a flat batch
//!
//! Each group runs inside an optional [`UnitOfWork`]: committed when all of
//! its sub-requests succeed, rolled back otherwise.
//!
//! Hrefs are normalized against the path the batch endpoint is mounted under
//! and routed before anything runs. The batch status is the highest leaf
//! status, or 403 as soon as any leaf was forbidden.

mod builder;
mod executor;
mod types;
mod unit;

pub use builder::{base_path, normalize_href};
pub use executor::{register_batch_route, BatchExecutor, BatchRoute};
pub use types::{aggregate_status, BatchBody, BatchOutcome, FORBIDDEN_STATUS};
pub use unit::UnitOfWork;
