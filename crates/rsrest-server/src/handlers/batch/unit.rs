//! Transaction boundary around each group of a batch.

use async_trait::async_trait;

use rsrest_domain::{DomainError, RequestHandle};

/// Opens, commits and rolls back the work of one group.
///
/// A flat batch is a single group. The executor calls `begin` before the
/// first job of a group runs, then `commit` when every job of the group
/// succeeded and `rollback` otherwise, so a failed mutating group leaves no
/// writes behind.
#[async_trait]
pub trait UnitOfWork<C>: Send + Sync {
    async fn begin(&self, shared: &C, group: &RequestHandle) -> Result<(), DomainError>;

    /// A commit error fails every sub-request of the group.
    async fn commit(&self, shared: &C, group: &RequestHandle) -> Result<(), DomainError>;

    async fn rollback(&self, shared: &C, group: &RequestHandle);
}
