//! Before-phase hook that merges staged per-job work into one call.
//!
//! Each job stages a value (a row to insert, a key to look up, ...) and calls
//! `phase()`. When the next phase starts, the hook gathers every staged value,
//! loads the unique ones with a single [`BatchLoader::load_many`] call and
//! hands each job its own result through its slot.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use rsrest_domain::{JobError, JobId, RequestHandle};

use super::hook::{BeforePhaseHook, PhaseContext};

/// One unique staged value and the jobs that staged it.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedKey {
    pub jobs: Vec<JobId>,
    pub value: Value,
}

/// Executes many staged operations at once.
#[async_trait]
pub trait BatchLoader: Send + Sync {
    /// Returns one result per key, in the same order as `keys`.
    ///
    /// Errors meant for a single job should carry that job's id
    /// (`DomainError::correlated`).
    async fn load_many(
        &self,
        root: &RequestHandle,
        keys: &[StagedKey],
    ) -> Result<Vec<Value>, JobError>;
}

/// Hook adapter around a [`BatchLoader`].
pub struct CoalescingHook<L> {
    loader: L,
}

impl<L: BatchLoader> CoalescingHook<L> {
    pub fn new(loader: L) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }
}

/// Groups staged values so identical ones are loaded once.
pub(crate) fn group_staged(ctx: &PhaseContext<'_>) -> Vec<StagedKey> {
    let mut keys: Vec<StagedKey> = Vec::new();
    let mut index_by_value: HashMap<String, usize> = HashMap::new();

    for slot in ctx.pending_slots() {
        let Some(value) = slot.take_staged() else {
            continue;
        };
        let canonical = value.to_string();
        match index_by_value.get(&canonical) {
            Some(&index) => keys[index].jobs.push(slot.id()),
            None => {
                index_by_value.insert(canonical, keys.len());
                keys.push(StagedKey {
                    jobs: vec![slot.id()],
                    value,
                });
            }
        }
    }
    keys
}

#[async_trait]
impl<L: BatchLoader> BeforePhaseHook for CoalescingHook<L> {
    async fn before_phase(
        &self,
        root: &RequestHandle,
        ctx: &PhaseContext<'_>,
    ) -> Result<(), JobError> {
        let keys = group_staged(ctx);
        if keys.is_empty() {
            return Ok(());
        }
        let staged_jobs: usize = keys.iter().map(|key| key.jobs.len()).sum();
        debug!(unique = keys.len(), jobs = staged_jobs, "coalescing staged operations");

        let results = self.loader.load_many(root, &keys).await?;
        if results.len() != keys.len() {
            return Err(JobError::internal(format!(
                "loader returned {} results for {} keys",
                results.len(),
                keys.len()
            )));
        }

        for (key, result) in keys.iter().zip(results) {
            for id in &key.jobs {
                if let Some(slot) = ctx.jobs.get(id) {
                    slot.resolve(result.clone());
                }
            }
        }
        Ok(())
    }
}
