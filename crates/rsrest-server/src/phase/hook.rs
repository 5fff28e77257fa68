//! Before-phase hooks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;

use rsrest_domain::{JobError, JobId, RequestHandle};

use super::types::JobSlot;

/// What a hook can see when a new phase starts.
///
/// Every id in `pending` is suspended at the same checkpoint, so whatever
/// those jobs staged is complete.
#[derive(Debug, Clone, Copy)]
pub struct PhaseContext<'a> {
    pub requests: &'a BTreeMap<JobId, RequestHandle>,
    pub jobs: &'a BTreeMap<JobId, Arc<JobSlot>>,
    pub pending: &'a BTreeSet<JobId>,
    /// Ids about to be woken by this phase start.
    pub waking: &'a [JobId],
}

impl<'a> PhaseContext<'a> {
    /// Slots of all pending jobs, in submission order.
    pub fn pending_slots(&self) -> impl Iterator<Item = &'a Arc<JobSlot>> + 'a {
        let jobs = self.jobs;
        self.pending.iter().filter_map(move |id| jobs.get(id))
    }
}

/// Callback run once per phase start, before any job is woken.
///
/// Hooks run one after another. An error stops the remaining hooks and is
/// delivered to the job it correlates with (see [`JobError::correlates_to`]),
/// or to the first job of the wave otherwise.
#[async_trait]
pub trait BeforePhaseHook: Send + Sync {
    async fn before_phase(
        &self,
        root: &RequestHandle,
        ctx: &PhaseContext<'_>,
    ) -> Result<(), JobError>;
}

