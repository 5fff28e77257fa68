//! Data types for phase-synchronized job runs.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;

use rsrest_domain::{JobError, JobId, JobResult, RequestHandle};

use super::syncer::PhaseSyncer;

pub(crate) type BoxedHandler<T> =
    Box<dyn FnOnce(PhaseSyncer) -> BoxFuture<'static, JobResult<T>> + Send>;

/// One unit of work submitted to the scheduler.
///
/// The arguments are moved into the job when it is built and handed to the
/// handler together with the job's [`PhaseSyncer`].
pub struct Job<T> {
    pub(crate) request: RequestHandle,
    pub(crate) handler: BoxedHandler<T>,
}

impl<T: Send + 'static> Job<T> {
    pub fn new<A, F, Fut>(request: RequestHandle, args: A, handler: F) -> Self
    where
        A: Send + 'static,
        F: FnOnce(PhaseSyncer, A) -> Fut + Send + 'static,
        Fut: Future<Output = JobResult<T>> + Send + 'static,
    {
        Self {
            request,
            handler: Box::new(move |syncer| handler(syncer, args).boxed()),
        }
    }

    pub fn request(&self) -> &RequestHandle {
        &self.request
    }
}

impl<T> std::fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("request", &self.request).finish()
    }
}

/// Terminal outcome of one job.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement<T> {
    Fulfilled(T),
    Rejected(JobError),
}

impl<T> Settlement<T> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settlement::Fulfilled(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Settlement::Fulfilled(value) => Some(value),
            Settlement::Rejected(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&JobError> {
        match self {
            Settlement::Fulfilled(_) => None,
            Settlement::Rejected(err) => Some(err),
        }
    }

    pub fn into_result(self) -> JobResult<T> {
        match self {
            Settlement::Fulfilled(value) => Ok(value),
            Settlement::Rejected(err) => Err(err),
        }
    }
}

impl<T> From<JobResult<T>> for Settlement<T> {
    fn from(result: JobResult<T>) -> Self {
        match result {
            Ok(value) => Settlement::Fulfilled(value),
            Err(err) => Settlement::Rejected(err),
        }
    }
}

/// Counters collected while a run progresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettleReport {
    /// Phase starts that woke at least one job.
    pub phases_started: usize,
    /// Individual wake-ups, including queued jobs woken mid-phase.
    pub wakes: usize,
    /// Largest number of jobs awake at the same time.
    pub max_awake: usize,
    /// Individual before-phase hook invocations.
    pub hook_runs: usize,
}

/// Per-job state visible to before-phase hooks.
///
/// A job stages the data it wants coalesced before calling `phase()`; a hook
/// reads the staged values of every pending job and resolves each slot.
#[derive(Debug)]
pub struct JobSlot {
    id: JobId,
    request: RequestHandle,
    phase: AtomicU64,
    staged: Mutex<Option<Value>>,
    resolved: Mutex<Option<Value>>,
}

impl JobSlot {
    pub(crate) fn new(id: JobId, request: RequestHandle) -> Self {
        Self {
            id,
            request,
            phase: AtomicU64::new(0),
            staged: Mutex::new(None),
            resolved: Mutex::new(None),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn request(&self) -> &RequestHandle {
        &self.request
    }

    /// Number of `phase()` calls the job has made so far.
    pub fn phase(&self) -> u64 {
        self.phase.load(Ordering::SeqCst)
    }

    pub(crate) fn set_phase(&self, phase: u64) {
        self.phase.store(phase, Ordering::SeqCst);
    }

    pub fn stage(&self, value: Value) {
        *self.staged.lock() = Some(value);
    }

    pub fn staged(&self) -> Option<Value> {
        self.staged.lock().clone()
    }

    pub fn take_staged(&self) -> Option<Value> {
        self.staged.lock().take()
    }

    pub fn resolve(&self, value: Value) {
        *self.resolved.lock() = Some(value);
    }

    pub fn take_resolved(&self) -> Option<Value> {
        self.resolved.lock().take()
    }
}

/// Message from the scheduler to one syncer.
#[derive(Debug, Clone)]
pub(crate) enum Signal {
    Ready,
    Error(JobError),
}

/// Message from a syncer to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedulerEvent {
    /// First `phase()` call; the job finished its unsynchronized prologue.
    Arrived(JobId),
    /// The job finished step `step` and is waiting for the next wake.
    StepDone { id: JobId, step: u64 },
}

impl SchedulerEvent {
    pub(crate) fn job_id(self) -> JobId {
        match self {
            SchedulerEvent::Arrived(id) | SchedulerEvent::StepDone { id, .. } => id,
        }
    }
}
