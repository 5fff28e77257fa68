//! Phase-synchronized settle controller.
//!
//! Runs a list of jobs concurrently while keeping them lock-stepped through
//! their `phase()` checkpoints:
//!
//! 1. Every job runs its prologue immediately, up to its first `phase()` call.
//! 2. Once all jobs have arrived (or finished), a phase starts: before-phase
//!    hooks run once for the whole wave, then up to `concurrency` jobs are
//!    woken. The rest are queued and woken one at a time as slots free up.
//! 3. A new phase starts only when every job tracked by the current phase
//!    has reported its step done or has finished.
//!
//! All bookkeeping happens on the task that polls the jobs, so the protocol
//! itself is single-threaded. Work a job does between two checkpoints (e.g. a
//! database round-trip) still overlaps with the work of other awake jobs.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use rsrest_domain::{JobError, JobId, RequestHandle};

use super::hook::{BeforePhaseHook, PhaseContext};
use super::syncer::PhaseSyncer;
use super::types::{Job, JobSlot, SchedulerEvent, SettleReport, Settlement, Signal};

/// Bookkeeping failure inside the controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("event from unknown {0}")]
    UnknownJob(JobId),

    #[error("{0} reported its first checkpoint twice")]
    DuplicateArrival(JobId),

    #[error("{id} reported step {step} without being woken")]
    StepWithoutWake { id: JobId, step: u64 },

    #[error("{0} settled twice")]
    SettledTwice(JobId),
}

/// Runs `jobs` to completion and returns one settlement per job, in input order.
pub async fn run_phase_synced_settle<T: Send + 'static>(
    root: &RequestHandle,
    jobs: Vec<Job<T>>,
    concurrency: usize,
    hooks: &[Arc<dyn BeforePhaseHook>],
) -> Vec<Settlement<T>> {
    run_phase_synced_settle_with_report(root, jobs, concurrency, hooks)
        .await
        .0
}

/// Same as [`run_phase_synced_settle`], also returning run statistics.
pub async fn run_phase_synced_settle_with_report<T: Send + 'static>(
    root: &RequestHandle,
    jobs: Vec<Job<T>>,
    concurrency: usize,
    hooks: &[Arc<dyn BeforePhaseHook>],
) -> (Vec<Settlement<T>>, SettleReport) {
    let concurrency = if concurrency == 0 {
        warn!("phase concurrency of 0 requested, using 1");
        1
    } else {
        concurrency
    };
    let total = jobs.len();
    debug!(root = %root.id(), jobs = total, concurrency, "running phase-synced jobs");

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut controller = PhaseController::new(root.clone(), concurrency);
    let mut running = FuturesUnordered::new();

    for (index, job) in jobs.into_iter().enumerate() {
        let id = JobId(index);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let slot = Arc::new(JobSlot::new(id, job.request.clone()));
        controller.register(id, Arc::clone(&slot), signal_tx);

        let syncer = PhaseSyncer::new(slot, signal_rx, events_tx.clone());
        let future = (job.handler)(syncer);
        running.push(async move {
            let result = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(JobError::internal("job panicked")));
            (id, result)
        });
    }
    drop(events_tx);

    let mut outcomes: Vec<Option<Settlement<T>>> = (0..total).map(|_| None).collect();

    while !running.is_empty() {
        tokio::select! {
            biased;

            Some(event) = events_rx.recv() => {
                controller.handle_event(event, hooks).await;
            }

            Some((id, result)) = running.next() => {
                // Apply whatever the job reported before it finished.
                while let Ok(event) = events_rx.try_recv() {
                    controller.handle_event(event, hooks).await;
                }
                let fulfilled = result.is_ok();
                if let Err(err) = &result {
                    debug!(job = %id, status = err.status(), code = err.code(), "job rejected");
                }
                outcomes[id.index()] = Some(result.into());
                controller.handle_settled(id, fulfilled, hooks).await;
            }
        }
    }

    let settlements = outcomes
        .into_iter()
        .map(|outcome| {
            outcome.unwrap_or_else(|| Settlement::Rejected(JobError::internal("job never settled")))
        })
        .collect();
    (settlements, controller.report)
}

/// Scheduler state for one run.
///
/// Between events: `phase_pending`, `queued` and `awake` are subsets of
/// `pending`; `queued` and `awake` are disjoint; `awake` never holds more
/// than `concurrency` ids.
struct PhaseController {
    root: RequestHandle,
    concurrency: usize,
    jobs: BTreeMap<JobId, Arc<JobSlot>>,
    requests: BTreeMap<JobId, RequestHandle>,
    signals: BTreeMap<JobId, mpsc::UnboundedSender<Signal>>,
    pending: BTreeSet<JobId>,
    phase_pending: BTreeSet<JobId>,
    queued: BTreeSet<JobId>,
    awake: BTreeSet<JobId>,
    /// Jobs still running their prologue.
    unarrived: BTreeSet<JobId>,
    /// Jobs that have already been sent an error.
    errored: BTreeSet<JobId>,
    started: bool,
    failure_broadcast: bool,
    poisoned: bool,
    report: SettleReport,
}

impl PhaseController {
    fn new(root: RequestHandle, concurrency: usize) -> Self {
        Self {
            root,
            concurrency,
            jobs: BTreeMap::new(),
            requests: BTreeMap::new(),
            signals: BTreeMap::new(),
            pending: BTreeSet::new(),
            phase_pending: BTreeSet::new(),
            queued: BTreeSet::new(),
            awake: BTreeSet::new(),
            unarrived: BTreeSet::new(),
            errored: BTreeSet::new(),
            started: false,
            failure_broadcast: false,
            poisoned: false,
            report: SettleReport::default(),
        }
    }

    fn register(&mut self, id: JobId, slot: Arc<JobSlot>, signal: mpsc::UnboundedSender<Signal>) {
        self.requests.insert(id, slot.request().clone());
        self.jobs.insert(id, slot);
        self.signals.insert(id, signal);
        self.pending.insert(id);
        self.unarrived.insert(id);
    }

    async fn handle_event(&mut self, event: SchedulerEvent, hooks: &[Arc<dyn BeforePhaseHook>]) {
        if self.poisoned {
            debug!(job = %event.job_id(), "ignoring event after internal failure");
            return;
        }
        let result = match event {
            SchedulerEvent::Arrived(id) => self.on_arrived(id, hooks).await,
            SchedulerEvent::StepDone { id, step } => self.on_step_done(id, step, hooks).await,
        };
        if let Err(err) = result {
            self.poison(err);
        }
    }

    async fn handle_settled(
        &mut self,
        id: JobId,
        fulfilled: bool,
        hooks: &[Arc<dyn BeforePhaseHook>],
    ) {
        if self.poisoned {
            self.forget(id);
            return;
        }
        if let Err(err) = self.on_settled(id, fulfilled, hooks).await {
            self.poison(err);
        }
    }

    async fn on_arrived(
        &mut self,
        id: JobId,
        hooks: &[Arc<dyn BeforePhaseHook>],
    ) -> Result<(), SchedulerError> {
        self.check_known(id)?;
        if !self.pending.contains(&id) {
            debug!(job = %id, "stale arrival");
            return Ok(());
        }
        if !self.unarrived.remove(&id) {
            return Err(SchedulerError::DuplicateArrival(id));
        }
        self.maybe_start(hooks).await;
        Ok(())
    }

    async fn on_step_done(
        &mut self,
        id: JobId,
        step: u64,
        hooks: &[Arc<dyn BeforePhaseHook>],
    ) -> Result<(), SchedulerError> {
        self.check_known(id)?;
        if !self.pending.contains(&id) {
            debug!(job = %id, step, "stale step report");
            return Ok(());
        }
        if !self.awake.remove(&id) {
            return Err(SchedulerError::StepWithoutWake { id, step });
        }
        self.phase_pending.remove(&id);

        if self.root.is_cancelled() && !self.failure_broadcast {
            warn!(root = %self.root.id(), job = %id, "request cancelled, failing pending jobs");
            self.broadcast(JobError::ClientCancelled);
        }

        self.advance(true, hooks).await;
        Ok(())
    }

    async fn on_settled(
        &mut self,
        id: JobId,
        fulfilled: bool,
        hooks: &[Arc<dyn BeforePhaseHook>],
    ) -> Result<(), SchedulerError> {
        self.check_known(id)?;
        if !self.pending.contains(&id) {
            return Err(SchedulerError::SettledTwice(id));
        }
        let freed_slot = self.forget(id);

        if !fulfilled && !self.root.is_read_only() && !self.failure_broadcast {
            warn!(
                root = %self.root.id(),
                job = %id,
                pending = self.pending.len(),
                "job failed in a mutating batch, cancelling pending siblings"
            );
            self.broadcast(JobError::Cascade);
        }

        self.advance(freed_slot, hooks).await;
        Ok(())
    }

    /// Removes a finished job from every set. Returns whether it was awake.
    fn forget(&mut self, id: JobId) -> bool {
        self.pending.remove(&id);
        self.phase_pending.remove(&id);
        self.queued.remove(&id);
        self.unarrived.remove(&id);
        self.awake.remove(&id)
    }

    async fn advance(&mut self, freed_slot: bool, hooks: &[Arc<dyn BeforePhaseHook>]) {
        if !self.started {
            self.maybe_start(hooks).await;
        } else if self.phase_pending.is_empty() {
            self.start_new_phase(hooks).await;
        } else if freed_slot {
            if let Some(next) = self.queued.pop_first() {
                self.wake(next);
            }
        }
    }

    async fn maybe_start(&mut self, hooks: &[Arc<dyn BeforePhaseHook>]) {
        if !self.started && self.unarrived.is_empty() {
            self.started = true;
            self.start_new_phase(hooks).await;
        }
    }

    async fn start_new_phase(&mut self, hooks: &[Arc<dyn BeforePhaseHook>]) {
        let mut to_wake: Vec<JobId> = self.pending.iter().take(self.concurrency).copied().collect();
        self.queued = self.pending.iter().skip(self.concurrency).copied().collect();
        self.phase_pending = self.pending.clone();

        if to_wake.is_empty() {
            return;
        }
        if self.failure_broadcast {
            debug!(pending = self.pending.len(), "run is failing, not starting a new phase");
            return;
        }
        if self.root.is_cancelled() {
            warn!(root = %self.root.id(), "request cancelled before phase start");
            self.broadcast(JobError::ClientCancelled);
            return;
        }

        self.report.phases_started += 1;
        debug!(
            phase = self.report.phases_started,
            waking = ?to_wake,
            queued = self.queued.len(),
            "starting phase"
        );

        let (runs, result) = self.run_hooks(&to_wake, hooks).await;
        self.report.hook_runs += runs;

        if let Err(err) = result {
            // Without a correlating id in this wave the first job of the wave
            // takes the blame.
            let target = err
                .correlates_to()
                .filter(|id| to_wake.contains(id))
                .unwrap_or(to_wake[0]);
            warn!(job = %target, code = err.code(), error = %err, "before-phase hook failed");
            self.fail_job(target, err);

            if !self.root.is_read_only() {
                self.broadcast(JobError::Cascade);
                return;
            }
            to_wake.retain(|id| *id != target);
            if let Some(next) = self.queued.pop_first() {
                to_wake.push(next);
            }
        }

        for id in to_wake {
            self.wake(id);
        }
    }

    async fn run_hooks(
        &self,
        waking: &[JobId],
        hooks: &[Arc<dyn BeforePhaseHook>],
    ) -> (usize, Result<(), JobError>) {
        let ctx = PhaseContext {
            requests: &self.requests,
            jobs: &self.jobs,
            pending: &self.pending,
            waking,
        };
        let mut runs = 0;
        for hook in hooks {
            runs += 1;
            if let Err(err) = hook.before_phase(&self.root, &ctx).await {
                return (runs, Err(err));
            }
        }
        (runs, Ok(()))
    }

    fn wake(&mut self, id: JobId) {
        if self.errored.contains(&id) {
            return;
        }
        if let Some(signal) = self.signals.get(&id) {
            // A closed channel means the job dropped its syncer; it is still
            // running and will settle on its own.
            let _ = signal.send(Signal::Ready);
        }
        self.awake.insert(id);
        self.report.wakes += 1;
        self.report.max_awake = self.report.max_awake.max(self.awake.len());
    }

    fn fail_job(&mut self, id: JobId, err: JobError) {
        if !self.errored.insert(id) {
            return;
        }
        if let Some(signal) = self.signals.get(&id) {
            let _ = signal.send(Signal::Error(err));
        }
    }

    fn broadcast(&mut self, err: JobError) {
        self.failure_broadcast = true;
        let targets: Vec<JobId> = self.pending.iter().copied().collect();
        for id in targets {
            self.fail_job(id, err.clone());
        }
    }

    fn poison(&mut self, err: SchedulerError) {
        error!(root = %self.root.id(), error = %err, "phase scheduler failed");
        self.poisoned = true;
        self.broadcast(JobError::internal("batch scheduling failed"));
    }

    fn check_known(&self, id: JobId) -> Result<(), SchedulerError> {
        if self.jobs.contains_key(&id) {
            Ok(())
        } else {
            Err(SchedulerError::UnknownJob(id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsrest_domain::{RequestArena, Verb};

    fn controller_with(jobs: usize, concurrency: usize) -> (PhaseController, Vec<mpsc::UnboundedReceiver<Signal>>) {
        let arena = RequestArena::new();
        let root = arena.root(Verb::Post, "/api/batch", false);
        let mut controller = PhaseController::new(root.clone(), concurrency);
        let mut receivers = Vec::new();
        for index in 0..jobs {
            let (tx, rx) = mpsc::unbounded_channel();
            let request = arena.child(&root, Verb::Post, "/api/rows", false);
            controller.register(JobId(index), Arc::new(JobSlot::new(JobId(index), request)), tx);
            receivers.push(rx);
        }
        (controller, receivers)
    }

    #[tokio::test]
    async fn test_first_phase_waits_for_every_arrival() {
        let (mut controller, mut receivers) = controller_with(3, 2);

        controller.handle_event(SchedulerEvent::Arrived(JobId(0)), &[]).await;
        controller.handle_event(SchedulerEvent::Arrived(JobId(1)), &[]).await;
        assert!(!controller.started);
        assert!(receivers[0].try_recv().is_err());

        controller.handle_event(SchedulerEvent::Arrived(JobId(2)), &[]).await;
        assert!(controller.started);
        assert!(matches!(receivers[0].try_recv(), Ok(Signal::Ready)));
        assert!(matches!(receivers[1].try_recv(), Ok(Signal::Ready)));
        assert!(receivers[2].try_recv().is_err());
        assert_eq!(controller.queued.iter().copied().collect::<Vec<_>>(), vec![JobId(2)]);
    }

    #[tokio::test]
    async fn test_step_done_wakes_one_queued_job() {
        let (mut controller, mut receivers) = controller_with(3, 1);
        for index in 0..3 {
            controller.handle_event(SchedulerEvent::Arrived(JobId(index)), &[]).await;
        }
        assert!(matches!(receivers[0].try_recv(), Ok(Signal::Ready)));

        controller
            .handle_event(SchedulerEvent::StepDone { id: JobId(0), step: 1 }, &[])
            .await;
        assert!(matches!(receivers[1].try_recv(), Ok(Signal::Ready)));
        assert!(receivers[2].try_recv().is_err());
        assert_eq!(controller.awake.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_job_poisons_and_broadcasts_internal_error() {
        let (mut controller, mut receivers) = controller_with(2, 2);

        controller.handle_event(SchedulerEvent::Arrived(JobId(7)), &[]).await;

        assert!(controller.poisoned);
        for receiver in &mut receivers {
            match receiver.try_recv() {
                Ok(Signal::Error(err)) => assert_eq!(err.status(), 500),
                other => panic!("expected internal error, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_step_without_wake_is_an_internal_error() {
        let (mut controller, mut receivers) = controller_with(2, 1);
        controller.handle_event(SchedulerEvent::Arrived(JobId(0)), &[]).await;
        controller.handle_event(SchedulerEvent::Arrived(JobId(1)), &[]).await;
        let _ = receivers[0].try_recv();

        // Job 1 is queued, so it cannot have finished a step.
        controller
            .handle_event(SchedulerEvent::StepDone { id: JobId(1), step: 1 }, &[])
            .await;

        assert!(controller.poisoned);
        assert!(matches!(receivers[1].try_recv(), Ok(Signal::Error(JobError::Internal { .. }))));
    }
}
