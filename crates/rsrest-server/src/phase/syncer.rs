//! Per-job synchronization handle.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use rsrest_domain::{JobError, JobId, RequestHandle};

use super::types::{JobSlot, SchedulerEvent, Signal};

/// Handle a job uses to wait for its peers at a synchronization point.
///
/// Each call to [`phase`](PhaseSyncer::phase) is a checkpoint. Phase numbers
/// are per job: two jobs in the same run may call `phase()` a different
/// number of times.
///
/// # Cancel safety
///
/// A `phase()` future may be dropped before it resolves (under a timeout or
/// in a `select!`). The checkpoint it reported stays outstanding: the next
/// call resumes waiting for the same wake-up instead of reporting again.
#[derive(Debug)]
pub struct PhaseSyncer {
    slot: Arc<JobSlot>,
    phase_counter: u64,
    signals: mpsc::UnboundedReceiver<Signal>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    failed: Option<JobError>,
    /// A checkpoint was reported and its wake-up not yet received.
    awaiting: bool,
}

impl PhaseSyncer {
    pub(crate) fn new(
        slot: Arc<JobSlot>,
        signals: mpsc::UnboundedReceiver<Signal>,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        Self {
            slot,
            phase_counter: 0,
            signals,
            events,
            failed: None,
            awaiting: false,
        }
    }

    pub fn id(&self) -> JobId {
        self.slot.id()
    }

    pub fn request(&self) -> &RequestHandle {
        self.slot.request()
    }

    pub fn phase_counter(&self) -> u64 {
        self.phase_counter
    }

    /// Publishes data for the before-phase hooks of the next phase.
    pub fn stage(&self, value: Value) {
        self.slot.stage(value);
    }

    /// Takes whatever a hook resolved for this job during the last phase start.
    pub fn take_resolved(&self) -> Option<Value> {
        self.slot.take_resolved()
    }

    /// Waits until the scheduler lets this job start its next step.
    ///
    /// Reports the previous step as done (except on the first call), then
    /// suspends until the scheduler sends either a wake-up or an error. An
    /// error is returned from this call and from every later call; the job
    /// is expected to propagate it.
    pub async fn phase(&mut self) -> Result<(), JobError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }

        if !self.awaiting {
            let id = self.id();
            let event = if self.phase_counter == 0 {
                SchedulerEvent::Arrived(id)
            } else {
                SchedulerEvent::StepDone {
                    id,
                    step: self.phase_counter,
                }
            };
            if self.events.send(event).is_err() {
                return Err(self.fail(JobError::internal("scheduler is no longer running")));
            }

            self.phase_counter += 1;
            self.slot.set_phase(self.phase_counter);
            self.awaiting = true;
        }

        let signal = self.signals.recv().await;
        self.awaiting = false;
        match signal {
            Some(Signal::Ready) => {
                // An error queued right behind the wake-up wins: the job should
                // not start work for a run that is already failing.
                while let Ok(signal) = self.signals.try_recv() {
                    if let Signal::Error(err) = signal {
                        return Err(self.fail(err));
                    }
                }
                Ok(())
            }
            Some(Signal::Error(err)) => Err(self.fail(err)),
            None => Err(self.fail(JobError::internal("scheduler is no longer running"))),
        }
    }

    /// Sends a raw event, bypassing checkpoint bookkeeping.
    #[cfg(test)]
    pub(crate) fn send_event(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&mut self, err: JobError) -> JobError {
        self.failed = Some(err.clone());
        err
    }
}
