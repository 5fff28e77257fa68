//! Phase-synchronized execution of batch jobs.
//!
//! Jobs run concurrently but meet at shared checkpoints, so work that spans
//! jobs (validation, statement coalescing, hooks) runs once per checkpoint
//! instead of once per job:
//!
//! - [`PhaseSyncer`]: handle a job calls `phase()` on at each checkpoint
//! - [`run_phase_synced_settle`]: drives all jobs, bounded by a concurrency
//!   limit, and settles every one of them
//! - [`BeforePhaseHook`]: callback run once per phase start
//! - [`CoalescingHook`]: hook merging staged per-job operations into one call
//!
//! # Failure handling
//!
//! In a read-only run a failed job only affects itself. In a mutating run the
//! first failure sends a cascade cancellation (status 202) to every pending
//! job, so no further statements are issued for a batch that will be rolled
//! back. A cancelled root request fails the pending jobs with status 0.

mod coalesce;
mod hook;
mod scheduler;
mod syncer;
mod types;

pub use coalesce::{BatchLoader, CoalescingHook, StagedKey};
pub use hook::{BeforePhaseHook, PhaseContext};
pub use scheduler::{run_phase_synced_settle, run_phase_synced_settle_with_report, SchedulerError};
pub use syncer::PhaseSyncer;
pub use types::{Job, JobSlot, SettleReport, Settlement};
