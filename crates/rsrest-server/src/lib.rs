//! rsrest-server: Batch scheduling and request handling
//!
//! This crate contains the execution layer including:
//! - Phase-synchronized scheduler for batch sub-requests
//! - Before-phase hooks for coalescing per-job work
//! - Route table resolving sub-request hrefs to handlers
//! - Batch executor (validation, grouping, status aggregation)
//! - Configuration management
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                rsrest-server                 │
//! ├─────────────────────────────────────────────┤
//! │  config.rs   - Configuration management     │
//! │  phase/      - Phase-synced settle          │
//! │    syncer.rs    - Per-job checkpoint handle │
//! │    scheduler.rs - Wake/queue controller     │
//! │    coalesce.rs  - Coalescing hook           │
//! │  routes.rs   - Route table                  │
//! │  handlers/   - Request handlers             │
//! │    batch/       - Batch executor            │
//! └─────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod handlers;
pub mod phase;
pub mod routes;

// Re-exports for convenience
pub use config::{BatchSettings, ConfigLoadError, ServerConfig};
pub use handlers::batch::{BatchExecutor, BatchOutcome, UnitOfWork};
pub use phase::{run_phase_synced_settle, Job, PhaseSyncer, Settlement};
pub use routes::{HandlerCall, ResourceHandler, RouteTable};
