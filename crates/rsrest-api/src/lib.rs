//! rsrest-api: HTTP layer
//!
//! This crate provides the API layer including:
//! - HTTP batch endpoint and single-request dispatch via Axum
//! - Middleware (request id, CORS)
//! - Structured logging setup
//! - The in-memory record resource served by the `rsrest` binary
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 rsrest-api                   │
//! ├─────────────────────────────────────────────┤
//! │  http/          - Router, handlers, state   │
//! │  middleware/    - Request id, CORS          │
//! │  observability/ - Logging                   │
//! │  resources.rs   - Record resource           │
//! └─────────────────────────────────────────────┘
//! ```

pub mod http;
pub mod middleware;
pub mod observability;
pub mod resources;
