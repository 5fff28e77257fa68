//! HTTP REST API endpoints.
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/health` | GET | Liveness check |
//! | `<batch.path>` | POST | Batch of sub-requests |
//! | any other path | any | Single request routed through the route table |

pub mod routes;
pub mod state;

pub use routes::{create_router, create_router_with_body_limit, ApiError, DEFAULT_BODY_LIMIT};
pub use state::{AppState, ContextFactory};
