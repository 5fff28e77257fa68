//! Observability infrastructure for rsrest.
//!
//! Structured logging configuration built on `tracing-subscriber`.

mod logging;

pub use logging::{create_json_layer, init_logging, parse_log_level, LoggingConfig};
