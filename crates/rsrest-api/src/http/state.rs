//! Application state for HTTP handlers.

use std::sync::Arc;
use std::time::Duration;

use rsrest_server::BatchExecutor;

/// Builds the context one HTTP request runs against.
pub type ContextFactory<C> = Arc<dyn Fn() -> Arc<C> + Send + Sync>;

/// Application state shared across all HTTP handlers.
///
/// # Type Parameters
///
/// * `C` - Context handed to every resource handler (stores, sessions, ...)
pub struct AppState<C> {
    /// Executor for batch bodies and single dispatched requests.
    pub executor: Arc<BatchExecutor<C>>,
    /// Called once per HTTP request.
    pub context: ContextFactory<C>,
    /// Upper bound for one HTTP request; the request is cancelled past it.
    pub request_timeout: Option<Duration>,
}

impl<C> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            context: Arc::clone(&self.context),
            request_timeout: self.request_timeout,
        }
    }
}

impl<C: Send + Sync + 'static> AppState<C> {
    /// State whose requests each get a context from `context`.
    pub fn new(
        executor: BatchExecutor<C>,
        context: impl Fn() -> Arc<C> + Send + Sync + 'static,
    ) -> Self {
        Self {
            executor: Arc::new(executor),
            context: Arc::new(context),
            request_timeout: None,
        }
    }

    /// State whose requests all share one context.
    pub fn with_shared(executor: BatchExecutor<C>, context: Arc<C>) -> Self {
        Self::new(executor, move || Arc::clone(&context))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Path the batch endpoint is mounted on.
    pub fn batch_path(&self) -> &str {
        &self.executor.settings().path
    }

    /// Fresh context for one request.
    pub fn request_context(&self) -> Arc<C> {
        (self.context)()
    }
}
