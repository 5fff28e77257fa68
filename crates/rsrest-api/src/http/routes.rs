//! HTTP route definitions and handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, Request, State},
    http::{header::WARNING, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, warn};

use rsrest_domain::{DomainError, RequestArena, RequestHandle, SubResponse, Verb, CLIENT_CANCELLED_STATUS};
use rsrest_server::BatchOutcome;

use super::state::AppState;
use crate::middleware::RequestIdLayer;

/// Status reported when every result was cut short by the client going away.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Custom JSON extractor that returns 400 Bad Request instead of 422
/// Unprocessable Entity (or 415) for bodies that are not valid JSON.
///
/// Preserves 413 Payload Too Large for body limit errors.
pub struct JsonBadRequest<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBadRequest<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBadRequest(value)),
            Err(rejection) => {
                let message = rejection.body_text();
                if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    Err(ApiError::payload_too_large(message))
                } else {
                    Err(ApiError::validation_error(message))
                }
            }
        }
    }
}

/// Default request body size limit (1MB).
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Creates the HTTP router with the default body size limit.
pub fn create_router<C: Send + Sync + 'static>(state: AppState<C>) -> Router {
    create_router_with_body_limit(state, DEFAULT_BODY_LIMIT)
}

/// Creates the HTTP router with a custom body size limit.
///
/// # Arguments
///
/// * `state` - Application state with the batch executor
/// * `body_limit` - Maximum request body size in bytes
pub fn create_router_with_body_limit<C: Send + Sync + 'static>(
    state: AppState<C>,
    body_limit: usize,
) -> Router {
    let batch_path = state.batch_path().to_string();
    Router::new()
        .route("/health", get(health_check))
        .route(&batch_path, post(batch::<C>))
        .fallback(dispatch::<C>)
        .with_state(Arc::new(state))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(RequestIdLayer::new())
}

// ============================================================
// Error Handling
// ============================================================

/// Error codes produced by the HTTP layer itself.
///
/// Batch and resource errors keep the codes they were raised with.
pub mod error_codes {
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
    pub const METHOD_NOT_ALLOWED: &str = "method_not_allowed";
    pub const TIMEOUT: &str = "timeout";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// API error response.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status,
        }
    }

    /// Creates a validation error (400).
    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::VALIDATION_ERROR, message)
    }

    /// Creates a payload too large error (413).
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, error_codes::PAYLOAD_TOO_LARGE, message)
    }

    /// Creates a method not allowed error (405).
    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, error_codes::METHOD_NOT_ALLOWED, message)
    }

    /// Creates a timeout error (504 Gateway Timeout).
    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, error_codes::TIMEOUT, message)
    }

    /// Creates an internal error (500).
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error_codes::INTERNAL_ERROR, message)
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        let status = StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, err.code, err.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ============================================================
// Handlers
// ============================================================

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Sets the cancellation flag of a request unless disarmed first.
///
/// Axum drops the handler future when the client disconnects; the guard
/// turns that drop into a cancellation the spawned request task observes.
pub(super) struct CancelOnDrop {
    request: Option<RequestHandle>,
}

impl CancelOnDrop {
    pub(super) fn new(request: RequestHandle) -> Self {
        Self {
            request: Some(request),
        }
    }

    pub(super) fn disarm(mut self) {
        self.request = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            warn!(request = %request.id(), href = %request.href(), "client went away, cancelling request");
            request.cancel();
        }
    }
}

fn request_href(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

fn status_code(status: u16) -> StatusCode {
    let status = if status == CLIENT_CANCELLED_STATUS {
        CLIENT_CLOSED_REQUEST
    } else {
        status
    };
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Waits for a spawned request task.
///
/// `request` is cancelled if the handler is dropped first or `timeout`
/// passes, in which case the caller gets a 504.
async fn join_request<T>(
    request: &RequestHandle,
    mut task: JoinHandle<T>,
    timeout: Option<Duration>,
) -> ApiResult<T> {
    let guard = CancelOnDrop::new(request.clone());
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                guard.disarm();
                warn!(request = %request.id(), href = %request.href(), timeout = ?limit, "request timed out, cancelling");
                request.cancel();
                return Err(ApiError::gateway_timeout(format!(
                    "request did not finish within {limit:?}"
                )));
            }
        },
        None => task.await,
    };
    guard.disarm();

    joined.map_err(|err| {
        error!(request = %request.id(), error = %err, "request task failed");
        ApiError::internal_error("request execution failed")
    })
}

/// POST {batch.path}
async fn batch<C: Send + Sync + 'static>(
    State(state): State<Arc<AppState<C>>>,
    uri: Uri,
    JsonBadRequest(body): JsonBadRequest<Value>,
) -> ApiResult<Response> {
    let root = RequestArena::new().root(Verb::Post, request_href(&uri), false);

    let executor = Arc::clone(&state.executor);
    let context = state.request_context();
    let task_root = root.clone();
    let task = tokio::spawn(async move { executor.execute(&task_root, &body, context).await });

    let outcome = join_request(&root, task, state.request_timeout).await??;
    Ok(outcome_response(outcome))
}

fn outcome_response(outcome: BatchOutcome) -> Response {
    let mut response = (status_code(outcome.status), Json(outcome.results)).into_response();
    for warning in outcome.warnings {
        let value = format!("199 rsrest \"{}\"", warning.replace('"', "'"));
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                response.headers_mut().append(WARNING, value);
            }
            Err(_) => warn!(warning = %warning, "warning not representable as a header"),
        }
    }
    response
}

/// Any request that is not the batch endpoint or a fixed route.
async fn dispatch<C: Send + Sync + 'static>(
    State(state): State<Arc<AppState<C>>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> ApiResult<Response> {
    let verb: Verb = method
        .as_str()
        .parse()
        .map_err(|err: rsrest_domain::UnknownVerb| ApiError::method_not_allowed(err.to_string()))?;
    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::validation_error(format!("invalid JSON body: {err}")))?
    };

    let request = RequestArena::new().root(verb, request_href(&uri), verb.is_read_only());

    let executor = Arc::clone(&state.executor);
    let context = state.request_context();
    let task_request = request.clone();
    let task = tokio::spawn(async move { executor.dispatch(&task_request, body, context).await });

    let response = join_request(&request, task, state.request_timeout).await?;
    Ok(sub_response(response))
}

fn sub_response(response: SubResponse) -> Response {
    let status = status_code(response.status);
    if response.body.is_null() {
        status.into_response()
    } else {
        (status, Json(response.body)).into_response()
    }
}
