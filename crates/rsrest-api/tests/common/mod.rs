//! Shared test utilities for rsrest API tests.

// Each test file only uses part of these helpers.
#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use tower::ServiceExt;

use rsrest_api::http::{create_router, AppState};
use rsrest_api::resources::{record_executor, record_routes, record_sessions, RecordStore};
use rsrest_server::config::BatchSettings;
use rsrest_server::handlers::batch::register_batch_route;
use rsrest_server::RouteTable;

/// Batch path used by every test app.
pub const BATCH_PATH: &str = "/v1/batch";

/// Number of concurrent clients for concurrency tests.
pub const CONCURRENT_CLIENT_COUNT: usize = 20;

/// Create a test app serving records under `/v1` with a shared store.
///
/// Each call creates a fresh router wrapping the shared store, which is the
/// pattern `oneshot` testing needs. Every request runs in its own session.
pub fn create_test_app(store: &Arc<RecordStore>, concurrency: usize) -> axum::Router {
    let mut routes = RouteTable::new();
    record_routes(&mut routes, "/v1").unwrap();
    register_batch_route(&mut routes, BATCH_PATH).unwrap();

    let settings = BatchSettings {
        concurrency,
        max_batch_size: 50,
        path: BATCH_PATH.to_string(),
    };
    let executor = record_executor(routes, settings, store);
    create_router(AppState::new(executor, record_sessions(Arc::clone(store))))
}

/// Send a request and return status plus parsed JSON body (`Null` if empty).
pub async fn send_json(
    app: axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let body = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };
    let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// POST a batch body to the batch endpoint.
pub async fn post_batch(
    app: axum::Router,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    send_json(app, "POST", BATCH_PATH, Some(body)).await
}

/// Status of every result in a batch response.
pub fn result_statuses(results: &serde_json::Value) -> Vec<u64> {
    results
        .as_array()
        .expect("batch response should be an array")
        .iter()
        .map(|result| result["status"].as_u64().unwrap())
        .collect()
}
