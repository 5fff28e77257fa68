//! End-to-end tests of the batch endpoint over the record resource.

mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use futures::future::join_all;
use serde_json::json;

use rsrest_api::resources::RecordStore;

use common::{create_test_app, post_batch, result_statuses, send_json, CONCURRENT_CLIENT_COUNT};

/// Test: records written in one batch are readable through single requests
#[tokio::test]
async fn test_batch_write_then_single_read() {
    let store = Arc::new(RecordStore::new());

    let (status, results) = post_batch(
        create_test_app(&store, 4),
        json!([
            { "href": "records/alpha", "verb": "PUT", "body": { "v": 1 } },
            { "href": "records/beta", "verb": "PUT", "body": { "v": 2 } },
            { "href": "./records/gamma", "verb": "PUT", "body": { "v": 3 } },
        ]),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(result_statuses(&results), vec![201, 201, 201]);

    let (status, body) = send_json(create_test_app(&store, 4), "GET", "/v1/records/gamma", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"]["v"], 3);

    let (status, body) = send_json(create_test_app(&store, 4), "GET", "/v1/records", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 3);
}

/// Test: a failed validation in a mutating batch leaves the store untouched
#[tokio::test]
async fn test_failed_mutating_batch_writes_nothing() {
    let store = Arc::new(RecordStore::new());

    let (status, results) = post_batch(
        create_test_app(&store, 2),
        json!([
            { "href": "records/a", "verb": "PUT", "body": 1 },
            { "href": "records/b", "verb": "PUT", "body": 2 },
            { "href": "records/c", "verb": "PUT" },
            { "href": "records/d", "verb": "PUT", "body": 4 },
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let statuses = result_statuses(&results);
    assert_eq!(statuses[2], 400);
    for (index, status) in statuses.iter().enumerate() {
        if index != 2 {
            assert_eq!(*status, 202, "result {index}: {results}");
        }
    }
    assert!(store.is_empty());
}

/// Test: independent groups commit or fail on their own
#[tokio::test]
async fn test_groups_are_independent() {
    let store = Arc::new(RecordStore::new());

    let (status, results) = post_batch(
        create_test_app(&store, 4),
        json!([
            [
                { "href": "records/a", "verb": "PUT", "body": 1 },
                { "href": "records/b", "verb": "DELETE" },
            ],
            [
                { "href": "records/c", "verb": "PUT", "body": 3 },
            ],
            [
                { "href": "records/c" },
                { "href": "records/a" },
            ],
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(result_statuses(&results), vec![202, 404, 201, 200, 404]);
    assert_eq!(store.get("a"), None);
    assert_eq!(store.get("c"), Some(json!(3)));
}

/// Test: a batch whose last delete fails keeps none of its finished changes
#[tokio::test]
async fn test_failed_batch_rolls_back_finished_changes() {
    let store = Arc::new(RecordStore::new());
    store.put("x", json!("kept"));

    let (status, results) = post_batch(
        create_test_app(&store, 4),
        json!([
            { "href": "records/a", "verb": "PUT", "body": 1 },
            { "href": "records/x", "verb": "DELETE" },
            { "href": "records/x", "verb": "DELETE" },
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(result_statuses(&results), vec![201, 200, 404]);
    assert_eq!(store.get("a"), None);
    assert_eq!(store.get("x"), Some(json!("kept")));

    let (status, _) = send_json(create_test_app(&store, 4), "GET", "/v1/records/a", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Test: concurrent batches against one store all settle
#[tokio::test]
async fn test_concurrent_batches_all_settle() {
    let store = Arc::new(RecordStore::new());

    let requests = (0..CONCURRENT_CLIENT_COUNT).map(|client| {
        let app = create_test_app(&store, 3);
        async move {
            let body = json!([
                { "href": format!("records/{client}-1"), "verb": "PUT", "body": client },
                { "href": format!("records/{client}-2"), "verb": "PUT", "body": client },
            ]);
            post_batch(app, body).await
        }
    });

    for (status, results) in join_all(requests).await {
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(result_statuses(&results), vec![201, 201]);
    }
    assert_eq!(store.len(), CONCURRENT_CLIENT_COUNT * 2);
}

/// Test: reads of the same ids in one batch see identical values
#[tokio::test]
async fn test_duplicate_reads_share_one_lookup() {
    let store = Arc::new(RecordStore::new());
    store.put("shared", json!({ "k": "v" }));

    let (status, results) = post_batch(
        create_test_app(&store, 8),
        json!([
            { "href": "records/shared" },
            { "href": "records/shared" },
            { "href": "records/shared?fields=all" },
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(result_statuses(&results), vec![200, 200, 200]);
    assert_eq!(results[0]["body"], results[2]["body"]);
}
