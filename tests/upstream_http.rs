// tests/upstream_http.rs
mod common;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use campus_event_ingest::ingest::error::FetchError;
use campus_event_ingest::ingest::store::MemoryStore;
use campus_event_ingest::ingest::types::{PageRequest, UpstreamSource};
use campus_event_ingest::ingest::upstream::{DiscoveryClient, DiscoveryClientCfg};
use campus_event_ingest::{IngestConfig, IngestPipeline};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Seen = Arc<Mutex<Vec<HashMap<String, String>>>>;

async fn odata_search(
    State(seen): State<Seen>,
    Query(q): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    seen.lock().unwrap().push(q.clone());
    let skip: usize = q.get("skip").and_then(|s| s.parse().ok()).unwrap_or(0);
    let all = [
        json!({"id": 1, "name": "Welcome Fair", "endsOn": "2025-09-01T20:00:00+00:00"}),
        json!({"id": 2, "name": "Career Expo", "endsOn": "2025-09-02T20:00:00+00:00"}),
        json!({"id": 3, "name": "Study Jam", "endsOn": "2025-09-03T20:00:00+00:00"}),
    ];
    let take: usize = q.get("take").and_then(|s| s.parse().ok()).unwrap_or(15);
    let slice: Vec<_> = all.iter().skip(skip).take(take).cloned().collect();
    Json(json!({"@odata.count": all.len(), "value": slice}))
}

async fn legacy_search(Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
    match q.get("cursor").map(String::as_str) {
        None => Json(json!({"events": [{"id": "L1", "title": "Open Mic"}], "nextCursor": "tok-2"})),
        Some("tok-2") => Json(json!({"events": [{"id": "L2", "title": "Movie Night"}]})),
        Some(_) => Json(json!({"events": []})),
    }
}

async fn broken() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

async fn start() -> (String, Seen) {
    let seen: Seen = Arc::default();
    let router = Router::new()
        .route("/search", get(odata_search))
        .route("/legacy", get(legacy_search))
        .route("/broken", get(broken))
        .with_state(seen.clone());
    (common::serve(router).await, seen)
}

fn client(url: String, page_size: u32) -> DiscoveryClient {
    DiscoveryClient::new(DiscoveryClientCfg {
        search_url: url,
        page_size,
        status: "Approved".into(),
        timeout: Duration::from_secs(5),
    })
    .expect("client")
}

#[tokio::test]
async fn request_carries_window_ordering_and_paging() {
    let (base, seen) = start().await;
    let c = client(format!("{base}/search"), 2);

    let first = c
        .fetch_page(&PageRequest {
            ends_after: Utc::now(),
            cursor: None,
            page: 0,
        })
        .await
        .unwrap();
    assert_eq!(first.events.len(), 2);
    assert_eq!(first.next_cursor.as_deref(), Some("2"));

    let second = c
        .fetch_page(&PageRequest {
            ends_after: Utc::now(),
            cursor: first.next_cursor.clone(),
            page: 1,
        })
        .await
        .unwrap();
    assert_eq!(second.events.len(), 1);
    assert!(second.next_cursor.is_none());

    let q = seen.lock().unwrap();
    assert_eq!(q[0].get("orderByField").map(String::as_str), Some("endsOn"));
    assert_eq!(q[0].get("orderByDirection").map(String::as_str), Some("ascending"));
    assert_eq!(q[0].get("status").map(String::as_str), Some("Approved"));
    assert_eq!(q[0].get("take").map(String::as_str), Some("2"));
    assert!(q[0].get("endsAfter").is_some_and(|v| v.ends_with('Z')));
    assert!(q[0].get("skip").is_none());
    assert_eq!(q[1].get("skip").map(String::as_str), Some("2"));
}

#[tokio::test]
async fn opaque_cursor_is_passed_through() {
    let (base, _) = start().await;
    let c = client(format!("{base}/legacy"), 1);
    let first = c
        .fetch_page(&PageRequest {
            ends_after: Utc::now(),
            cursor: None,
            page: 0,
        })
        .await
        .unwrap();
    assert_eq!(first.next_cursor.as_deref(), Some("tok-2"));
    let second = c
        .fetch_page(&PageRequest {
            ends_after: Utc::now(),
            cursor: first.next_cursor,
            page: 1,
        })
        .await
        .unwrap();
    assert_eq!(second.events[0].id.as_deref(), Some("L2"));
    assert_eq!(second.events[0].name.as_deref(), Some("Movie Night"));
    // Full page, but it came from a token and named no successor.
    assert!(second.next_cursor.is_none());
}

#[tokio::test]
async fn non_success_status_is_fetch_error() {
    let (base, _) = start().await;
    let c = client(format!("{base}/broken"), 15);
    let err = c
        .fetch_page(&PageRequest {
            ends_after: Utc::now(),
            cursor: None,
            page: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 500, .. }));
}

#[tokio::test]
async fn unreachable_upstream_is_transport_error() {
    // Port 9 (discard) on localhost is closed in test environments.
    let c = client("http://127.0.0.1:9/search".into(), 15);
    let err = c
        .fetch_page(&PageRequest {
            ends_after: Utc::now(),
            cursor: None,
            page: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Transport(_)));
}

#[tokio::test]
async fn full_pipeline_over_http_upstream() {
    let (base, _) = start().await;
    let cfg = IngestConfig {
        search_url: format!("{base}/search"),
        page_size: 2,
        ..Default::default()
    };
    let upstream = Arc::new(client(cfg.search_url.clone(), cfg.page_size));
    let store = Arc::new(MemoryStore::new());
    let p = IngestPipeline::with_parts(upstream, store.clone(), &cfg);

    let run = p.run().await;
    assert!(run.is_success());
    assert_eq!(run.pages_fetched, 2);
    assert_eq!(run.events_new, 3);
    assert_eq!(store.len(), 3);

    let again = p.run().await;
    assert_eq!(again.events_new + again.events_updated, 0);
}
