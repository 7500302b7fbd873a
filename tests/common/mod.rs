// tests/common/mod.rs
#![allow(dead_code)]

use async_trait::async_trait;
use campus_event_ingest::ingest::coordinator::CancelToken;
use campus_event_ingest::ingest::error::{FetchError, ForwardError};
use campus_event_ingest::ingest::store::MemoryStore;
use campus_event_ingest::ingest::types::{
    CanonicalEvent, EventKey, EventStore, PageRequest, RawPage, UpstreamSource,
};
use campus_event_ingest::ingest::upstream::parse_page;
use campus_event_ingest::{IngestConfig, IngestPipeline};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const TAKE: u32 = 15;

#[derive(Clone, Debug)]
pub enum Step {
    Body(String),
    Status(u16),
}

/// Serves pages by index. A numeric cursor is the index of the next page,
/// so the same fixture can be replayed across runs.
pub struct FixtureUpstream {
    pages: Mutex<Vec<Step>>,
    calls: AtomicU32,
    failures: Mutex<VecDeque<u16>>,
    cancel_after_first: Mutex<Option<CancelToken>>,
}

impl FixtureUpstream {
    pub fn new(pages: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(pages),
            calls: AtomicU32::new(0),
            failures: Mutex::new(VecDeque::new()),
            cancel_after_first: Mutex::new(None),
        })
    }

    pub fn set_page(&self, idx: usize, step: Step) {
        self.pages.lock().unwrap()[idx] = step;
    }

    /// Answer the next `times` calls with `status`, whatever page they ask for.
    pub fn fail_next(&self, status: u16, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .extend(std::iter::repeat(status).take(times));
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Trip `token` right after the first page is served.
    pub fn cancel_after_first_page(&self, token: CancelToken) {
        *self.cancel_after_first.lock().unwrap() = Some(token);
    }
}

#[async_trait]
impl UpstreamSource for FixtureUpstream {
    async fn fetch_page(&self, req: &PageRequest) -> Result<RawPage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(s) = self.failures.lock().unwrap().pop_front() {
            return Err(FetchError::Status {
                status: s,
                body: "busy".into(),
            });
        }
        let idx: usize = req
            .cursor
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let step = self.pages.lock().unwrap().get(idx).cloned();
        let out = match step {
            Some(Step::Body(b)) => parse_page(&b, 0, TAKE),
            Some(Step::Status(s)) => Err(FetchError::Status {
                status: s,
                body: "fixture".into(),
            }),
            None => Ok(RawPage::default()),
        };
        if let Some(t) = self.cancel_after_first.lock().unwrap().take() {
            t.cancel();
        }
        out
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}

/// (id, name, description)
pub fn page(key: &str, items: &[(&str, &str, &str)], next: Option<&str>) -> Step {
    let events: Vec<_> = items
        .iter()
        .map(|(id, name, desc)| {
            json!({
                "id": id,
                "name": name,
                "description": desc,
                "startsOn": "2025-09-01T17:00:00+00:00",
                "endsOn": "2025-09-01T19:00:00+00:00",
            })
        })
        .collect();
    let mut body = serde_json::Map::new();
    body.insert(key.to_string(), json!(events));
    if let Some(n) = next {
        body.insert("nextCursor".into(), json!(n));
    }
    Step::Body(serde_json::Value::Object(body).to_string())
}

/// MemoryStore plus scripted failures.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    permanent: HashSet<String>,
    transient_left: Mutex<HashMap<String, u32>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(mut self, id: &str) -> Self {
        self.permanent.insert(id.to_string());
        self
    }

    pub fn transient(self, id: &str, times: u32) -> Self {
        self.transient_left
            .lock()
            .unwrap()
            .insert(id.to_string(), times);
        self
    }

    pub fn attempts(&self, id: &str) -> u32 {
        self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn get(&self, id: &str) -> Option<CanonicalEvent> {
        self.inner.get(&key(id))
    }
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn last_hash(&self, key: &EventKey) -> Result<Option<String>, ForwardError> {
        self.inner.last_hash(key).await
    }

    async fn upsert(&self, event: &CanonicalEvent) -> Result<(), ForwardError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(event.external_id.clone())
            .or_default() += 1;
        if self.permanent.contains(&event.external_id) {
            return Err(ForwardError::Permanent("HTTP 422: title rejected".into()));
        }
        {
            let mut left = self.transient_left.lock().unwrap();
            if let Some(n) = left.get_mut(&event.external_id) {
                if *n > 0 {
                    *n -= 1;
                    return Err(ForwardError::Transient("HTTP 503: busy".into()));
                }
            }
        }
        self.inner.upsert(event).await
    }
}

pub fn key(id: &str) -> EventKey {
    EventKey {
        source: "discovery-api".into(),
        external_id: id.into(),
    }
}

pub fn test_config() -> IngestConfig {
    IngestConfig {
        max_pages: 5,
        forward_base_delay_ms: 1,
        forward_jitter: 0.0,
        ..Default::default()
    }
}

pub fn pipeline(upstream: Arc<dyn UpstreamSource>, store: Arc<dyn EventStore>) -> IngestPipeline {
    IngestPipeline::with_parts(upstream, store, &test_config())
}

/// Bind a router on an ephemeral local port; returns its base URL.
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server");
    });
    format!("http://{addr}")
}
