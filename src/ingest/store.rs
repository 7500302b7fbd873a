// src/ingest/store.rs
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::ingest::error::ForwardError;
use crate::ingest::types::{CanonicalEvent, EventKey, EventStore};

/// In-process store. Good for tests and local dev; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<EventKey, CanonicalEvent>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &EventKey) -> Option<CanonicalEvent> {
        self.records
            .lock()
            .expect("store mutex poisoned")
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful upserts, including replaces.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn last_hash(&self, key: &EventKey) -> Result<Option<String>, ForwardError> {
        Ok(self
            .records
            .lock()
            .expect("store mutex poisoned")
            .get(key)
            .map(|e| e.content_hash.clone()))
    }

    async fn upsert(&self, event: &CanonicalEvent) -> Result<(), ForwardError> {
        self.records
            .lock()
            .expect("store mutex poisoned")
            .insert(event.key(), event.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeenRecord {
    content_hash: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpsertBody<'a> {
    title: &'a str,
    description: &'a str,
    starts_at: Option<chrono::DateTime<chrono::Utc>>,
    ends_at: Option<chrono::DateTime<chrono::Utc>>,
    location: Option<&'a str>,
    organizer: Option<&'a str>,
    content_hash: &'a str,
}

/// REST backend: `GET|PUT {base}/events/{source}/{externalId}`.
pub struct HttpEventStore {
    base: Url,
    token: Option<String>,
    client: Client,
}

impl HttpEventStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("event store url {base_url}"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("event store url cannot be a base: {base_url}"));
        }
        let client = Client::builder()
            .user_agent(concat!("campus-event-ingest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()
            .context("building event store http client")?;
        Ok(Self {
            base,
            token: token.filter(|t| !t.trim().is_empty()),
            client,
        })
    }

    fn record_url(&self, key: &EventKey) -> Url {
        let mut url = self.base.clone();
        // cannot_be_a_base was rejected in new()
        if let Ok(mut segs) = url.path_segments_mut() {
            segs.pop_if_empty()
                .extend(["events", key.source.as_str(), key.external_id.as_str()]);
        }
        url
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

#[async_trait]
impl EventStore for HttpEventStore {
    async fn last_hash(&self, key: &EventKey) -> Result<Option<String>, ForwardError> {
        let resp = self
            .authorize(self.client.get(self.record_url(key)))
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ForwardError::from_status(status.as_u16(), &body));
        }
        let rec: SeenRecord = resp.json().await?;
        Ok(Some(rec.content_hash))
    }

    async fn upsert(&self, event: &CanonicalEvent) -> Result<(), ForwardError> {
        let body = UpsertBody {
            title: &event.title,
            description: &event.description,
            starts_at: event.starts_at,
            ends_at: event.ends_at,
            location: event.location.as_deref(),
            organizer: event.organizer.as_deref(),
            content_hash: &event.content_hash,
        };
        let resp = self
            .authorize(self.client.put(self.record_url(&event.key())))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(ForwardError::from_status(status.as_u16(), &text))
    }
}
