// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ingest::error::{FetchError, ForwardError};

/// Default `source` stamped on every event from the discovery integration.
pub const DISCOVERY_SOURCE: &str = "discovery-api";

/// One upstream listing after the response envelope has been resolved.
/// Every field is optional here; the normalizer decides what is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub starts_on: Option<String>,
    pub ends_on: Option<String>,
    pub location: Option<String>,
    pub organization: Option<String>,
}

/// One fetched page.
#[derive(Debug, Clone, Default)]
pub struct RawPage {
    pub events: Vec<RawEvent>,
    /// Continuation token for the next call; `None` means last page.
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    /// Only events ending after this instant are requested.
    pub ends_after: DateTime<Utc>,
    pub cursor: Option<String>,
    /// Zero-based page number within the run (diagnostics only).
    pub page: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub source: String,
    pub external_id: String,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.external_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalEvent {
    pub external_id: String,
    pub source: String,
    pub title: String,
    pub description: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub organizer: Option<String>,
    pub content_hash: String,
}

impl CanonicalEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            source: self.source.clone(),
            external_id: self.external_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    New,
    Updated,
    Unchanged,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::New => "new",
            Classification::Updated => "updated",
            Classification::Unchanged => "unchanged",
        }
    }

    pub fn needs_forward(&self) -> bool {
        !matches!(self, Classification::Unchanged)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub external_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Idle,
    Fetching,
    Processing,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

/// Summary of one invocation. Returned to the trigger, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngestionRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub pages_fetched: u32,
    pub events_seen: u32,
    pub events_new: u32,
    pub events_updated: u32,
    pub events_unchanged: u32,
    pub item_errors: Vec<ItemError>,
    pub fatal: Option<String>,
    /// Fetch error that ended pagination after at least one good page.
    pub truncated_by: Option<String>,
    pub cancelled: bool,
}

impl IngestionRun {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: None,
            state: RunState::Idle,
            pages_fetched: 0,
            events_seen: 0,
            events_new: 0,
            events_updated: 0,
            events_unchanged: 0,
            item_errors: Vec::new(),
            fatal: None,
            truncated_by: None,
            cancelled: false,
        }
    }

    pub fn record(&mut self, class: Classification) {
        match class {
            Classification::New => self.events_new += 1,
            Classification::Updated => self.events_updated += 1,
            Classification::Unchanged => self.events_unchanged += 1,
        }
    }

    pub fn push_error(&mut self, external_id: impl Into<String>, reason: impl Into<String>) {
        self.item_errors.push(ItemError {
            external_id: external_id.into(),
            reason: reason.into(),
        });
    }

    /// Observability signal only: the run reached `Done` without a fatal error.
    pub fn is_success(&self) -> bool {
        self.state == RunState::Done && self.fatal.is_none()
    }
}

/// The discovery API (or a fixture standing in for it).
#[async_trait::async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn fetch_page(&self, req: &PageRequest) -> Result<RawPage, FetchError>;
    fn name(&self) -> &'static str;
}

/// Downstream store: owns the seen-event index and the upsert.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Last stored content hash for `key`, or `None` if never forwarded.
    async fn last_hash(&self, key: &EventKey) -> Result<Option<String>, ForwardError>;
    /// Insert-or-replace keyed by `(source, external_id)`.
    async fn upsert(&self, event: &CanonicalEvent) -> Result<(), ForwardError>;
}
