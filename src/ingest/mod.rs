// src/ingest/mod.rs
pub mod config;
pub mod coordinator;
pub mod dedupe;
pub mod error;
pub mod forward;
pub mod normalize;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod upstream;

use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::ingest::config::IngestConfig;
use crate::ingest::coordinator::{CancelToken, RunCoordinator};
use crate::ingest::forward::Forwarder;
use crate::ingest::store::{HttpEventStore, MemoryStore};
use crate::ingest::types::{EventStore, IngestionRun, UpstreamSource};
use crate::ingest::upstream::DiscoveryClient;

pub use crate::ingest::types::{CanonicalEvent, Classification, RunState};

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_runs_total", "Completed ingest runs, by outcome.");
        describe_counter!("ingest_pages_fetched_total", "Upstream pages fetched.");
        describe_counter!(
            "ingest_events_total",
            "Events processed, by classification (new/updated/unchanged)."
        );
        describe_counter!(
            "ingest_item_errors_total",
            "Item-scoped errors (normalization, lookup, forward)."
        );
        describe_counter!("ingest_fetch_errors_total", "Upstream fetch errors.");
        describe_counter!(
            "ingest_fetch_retries_total",
            "Transient page fetch failures that were retried."
        );
        describe_counter!(
            "ingest_forward_retries_total",
            "Transient forward failures that were retried."
        );
        describe_counter!(
            "ingest_forward_failures_total",
            "Forwards that failed for good."
        );
        describe_counter!(
            "ingest_ticks_skipped_total",
            "Scheduler ticks skipped because a run was still in flight."
        );
        describe_histogram!("ingest_fetch_ms", "Upstream page fetch time in milliseconds.");
        describe_histogram!("ingest_run_ms", "Whole run duration in milliseconds.");
        describe_gauge!(
            "ingest_pipeline_last_run_ts",
            "Unix ts when ingest pipeline last ran."
        );
    });
}

/// Entry point handed to triggers (cron endpoint, scheduler, one-shot binary).
#[derive(Clone)]
pub struct IngestPipeline {
    coordinator: RunCoordinator,
    busy: Arc<Mutex<()>>,
}

impl IngestPipeline {
    pub fn new(coordinator: RunCoordinator) -> Self {
        Self {
            coordinator,
            busy: Arc::new(Mutex::new(())),
        }
    }

    /// Wire the production client and store from configuration.
    pub fn from_config(cfg: &IngestConfig) -> Result<Self> {
        let upstream: Arc<dyn UpstreamSource> = Arc::new(DiscoveryClient::new(cfg.client_cfg())?);
        let store: Arc<dyn EventStore> = match cfg.store_url.as_deref() {
            Some(url) => Arc::new(HttpEventStore::new(
                url,
                cfg.store_token.clone(),
                cfg.store_timeout(),
            )?),
            None => {
                tracing::warn!(target: "ingest", "no store_url configured; using in-memory store (state is lost on restart)");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_parts(upstream, store, cfg))
    }

    /// Same wiring as `from_config`, with caller-supplied collaborators.
    pub fn with_parts(
        upstream: Arc<dyn UpstreamSource>,
        store: Arc<dyn EventStore>,
        cfg: &IngestConfig,
    ) -> Self {
        let forwarder = Forwarder::new(store, cfg.retry_policy(), cfg.store_timeout())
            .with_concurrency(cfg.forward_concurrency);
        Self::new(RunCoordinator::new(upstream, forwarder, cfg.coordinator_cfg()))
    }

    /// Run once. Overlapping calls are allowed; upsert + hash compare keep them safe.
    pub async fn run(&self) -> IngestionRun {
        self.coordinator.run().await
    }

    pub async fn run_with_cancel(&self, token: CancelToken) -> IngestionRun {
        self.coordinator.run_with_cancel(token).await
    }

    /// Advisory-locked run: `None` if another run of this pipeline is in flight.
    pub async fn run_exclusive(&self) -> Option<IngestionRun> {
        let _guard = self.busy.try_lock().ok()?;
        Some(self.coordinator.run().await)
    }
}
