// src/ingest/coordinator.rs
use chrono::Utc;
use metrics::{counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::ingest::dedupe::DedupeEngine;
use crate::ingest::error::FetchError;
use crate::ingest::forward::{ForwardStatus, Forwarder, RetryPolicy};
use crate::ingest::normalize::normalize;
use crate::ingest::types::{
    IngestionRun, PageRequest, RawPage, RunState, UpstreamSource, DISCOVERY_SOURCE,
};

/// Cooperative cancellation shared between the trigger and a running pipeline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancel token plus optional execution budget for one run.
#[derive(Debug, Clone)]
pub struct StopSignal {
    token: CancelToken,
    deadline: Option<Instant>,
}

impl StopSignal {
    pub fn new(token: CancelToken, budget: Option<Duration>) -> Self {
        Self {
            token,
            deadline: budget.map(|b| Instant::now() + b),
        }
    }

    pub fn never() -> Self {
        Self::new(CancelToken::new(), None)
    }

    pub fn should_stop(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorCfg {
    pub source: String,
    /// Hard stop for pagination, whatever the upstream cursor says.
    pub max_pages: u32,
    pub fetch_timeout: Duration,
    /// Backoff for transient page fetch failures.
    pub fetch_retry: RetryPolicy,
    pub run_budget: Option<Duration>,
}

impl Default for CoordinatorCfg {
    fn default() -> Self {
        Self {
            source: DISCOVERY_SOURCE.to_string(),
            max_pages: 20,
            fetch_timeout: Duration::from_secs(15),
            fetch_retry: RetryPolicy::default(),
            run_budget: None,
        }
    }
}

/// Drives one run: fetch pages, then normalize → dedupe → forward per page.
#[derive(Clone)]
pub struct RunCoordinator {
    upstream: Arc<dyn UpstreamSource>,
    forwarder: Forwarder,
    cfg: CoordinatorCfg,
}

impl RunCoordinator {
    pub fn new(
        upstream: Arc<dyn UpstreamSource>,
        forwarder: Forwarder,
        cfg: CoordinatorCfg,
    ) -> Self {
        Self {
            upstream,
            forwarder,
            cfg,
        }
    }

    pub async fn run(&self) -> IngestionRun {
        self.run_with_cancel(CancelToken::new()).await
    }

    /// Never fails: every outcome, fatal ones included, lands in the summary.
    pub async fn run_with_cancel(&self, token: CancelToken) -> IngestionRun {
        crate::ingest::ensure_metrics_described();
        let t0 = std::time::Instant::now();
        let window_start = Utc::now();
        let stop = StopSignal::new(token, self.cfg.run_budget);

        let mut run = IngestionRun::new(window_start);
        let mut dedupe = DedupeEngine::new(self.forwarder.call_timeout());
        let mut cursor: Option<String> = None;
        let mut page_no: u32 = 0;

        run.state = RunState::Fetching;
        loop {
            if page_no >= self.cfg.max_pages {
                tracing::warn!(target: "ingest", max_pages = self.cfg.max_pages, "page limit reached, stopping pagination");
                break;
            }
            if stop.should_stop() {
                run.cancelled = true;
                break;
            }

            let req = PageRequest {
                ends_after: window_start,
                cursor: cursor.clone(),
                page: page_no,
            };
            match self.fetch(&req, &stop).await {
                Err(e) if stop.should_stop() => {
                    tracing::info!(target: "ingest", page = page_no, error = %e, "run stopped while fetching");
                    run.cancelled = true;
                    break;
                }
                Err(e) if page_no == 0 => {
                    tracing::error!(target: "ingest", error = %e, "first page fetch failed, aborting run");
                    run.fatal = Some(e.to_string());
                    run.state = RunState::Failed;
                    break;
                }
                Err(e) => {
                    tracing::warn!(target: "ingest", page = page_no, error = %e, "fetch failed mid-run, keeping partial result");
                    run.truncated_by = Some(format!("page {page_no}: {e}"));
                    break;
                }
                Ok(page) => {
                    run.pages_fetched += 1;
                    page_no += 1;
                    counter!("ingest_pages_fetched_total").increment(1);

                    let next = page.next_cursor.clone();
                    run.state = RunState::Processing;
                    self.process_page(page, &mut dedupe, &mut run, &stop).await;

                    match next {
                        Some(c) if !run.cancelled => {
                            cursor = Some(c);
                            run.state = RunState::Fetching;
                        }
                        _ => break,
                    }
                }
            }
        }

        if !run.state.is_terminal() {
            run.state = RunState::Done;
        }
        self.finish(&mut run, t0);
        run
    }

    /// Fetch one page, retrying transient failures with backoff until the
    /// policy runs out or the run is told to stop.
    async fn fetch(&self, req: &PageRequest, stop: &StopSignal) -> Result<RawPage, FetchError> {
        let retry = &self.cfg.fetch_retry;
        let max = retry.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once(req, stop).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && attempt < max && !stop.should_stop() => {
                    let delay = retry.delay_after(attempt);
                    let delay = stop.remaining().map_or(delay, |r| r.min(delay));
                    tracing::debug!(target: "ingest", page = req.page, attempt, ?delay, error = %e, "transient fetch failure, retrying");
                    counter!("ingest_fetch_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(
        &self,
        req: &PageRequest,
        stop: &StopSignal,
    ) -> Result<RawPage, FetchError> {
        let limit = stop
            .remaining()
            .map_or(self.cfg.fetch_timeout, |r| r.min(self.cfg.fetch_timeout));
        match tokio::time::timeout(limit, self.upstream.fetch_page(req)).await {
            Ok(r) => r,
            Err(_) => Err(FetchError::Transport(format!("fetch timed out after {limit:?}"))),
        }
    }

    async fn process_page(
        &self,
        page: RawPage,
        dedupe: &mut DedupeEngine,
        run: &mut IngestionRun,
        stop: &StopSignal,
    ) {
        let mut events = Vec::with_capacity(page.events.len());
        for raw in &page.events {
            run.events_seen += 1;
            match normalize(raw, &self.cfg.source) {
                Ok(ev) => events.push(ev),
                Err(e) => {
                    tracing::debug!(target: "ingest", error = %e, item = e.item(), "skipping malformed item");
                    run.push_error(e.item(), e.to_string());
                }
            }
        }

        let classified = dedupe
            .classify_page(events, &**self.forwarder.store())
            .await;
        run.events_unchanged += classified.unchanged + classified.superseded;
        counter!("ingest_events_total", "classification" => "unchanged")
            .increment(u64::from(classified.unchanged + classified.superseded));
        run.item_errors.extend(classified.errors);

        if classified.to_forward.is_empty() {
            return;
        }

        for outcome in self.forwarder.forward(classified.to_forward, stop).await {
            match outcome.status {
                ForwardStatus::Written => {
                    run.record(outcome.classification);
                    dedupe.remember(&outcome.event);
                    counter!("ingest_events_total", "classification" => outcome.classification.as_str())
                        .increment(1);
                }
                ForwardStatus::Failed(e) => {
                    run.push_error(outcome.event.external_id, e.to_string());
                }
                ForwardStatus::Skipped => {
                    run.cancelled = true;
                    run.push_error(outcome.event.external_id, "cancelled");
                }
            }
        }
    }

    fn finish(&self, run: &mut IngestionRun, t0: std::time::Instant) {
        let now = Utc::now();
        run.finished_at = Some(now);

        let outcome = if run.is_success() { "ok" } else { "failed" };
        counter!("ingest_runs_total", "outcome" => outcome).increment(1);
        counter!("ingest_item_errors_total").increment(run.item_errors.len() as u64);
        histogram!("ingest_run_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        gauge!("ingest_pipeline_last_run_ts").set(now.timestamp().max(0) as f64);

        tracing::info!(
            target: "ingest",
            source = %self.cfg.source,
            upstream = self.upstream.name(),
            state = ?run.state,
            pages = run.pages_fetched,
            seen = run.events_seen,
            new = run.events_new,
            updated = run.events_updated,
            unchanged = run.events_unchanged,
            errors = run.item_errors.len(),
            cancelled = run.cancelled,
            fatal = run.fatal.as_deref().unwrap_or(""),
            "ingest run finished"
        );
    }
}
