// src/ingest/scheduler.rs
use metrics::counter;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ingest::IngestPipeline;

#[derive(Clone, Copy, Debug)]
pub struct IngestSchedulerCfg {
    pub interval_secs: u64,
}

/// Spawn a lightweight scheduler that runs the pipeline every `interval_secs`.
/// A tick that finds the previous run still going is skipped, not queued.
pub fn spawn_scheduler(cfg: IngestSchedulerCfg, pipeline: IngestPipeline) -> JoinHandle<()> {
    let period = Duration::from_secs(cfg.interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            // Run in its own task so the ticker keeps firing while a slow run is in flight.
            let p = pipeline.clone();
            tokio::spawn(async move {
                match p.run_exclusive().await {
                    Some(run) => {
                        tracing::info!(
                            target: "ingest",
                            ok = run.is_success(),
                            new = run.events_new,
                            updated = run.events_updated,
                            errors = run.item_errors.len(),
                            "scheduled ingest tick"
                        );
                    }
                    None => {
                        counter!("ingest_ticks_skipped_total").increment(1);
                        tracing::info!(target: "ingest", "previous run still in flight, skipping tick");
                    }
                }
            });
        }
    })
}
