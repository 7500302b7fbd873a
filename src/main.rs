//! Campus Event Ingest — Binary Entrypoint
//! Boots the Axum HTTP server that hosts the cron trigger, health and metrics
//! routes, and optionally an in-process interval scheduler.

use campus_event_ingest::ingest::scheduler::{spawn_scheduler, IngestSchedulerCfg};
use campus_event_ingest::metrics::Metrics;
use campus_event_ingest::{create_router, init_tracing, AppState, IngestConfig, IngestPipeline};
use shuttle_axum::ShuttleAxum;

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = IngestConfig::load_default()?;
    tracing::info!(
        search_url = %cfg.search_url,
        page_size = cfg.page_size,
        max_pages = cfg.max_pages,
        store = cfg.store_url.as_deref().unwrap_or("<memory>"),
        interval_secs = cfg.interval_secs,
        "ingest config loaded"
    );

    let pipeline = IngestPipeline::from_config(&cfg)?;
    let metrics = Metrics::init()?;

    if cfg.interval_secs > 0 {
        spawn_scheduler(
            IngestSchedulerCfg {
                interval_secs: cfg.interval_secs,
            },
            pipeline.clone(),
        );
    }

    let state = AppState {
        pipeline,
        cron_secret: cfg.cron_secret.clone(),
    };
    let router = create_router(state).merge(metrics.router());

    Ok(router.into())
}
