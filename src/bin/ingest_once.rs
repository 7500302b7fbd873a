//! One-shot ingest run: fetch, dedupe, forward, print the run summary as JSON.
//! Exit code is non-zero when the run failed, so it can sit behind any cron.

use anyhow::{Context, Result};
use campus_event_ingest::{init_tracing, IngestConfig, IngestPipeline};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = IngestConfig::load_default().context("loading ingest config")?;
    let pipeline = IngestPipeline::from_config(&cfg)?;

    let run = pipeline.run().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&run).context("serializing run summary")?
    );

    if !run.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
