// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod api;
pub mod ingest;
pub mod metrics;

pub use crate::api::{create_router, AppState};
pub use crate::ingest::config::IngestConfig;
pub use crate::ingest::types::IngestionRun;
pub use crate::ingest::IngestPipeline;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the built-in default (`campus_event_ingest=info,ingest=info,warn`).
/// `LOG_FORMAT=json` switches to JSON lines. Safe to call when a subscriber is already
/// installed (e.g. by the Shuttle runtime); the second install is ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("campus_event_ingest=info,ingest=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let res = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
