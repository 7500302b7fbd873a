use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::ingest::types::IngestionRun;
use crate::ingest::IngestPipeline;

/// Path the external scheduler hits.
pub const CRON_PATH: &str = "/api/cron/scrape-events";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: IngestPipeline,
    /// Expected `Authorization: Bearer <secret>`; `None` leaves the endpoint open.
    pub cron_secret: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(CRON_PATH, get(cron_trigger))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

fn authorized(headers: &HeaderMap, secret: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|tok| tok.trim() == secret)
}

async fn cron_trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<IngestionRun>), StatusCode> {
    if !authorized(&headers, state.cron_secret.as_deref()) {
        tracing::warn!(target: "ingest", "cron trigger rejected: bad or missing bearer token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let run = state.pipeline.run().await;
    // Status is for observability only; the body is always the full summary.
    let status = if run.is_success() {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(run)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_check() {
        let mut h = HeaderMap::new();
        assert!(authorized(&h, None));
        assert!(!authorized(&h, Some("s3cret")));
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(authorized(&h, Some("s3cret")));
        assert!(!authorized(&h, Some("other")));
    }
}
