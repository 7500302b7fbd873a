// src/ingest/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::coordinator::CoordinatorCfg;
use crate::ingest::forward::RetryPolicy;
use crate::ingest::types::DISCOVERY_SOURCE;
use crate::ingest::upstream::DiscoveryClientCfg;

pub const ENV_PATH: &str = "INGEST_CONFIG_PATH";

pub const DEFAULT_SEARCH_URL: &str =
    "https://utexas.campuslabs.com/engage/api/discovery/event/search";

fn default_search_url() -> String {
    DEFAULT_SEARCH_URL.to_string()
}
fn default_source() -> String {
    DISCOVERY_SOURCE.to_string()
}
fn default_status() -> String {
    "Approved".to_string()
}
fn default_page_size() -> u32 {
    15
}
fn default_max_pages() -> u32 {
    20
}
fn default_fetch_timeout_secs() -> u64 {
    15
}
fn default_store_timeout_secs() -> u64 {
    10
}
fn default_interval_secs() -> u64 {
    3600
}
fn default_forward_attempts() -> u32 {
    3
}
fn default_forward_base_delay_ms() -> u64 {
    200
}
fn default_forward_jitter() -> f64 {
    0.5
}
fn default_forward_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    /// Discovery search endpoint.
    pub search_url: String,
    pub source: String,
    /// Upstream `status` filter.
    pub status: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub fetch_timeout_secs: u64,
    /// Whole-run budget; 0 or absent means unbounded.
    pub run_budget_secs: Option<u64>,

    /// Downstream store base URL. Absent → in-memory store (dev only).
    pub store_url: Option<String>,
    pub store_token: Option<String>,
    pub store_timeout_secs: u64,

    pub forward_attempts: u32,
    pub forward_base_delay_ms: u64,
    pub forward_jitter: f64,
    pub forward_concurrency: usize,

    /// In-process scheduler period; 0 disables it.
    pub interval_secs: u64,
    /// Shared secret for the cron endpoint (Bearer token). Absent → open.
    pub cron_secret: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            search_url: default_search_url(),
            source: default_source(),
            status: default_status(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            run_budget_secs: None,
            store_url: None,
            store_token: None,
            store_timeout_secs: default_store_timeout_secs(),
            forward_attempts: default_forward_attempts(),
            forward_base_delay_ms: default_forward_base_delay_ms(),
            forward_jitter: default_forward_jitter(),
            forward_concurrency: default_forward_concurrency(),
            interval_secs: default_interval_secs(),
            cron_secret: None,
        }
    }
}

impl IngestConfig {
    /// Load from an explicit path. Supports TOML or JSON.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading ingest config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let cfg = parse_config(&content, &ext)
            .with_context(|| format!("parsing ingest config {}", path.display()))?;
        Ok(cfg.sanitized())
    }

    /// Resolution order:
    /// 1) $INGEST_CONFIG_PATH
    /// 2) config/ingest.toml
    /// 3) config/ingest.json
    /// 4) defaults
    ///
    /// Env overrides are applied on top in every case.
    pub fn load_default() -> Result<Self> {
        let base = if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_PATH} points to non-existent path"));
            }
            Self::load_from(&pb)?
        } else if Path::new("config/ingest.toml").exists() {
            Self::load_from(Path::new("config/ingest.toml"))?
        } else if Path::new("config/ingest.json").exists() {
            Self::load_from(Path::new("config/ingest.json"))?
        } else {
            Self::default()
        };
        Ok(base.with_env_overrides().sanitized())
    }

    pub fn with_env_overrides(mut self) -> Self {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }
        fn num<T: std::str::FromStr>(name: &str) -> Option<T> {
            var(name).and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = var("DISCOVERY_API_URL") {
            self.search_url = v;
        }
        if let Some(v) = var("EVENT_STORE_URL") {
            self.store_url = Some(v);
        }
        if let Some(v) = var("EVENT_STORE_TOKEN") {
            self.store_token = Some(v);
        }
        if let Some(v) = num("INGEST_MAX_PAGES") {
            self.max_pages = v;
        }
        if let Some(v) = num("INGEST_PAGE_SIZE") {
            self.page_size = v;
        }
        if let Some(v) = num("INGEST_INTERVAL_SECS") {
            self.interval_secs = v;
        }
        if let Some(v) = var("CRON_SECRET") {
            self.cron_secret = Some(v);
        }
        self
    }

    /// Clamp values into ranges the pipeline can work with.
    pub fn sanitized(mut self) -> Self {
        self.page_size = self.page_size.clamp(1, 100);
        self.max_pages = self.max_pages.max(1);
        self.forward_attempts = self.forward_attempts.max(1);
        self.forward_concurrency = self.forward_concurrency.max(1);
        if !(0.0..=1.0).contains(&self.forward_jitter) {
            self.forward_jitter = default_forward_jitter();
        }
        if self.fetch_timeout_secs == 0 {
            self.fetch_timeout_secs = default_fetch_timeout_secs();
        }
        if self.store_timeout_secs == 0 {
            self.store_timeout_secs = default_store_timeout_secs();
        }
        if self.run_budget_secs == Some(0) {
            self.run_budget_secs = None;
        }
        if self.source.trim().is_empty() {
            self.source = default_source();
        }
        self
    }

    pub fn client_cfg(&self) -> DiscoveryClientCfg {
        DiscoveryClientCfg {
            search_url: self.search_url.clone(),
            page_size: self.page_size,
            status: self.status.clone(),
            timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }

    pub fn coordinator_cfg(&self) -> CoordinatorCfg {
        CoordinatorCfg {
            source: self.source.clone(),
            max_pages: self.max_pages,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            fetch_retry: self.retry_policy(),
            run_budget: self.run_budget_secs.map(Duration::from_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.forward_attempts,
            base_delay: Duration::from_millis(self.forward_base_delay_ms),
            jitter: self.forward_jitter,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

fn parse_config(s: &str, hint_ext: &str) -> Result<IngestConfig> {
    match hint_ext {
        "toml" => Ok(toml::from_str(s)?),
        "json" => Ok(serde_json::from_str(s)?),
        // No usable extension: try JSON, then TOML.
        _ => serde_json::from_str(s)
            .map_err(anyhow::Error::from)
            .or_else(|_| toml::from_str(s).map_err(anyhow::Error::from))
            .map_err(|_| anyhow!("unsupported ingest config format")),
    }
}
