// src/ingest/error.rs
use thiserror::Error;

/// Upstream page fetch failed. Fatal only when it happens on the first page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("upstream transport failure: {0}")]
    Transport(String),
    #[error("upstream payload could not be decoded: {0}")]
    Decode(String),
}

impl FetchError {
    /// Transport failures, timeouts, 5xx and throttling. Decode errors and
    /// other statuses will not get better on a second try.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => is_transient_status(*status),
            FetchError::Transport(_) => true,
            FetchError::Decode(_) => false,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

/// A single listing could not be mapped to a canonical event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("missing-required-field: {field}")]
    MissingRequiredField {
        field: &'static str,
        /// Best-effort identifier of the offending item (may be empty).
        item: String,
    },
}

impl NormalizationError {
    pub fn reason(&self) -> &'static str {
        match self {
            NormalizationError::MissingRequiredField { .. } => "missing-required-field",
        }
    }

    pub fn item(&self) -> &str {
        match self {
            NormalizationError::MissingRequiredField { item, .. } => item,
        }
    }
}

/// Downstream write (or lookup) failure for one event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForwardError {
    /// Timeouts, 5xx, throttling. Worth retrying.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// Validation / 4xx. Retrying will not help.
    #[error("permanent store failure: {0}")]
    Permanent(String),
}

impl ForwardError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ForwardError::Transient(_))
    }

    /// Classify an HTTP status code from the store.
    pub fn from_status(status: u16, body: &str) -> Self {
        let msg = format!("HTTP {status}: {}", body.trim());
        if is_transient_status(status) {
            ForwardError::Transient(msg)
        } else {
            ForwardError::Permanent(msg)
        }
    }
}

impl From<reqwest::Error> for ForwardError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(s) => ForwardError::from_status(s.as_u16(), &e.to_string()),
            // connect/timeout/body errors
            None => ForwardError::Transient(e.to_string()),
        }
    }
}
