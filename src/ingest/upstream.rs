// src/ingest/upstream.rs
use async_trait::async_trait;
use chrono::SecondsFormat;
use metrics::{counter, histogram};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

use crate::ingest::error::FetchError;
use crate::ingest::types::{PageRequest, RawEvent, RawPage, UpstreamSource};

/// Response envelopes seen in the wild. Resolved here so nothing past the
/// client boundary has to care which API version answered.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResponseEnvelope {
    /// Current OData-style search endpoint.
    OData {
        value: Vec<Value>,
        #[serde(rename = "@odata.count", default)]
        total: Option<u64>,
        #[serde(rename = "nextCursor", default)]
        next_cursor: Option<Value>,
    },
    /// Legacy endpoint.
    Legacy {
        events: Vec<Value>,
        #[serde(default)]
        total: Option<u64>,
        #[serde(rename = "nextCursor", alias = "next", default)]
        next_cursor: Option<Value>,
    },
    Unrecognized(Value),
}

/// Field aliases per envelope shape, in lookup order.
struct FieldMap {
    id: &'static [&'static str],
    name: &'static [&'static str],
    description: &'static [&'static str],
    starts: &'static [&'static str],
    ends: &'static [&'static str],
    location: &'static [&'static str],
    organization: &'static [&'static str],
}

const VALUE_FIELDS: FieldMap = FieldMap {
    id: &["id"],
    name: &["name"],
    description: &["description"],
    starts: &["startsOn"],
    ends: &["endsOn"],
    location: &["location"],
    organization: &["organizationName"],
};

const EVENTS_FIELDS: FieldMap = FieldMap {
    id: &["id", "eventId"],
    name: &["name", "title"],
    description: &["description", "summary"],
    starts: &["startsOn", "startsAt", "startDate"],
    ends: &["endsOn", "endsAt", "endDate"],
    location: &["location", "venue"],
    organization: &["organizationName", "organizer"],
};

/// Scalar → string. Objects, arrays and nulls count as absent.
fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn pick(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| obj.get(*k).and_then(scalar_text))
}

fn to_raw_event(item: &Value, fields: &FieldMap) -> RawEvent {
    let Some(obj) = item.as_object() else {
        // Non-object items keep no fields; the normalizer rejects them.
        return RawEvent::default();
    };
    RawEvent {
        id: pick(obj, fields.id),
        name: pick(obj, fields.name),
        description: pick(obj, fields.description),
        starts_on: pick(obj, fields.starts),
        ends_on: pick(obj, fields.ends),
        location: pick(obj, fields.location),
        organization: pick(obj, fields.organization),
    }
}

/// `skip` is `None` when the page was requested with an opaque token: there is
/// no offset to extend, so only an explicit cursor continues.
fn next_cursor(
    skip: Option<u64>,
    len: usize,
    take: u32,
    total: Option<u64>,
    explicit: Option<&Value>,
) -> Option<String> {
    if let Some(c) = explicit.and_then(scalar_text).filter(|c| !c.is_empty()) {
        return Some(c);
    }
    let skip = skip?;
    if len == 0 || (len as u64) < u64::from(take) {
        return None;
    }
    let next = skip + len as u64;
    match total {
        Some(t) if next >= t => None,
        _ => Some(next.to_string()),
    }
}

/// Decode one response body. `skip`/`take` are the values the request used.
pub fn parse_page(body: &str, skip: u64, take: u32) -> Result<RawPage, FetchError> {
    parse_page_at(body, Some(skip), take)
}

fn parse_page_at(body: &str, skip: Option<u64>, take: u32) -> Result<RawPage, FetchError> {
    let env: ResponseEnvelope =
        serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;

    let (items, fields, total, explicit) = match &env {
        ResponseEnvelope::OData {
            value,
            total,
            next_cursor,
        } => (value.as_slice(), &VALUE_FIELDS, *total, next_cursor.as_ref()),
        ResponseEnvelope::Legacy {
            events,
            total,
            next_cursor,
        } => (events.as_slice(), &EVENTS_FIELDS, *total, next_cursor.as_ref()),
        ResponseEnvelope::Unrecognized(_) => {
            tracing::warn!(target: "ingest", "upstream page has neither `value` nor `events`; treating as empty");
            return Ok(RawPage::default());
        }
    };

    let events: Vec<RawEvent> = items.iter().map(|it| to_raw_event(it, fields)).collect();
    let next = next_cursor(skip, events.len(), take, total, explicit);
    Ok(RawPage {
        events,
        next_cursor: next,
    })
}

#[derive(Debug, Clone)]
pub struct DiscoveryClientCfg {
    pub search_url: String,
    pub page_size: u32,
    pub status: String,
    pub timeout: Duration,
}

/// HTTP client for the campus discovery search endpoint.
pub struct DiscoveryClient {
    cfg: DiscoveryClientCfg,
    http: Client,
}

impl DiscoveryClient {
    pub fn new(cfg: DiscoveryClientCfg) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("campus-event-ingest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(cfg.timeout)
            .build()?;
        Ok(Self { cfg, http })
    }

    /// Query pairs plus the offset requested (`None` for a token cursor).
    fn query(&self, req: &PageRequest) -> (Option<u64>, Vec<(&'static str, String)>) {
        let mut q = vec![
            (
                "endsAfter",
                req.ends_after.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            ("orderByField", "endsOn".to_string()),
            ("orderByDirection", "ascending".to_string()),
            ("status", self.cfg.status.clone()),
            ("take", self.cfg.page_size.to_string()),
        ];
        // Numeric cursors are offsets we computed; anything else is an upstream token.
        let skip = match req.cursor.as_deref() {
            None => Some(0),
            Some(c) => match c.parse::<u64>() {
                Ok(n) => Some(n),
                Err(_) => {
                    q.push(("cursor", c.to_string()));
                    None
                }
            },
        };
        if let Some(n) = skip.filter(|n| *n > 0) {
            q.push(("skip", n.to_string()));
        }
        (skip, q)
    }

    async fn fetch_inner(
        &self,
        skip: Option<u64>,
        query: &[(&'static str, String)],
    ) -> Result<RawPage, FetchError> {
        let resp = self
            .http
            .get(&self.cfg.search_url)
            .query(query)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        parse_page_at(&body, skip, self.cfg.page_size)
    }
}

#[async_trait]
impl UpstreamSource for DiscoveryClient {
    async fn fetch_page(&self, req: &PageRequest) -> Result<RawPage, FetchError> {
        let t0 = std::time::Instant::now();
        let (skip, query) = self.query(req);

        let result = self.fetch_inner(skip, &query).await;

        histogram!("ingest_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        if let Err(e) = &result {
            tracing::warn!(target: "ingest", page = req.page, error = %e, "discovery fetch failed");
            counter!("ingest_fetch_errors_total").increment(1);
        }
        result
    }

    fn name(&self) -> &'static str {
        "discovery"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_envelope_with_total() {
        let body = r#"{"@odata.count": 3, "value": [
            {"id": 101, "name": "Welcome Fair", "startsOn": "2025-09-01T17:00:00+00:00"},
            {"id": "102", "name": "Career Expo", "organizationName": "Career Center"}
        ]}"#;
        let page = parse_page(body, 0, 2).unwrap();
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].id.as_deref(), Some("101"));
        assert_eq!(page.events[1].organization.as_deref(), Some("Career Center"));
        assert_eq!(page.next_cursor.as_deref(), Some("2"));

        // total reached
        let page = parse_page(body, 1, 2).unwrap();
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn events_envelope_uses_legacy_aliases() {
        let body = r#"{"events": [{"eventId": "A1", "title": "Welcome Fair", "startDate": "2025-09-01T17:00:00Z"}], "nextCursor": "tok-2"}"#;
        let page = parse_page(body, 0, 15).unwrap();
        assert_eq!(page.events[0].id.as_deref(), Some("A1"));
        assert_eq!(page.events[0].name.as_deref(), Some("Welcome Fair"));
        assert_eq!(page.next_cursor.as_deref(), Some("tok-2"));
    }

    #[test]
    fn unknown_envelope_is_empty_page() {
        let page = parse_page(r#"{"items": [1,2,3]}"#, 0, 15).unwrap();
        assert!(page.events.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn short_page_ends_pagination() {
        let body = r#"{"value": [{"id": 1, "name": "x"}]}"#;
        assert!(parse_page(body, 0, 15).unwrap().next_cursor.is_none());
    }

    #[test]
    fn token_page_without_next_cursor_ends_pagination() {
        let body = r#"{"events": [{"id": "L2", "title": "Movie Night"}]}"#;
        assert_eq!(parse_page(body, 0, 1).unwrap().next_cursor.as_deref(), Some("1"));
        assert!(parse_page_at(body, None, 1).unwrap().next_cursor.is_none());

        let chained = r#"{"events": [{"id": "L2"}], "nextCursor": "tok-3"}"#;
        let page = parse_page_at(chained, None, 1).unwrap();
        assert_eq!(page.next_cursor.as_deref(), Some("tok-3"));
    }

    #[test]
    fn garbage_body_is_decode_error() {
        assert!(matches!(
            parse_page("<html>", 0, 15),
            Err(FetchError::Decode(_))
        ));
    }

    #[test]
    fn non_object_items_become_empty_raw_events() {
        let page = parse_page(r#"{"value": ["oops", {"id": 7, "name": "ok"}]}"#, 0, 15).unwrap();
        assert_eq!(page.events[0], RawEvent::default());
        assert_eq!(page.events[1].id.as_deref(), Some("7"));
    }
}
