// src/ingest/normalize.rs
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::ingest::error::NormalizationError;
use crate::ingest::types::{CanonicalEvent, RawEvent};

const MAX_TITLE_CHARS: usize = 300;
const MAX_DESCRIPTION_CHARS: usize = 8000;

/// Normalize free text: decode entities, strip tags, fold quotes, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Block-level tags become whitespace so words don't glue together
    static RE_BREAKS: OnceCell<Regex> = OnceCell::new();
    let re_breaks = RE_BREAKS
        .get_or_init(|| Regex::new(r"(?i)<\s*(br|/p|/div|/li)\s*/?>").expect("static regex"));
    out = re_breaks.replace_all(&out, " ").to_string();

    // 3) Strip remaining tags
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("static regex"));
    out = re_tags.replace_all(&out, "").to_string();

    // 4) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 5) Collapse whitespace (nbsp included)
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"[\s\u{00A0}]+").expect("static regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    out
}

fn truncate_chars(s: String, max: usize) -> String {
    if s.chars().count() > max {
        s.chars().take(max).collect()
    } else {
        s
    }
}

/// Lenient timestamp parsing: RFC 3339 first, then offset-less ISO (assumed UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(n) = NaiveDateTime::parse_from_str(t, fmt) {
            return Some(n.and_utc());
        }
    }
    None
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(normalize_text).filter(|v| !v.is_empty())
}

/// Deterministic digest over every mutable field the store receives.
///
/// Fields go through a sorted map before serialization, so the digest does not
/// depend on field order. `external_id`/`source` are the key and stay out.
pub fn content_hash(ev: &CanonicalEvent) -> String {
    let ts = |t: Option<DateTime<Utc>>| {
        t.map(|v| v.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default()
    };
    let mut fields: BTreeMap<&str, String> = BTreeMap::new();
    fields.insert("title", ev.title.clone());
    fields.insert("description", ev.description.clone());
    fields.insert("startsAt", ts(ev.starts_at));
    fields.insert("endsAt", ts(ev.ends_at));
    fields.insert("location", ev.location.clone().unwrap_or_default());
    fields.insert("organizer", ev.organizer.clone().unwrap_or_default());

    let canonical = serde_json::to_vec(&fields).unwrap_or_default();
    let digest = Sha256::digest(&canonical);

    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Map one upstream listing to the canonical shape.
pub fn normalize(raw: &RawEvent, source: &str) -> Result<CanonicalEvent, NormalizationError> {
    let external_id = raw
        .id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| NormalizationError::MissingRequiredField {
            field: "id",
            item: raw.name.clone().unwrap_or_default(),
        })?
        .to_string();

    let title = raw
        .name
        .as_deref()
        .map(normalize_text)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| NormalizationError::MissingRequiredField {
            field: "title",
            item: external_id.clone(),
        })?;
    let title = truncate_chars(title, MAX_TITLE_CHARS);

    let description = truncate_chars(
        raw.description
            .as_deref()
            .map(normalize_text)
            .unwrap_or_default(),
        MAX_DESCRIPTION_CHARS,
    );

    let starts_at = raw.starts_on.as_deref().and_then(parse_timestamp);
    let ends_at = raw.ends_on.as_deref().and_then(parse_timestamp);

    let mut ev = CanonicalEvent {
        external_id,
        source: source.to_string(),
        title,
        description,
        starts_at,
        ends_at,
        location: non_empty(raw.location.as_deref()),
        organizer: non_empty(raw.organization.as_deref()),
        content_hash: String::new(),
    };
    ev.content_hash = content_hash(&ev);
    Ok(ev)
}
