// src/ingest/dedupe.rs
use std::collections::HashMap;
use std::time::Duration;

use crate::ingest::error::ForwardError;
use crate::ingest::types::{CanonicalEvent, Classification, EventKey, EventStore, ItemError};

/// Classify one event against the last hash the store holds for its key.
pub fn classify(event: &CanonicalEvent, last_hash: Option<&str>) -> Classification {
    match last_hash {
        None => Classification::New,
        Some(h) if h == event.content_hash => Classification::Unchanged,
        Some(_) => Classification::Updated,
    }
}

/// Collapse repeated keys within one page: the later occurrence wins.
/// Returns survivors in the order of their winning position plus the number dropped.
pub fn supersede_duplicates(events: Vec<CanonicalEvent>) -> (Vec<CanonicalEvent>, usize) {
    let mut last_pos: HashMap<EventKey, usize> = HashMap::with_capacity(events.len());
    for (i, ev) in events.iter().enumerate() {
        last_pos.insert(ev.key(), i);
    }
    let total = events.len();
    let keep: Vec<CanonicalEvent> = events
        .into_iter()
        .enumerate()
        .filter(|(i, ev)| last_pos.get(&ev.key()) == Some(i))
        .map(|(_, ev)| ev)
        .collect();
    let dropped = total - keep.len();
    (keep, dropped)
}

#[derive(Debug, Default)]
pub struct PageClassification {
    pub to_forward: Vec<(CanonicalEvent, Classification)>,
    pub unchanged: u32,
    /// Earlier in-page duplicates; reported as unchanged.
    pub superseded: u32,
    pub errors: Vec<ItemError>,
}

/// Run-scoped dedupe state.
///
/// Remembers hashes this run already wrote so a key that shows up again on a
/// later page is not forwarded twice, even if the store is eventually consistent.
#[derive(Debug)]
pub struct DedupeEngine {
    forwarded: HashMap<EventKey, String>,
    lookup_timeout: Duration,
}

impl DedupeEngine {
    pub fn new(lookup_timeout: Duration) -> Self {
        Self {
            forwarded: HashMap::new(),
            lookup_timeout,
        }
    }

    async fn lookup(
        &self,
        store: &dyn EventStore,
        key: &EventKey,
    ) -> Result<Option<String>, ForwardError> {
        match tokio::time::timeout(self.lookup_timeout, store.last_hash(key)).await {
            Ok(r) => r,
            Err(_) => Err(ForwardError::Transient(format!(
                "lookup timed out after {:?}",
                self.lookup_timeout
            ))),
        }
    }

    /// Record a successful forward.
    pub fn remember(&mut self, event: &CanonicalEvent) {
        self.forwarded
            .insert(event.key(), event.content_hash.clone());
    }

    pub async fn classify_page(
        &self,
        events: Vec<CanonicalEvent>,
        store: &dyn EventStore,
    ) -> PageClassification {
        let (events, superseded) = supersede_duplicates(events);
        let mut out = PageClassification {
            superseded: superseded as u32,
            ..Default::default()
        };

        for ev in events {
            let key = ev.key();
            let class = match self.forwarded.get(&key) {
                Some(h) => classify(&ev, Some(h.as_str())),
                None => match self.lookup(store, &key).await {
                    Ok(last) => classify(&ev, last.as_deref()),
                    Err(e) => {
                        tracing::warn!(target: "ingest", key = %key, error = %e, "seen-index lookup failed");
                        out.errors.push(ItemError {
                            external_id: ev.external_id.clone(),
                            reason: format!("lookup-failed: {e}"),
                        });
                        continue;
                    }
                },
            };
            if class.needs_forward() {
                out.to_forward.push((ev, class));
            } else {
                out.unchanged += 1;
            }
        }
        out
    }
}
