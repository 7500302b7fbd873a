// src/ingest/forward.rs
use metrics::counter;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;

use crate::ingest::coordinator::StopSignal;
use crate::ingest::error::ForwardError;
use crate::ingest::types::{CanonicalEvent, Classification, EventKey, EventStore};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Relative jitter, 0.0..=1.0. 0.5 means ±50 %.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1` (attempt is 1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let j = self.jitter.clamp(0.0, 1.0);
        if j == 0.0 {
            return exp;
        }
        let factor = 1.0 + rand::rng().random_range(-j..=j);
        exp.mul_f64(factor.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardStatus {
    Written,
    Failed(ForwardError),
    /// Not attempted because the run was told to stop.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ForwardOutcome {
    pub event: CanonicalEvent,
    pub classification: Classification,
    pub status: ForwardStatus,
    pub attempts: u32,
}

/// Per-key async locks. Entries are dropped once nobody holds them.
#[derive(Default)]
struct KeyLocks {
    inner: Mutex<HashMap<EventKey, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, key: &EventKey) -> OwnedMutexGuard<()> {
        let m = {
            let mut map = self.inner.lock().expect("key locks poisoned");
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry(key.clone()).or_default().clone()
        };
        m.lock_owned().await
    }
}

struct Shared {
    store: Arc<dyn EventStore>,
    retry: RetryPolicy,
    call_timeout: Duration,
    locks: KeyLocks,
}

/// Idempotent upserts into the downstream store.
///
/// Cheap to clone; clones share the per-key locks, so overlapping runs that
/// use the same forwarder never write one key concurrently.
#[derive(Clone)]
pub struct Forwarder {
    shared: Arc<Shared>,
    concurrency: usize,
}

impl Forwarder {
    /// `call_timeout` bounds each store call, lookups included.
    pub fn new(store: Arc<dyn EventStore>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                retry,
                call_timeout,
                locks: KeyLocks::default(),
            }),
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn call_timeout(&self) -> Duration {
        self.shared.call_timeout
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.shared.store
    }

    /// Forward a batch. Outcomes come back in input order.
    pub async fn forward(
        &self,
        batch: Vec<(CanonicalEvent, Classification)>,
        stop: &StopSignal,
    ) -> Vec<ForwardOutcome> {
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let mut outcomes: Vec<Option<ForwardOutcome>> = vec![None; batch.len()];

        for (idx, (event, classification)) in batch.into_iter().enumerate() {
            if stop.should_stop() {
                outcomes[idx] = Some(ForwardOutcome {
                    event,
                    classification,
                    status: ForwardStatus::Skipped,
                    attempts: 0,
                });
                continue;
            }
            // Closed never happens; we own the semaphore.
            let Ok(permit) = sem.clone().acquire_owned().await else {
                break;
            };
            let shared = self.shared.clone();
            set.spawn(async move {
                let _permit = permit;
                let (status, attempts) = shared.write_with_retry(&event).await;
                (
                    idx,
                    ForwardOutcome {
                        event,
                        classification,
                        status,
                        attempts,
                    },
                )
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                Err(e) => tracing::error!(target: "ingest", error = %e, "forward task panicked"),
            }
        }

        outcomes.into_iter().flatten().collect()
    }
}

impl Shared {
    async fn write_once(&self, event: &CanonicalEvent) -> Result<(), ForwardError> {
        match tokio::time::timeout(self.call_timeout, self.store.upsert(event)).await {
            Ok(r) => r,
            Err(_) => Err(ForwardError::Transient(format!(
                "upsert timed out after {:?}",
                self.call_timeout
            ))),
        }
    }

    async fn write_with_retry(&self, event: &CanonicalEvent) -> (ForwardStatus, u32) {
        let key = event.key();
        let _guard = self.locks.acquire(&key).await;

        let max = self.retry.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.write_once(event).await {
                Ok(()) => return (ForwardStatus::Written, attempt),
                Err(e) if e.is_transient() && attempt < max => {
                    let delay = self.retry.delay_after(attempt);
                    tracing::debug!(target: "ingest", key = %key, attempt, ?delay, error = %e, "transient forward failure, retrying");
                    counter!("ingest_forward_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(target: "ingest", key = %key, attempt, error = %e, "forward failed");
                    counter!("ingest_forward_failures_total").increment(1);
                    return (ForwardStatus::Failed(e), attempt);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_without_jitter_doubles() {
        let p = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            jitter: 0.0,
        };
        assert_eq!(p.delay_after(1), Duration::from_millis(200));
        assert_eq!(p.delay_after(2), Duration::from_millis(400));
        assert_eq!(p.delay_after(3), Duration::from_millis(800));
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = RetryPolicy::default();
        for _ in 0..50 {
            let d = p.delay_after(2);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(600));
        }
    }

    #[tokio::test]
    async fn key_lock_serializes_same_key() {
        let locks = KeyLocks::default();
        let k = EventKey {
            source: "s".into(),
            external_id: "1".into(),
        };
        let g = locks.acquire(&k).await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&k)).await;
        assert!(second.is_err(), "same key must wait");
        drop(g);
        let other = EventKey {
            source: "s".into(),
            external_id: "2".into(),
        };
        let _a = locks.acquire(&k).await;
        let _b = locks.acquire(&other).await;
    }

    struct SlowStore;

    #[async_trait::async_trait]
    impl EventStore for SlowStore {
        async fn last_hash(&self, _key: &EventKey) -> Result<Option<String>, ForwardError> {
            Ok(None)
        }

        async fn upsert(&self, _event: &CanonicalEvent) -> Result<(), ForwardError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn call_timeout_applies_to_every_upsert() {
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            jitter: 0.0,
        };
        let fwd = Forwarder::new(Arc::new(SlowStore), retry, Duration::from_millis(20));
        assert_eq!(fwd.clone().call_timeout(), Duration::from_millis(20));

        let event = CanonicalEvent {
            external_id: "A1".into(),
            source: "discovery-api".into(),
            title: "Fair".into(),
            description: String::new(),
            starts_at: None,
            ends_at: None,
            location: None,
            organizer: None,
            content_hash: "h".into(),
        };
        let out = fwd
            .forward(vec![(event, Classification::New)], &StopSignal::never())
            .await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].attempts, 2, "timeouts are transient");
        assert!(matches!(&out[0].status, ForwardStatus::Failed(e) if e.is_transient()));
    }
}
