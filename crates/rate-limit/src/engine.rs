//! Window counter engine: fixed-window admission decisions against the
//! shared counter store, failing open when the store is unreachable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use config::StorageConfig;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::error::RateLimitError;
use crate::rules::RateLimitRule;
use crate::storage::{CounterStore, MemoryStore, RedisStore, StoreVerdict, now_epoch_ms};

/// Delay between liveness probes of an unreachable store.
const RECOVERY_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one admission check. Derived per request, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Effective quota for the caller, role scaling included.
    pub limit: u64,
    /// Requests counted against the current window.
    pub current: u64,
    /// Requests left in the current window.
    pub remaining: u64,
    /// Epoch milliseconds at which the window ends.
    pub reset_at_ms: u64,
    /// Seconds to wait before retrying; 0 when admitted.
    pub retry_after_secs: u64,
}

enum SharedStore {
    Memory(MemoryStore),
    Redis(Arc<RedisStore>),
}

/// Decides admissions with a fixed-window counter per key.
///
/// Counting normally runs against the shared counter store, which keeps
/// quotas correct across processes. When the store errors or times out
/// the engine falls back to a private in-process map under the same
/// keys, trading cross-process accuracy for availability: bookkeeping
/// failures must never turn into an outage of the API behind the gate.
///
/// `retry_after_secs` is wall-clock arithmetic against the store's
/// reported window end; clock skew between processes sharing one store
/// is accepted, not corrected.
pub struct CounterEngine {
    store: SharedStore,
    fallback: MemoryStore,
    store_healthy: Arc<AtomicBool>,
    probe_gate: Arc<Semaphore>,
}

impl CounterEngine {
    /// Create the engine with the configured storage backend. For the
    /// Redis backend this verifies connectivity up front.
    pub async fn new(config: &StorageConfig) -> Result<Self, RateLimitError> {
        let store = match config {
            StorageConfig::Memory => SharedStore::Memory(MemoryStore::new()),
            StorageConfig::Redis(redis_config) => {
                let store = RedisStore::new(redis_config).await?;
                SharedStore::Redis(Arc::new(store))
            }
        };

        Ok(Self::with_store(store))
    }

    fn with_store(store: SharedStore) -> Self {
        Self {
            store,
            fallback: MemoryStore::new(),
            store_healthy: Arc::new(AtomicBool::new(true)),
            probe_gate: Arc::new(Semaphore::new(1)),
        }
    }

    /// Admission decision for `key` under `rule`.
    pub async fn admit(&self, key: &str, rule: &RateLimitRule) -> AdmissionDecision {
        let verdict = match self.shared_verdict(key, rule).await {
            Some(verdict) => verdict,
            None => self.fallback.apply(key, rule.max_requests, rule.window),
        };

        decision(rule, verdict)
    }

    async fn shared_verdict(&self, key: &str, rule: &RateLimitRule) -> Option<StoreVerdict> {
        match &self.store {
            SharedStore::Memory(store) => Some(store.apply(key, rule.max_requests, rule.window)),
            SharedStore::Redis(store) => {
                if !self.store_healthy.load(Ordering::Relaxed) {
                    return None;
                }

                match store.check_and_increment(key, rule.max_requests, rule.window).await {
                    Ok(verdict) => Some(verdict),
                    Err(err) => {
                        log::error!("Shared counter store unavailable, failing open to in-process counting: {err}");
                        self.mark_store_unhealthy(store);
                        None
                    }
                }
            }
        }
    }

    /// Takes the store out of rotation and probes it in the background
    /// until it answers again.
    fn mark_store_unhealthy(&self, store: &Arc<RedisStore>) {
        self.store_healthy.store(false, Ordering::Relaxed);

        let Ok(permit) = self.probe_gate.clone().try_acquire_owned() else {
            // A probe task is already running.
            return;
        };

        let store = store.clone();
        let healthy = self.store_healthy.clone();

        tokio::spawn(async move {
            let _permit = permit;

            loop {
                tokio::time::sleep(RECOVERY_PROBE_INTERVAL).await;

                if store.ping().await.is_ok() {
                    log::info!("Shared counter store connection recovered");
                    healthy.store(true, Ordering::Relaxed);
                    return;
                }
            }
        });
    }
}

fn decision(rule: &RateLimitRule, verdict: StoreVerdict) -> AdmissionDecision {
    let retry_after_secs = if verdict.allowed {
        0
    } else {
        verdict
            .reset_at_ms
            .saturating_sub(now_epoch_ms())
            .div_ceil(1_000)
            .max(1)
    };

    AdmissionDecision {
        allowed: verdict.allowed,
        limit: rule.max_requests,
        current: verdict.count,
        remaining: rule.max_requests.saturating_sub(verdict.count),
        reset_at_ms: verdict.reset_at_ms,
        retry_after_secs,
    }
}
