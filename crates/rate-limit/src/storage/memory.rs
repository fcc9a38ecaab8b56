//! In-process fixed-window counter map.

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{CounterStore, StorageError, StoreVerdict, now_epoch_ms};

/// Fixed-window counters held in process memory.
///
/// Serves both as the standalone storage backend for single-instance
/// deployments and as the fail-open fallback of the counter engine.
/// Counters are per-process: independent instances behind a load
/// balancer do not share counts, so horizontally scaled deployments
/// need the Redis backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, CounterRecord>,
}

#[derive(Debug, Clone, Copy)]
struct CounterRecord {
    count: u64,
    reset_at_ms: u64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Number of live counter records, expired ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no counter records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop records whose window has ended. An expired record is already
    /// treated as absent by [`apply`](Self::apply); this only reclaims
    /// the memory of buckets that stopped receiving traffic.
    pub fn evict_expired(&self) {
        let now = now_epoch_ms();
        self.records.retain(|_, record| record.reset_at_ms >= now);
    }

    pub(crate) fn apply(&self, key: &str, max_requests: u64, window: Duration) -> StoreVerdict {
        let now = now_epoch_ms();
        let window_ms = window.as_millis() as u64;

        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();

                if now > record.reset_at_ms {
                    // The previous window ended; the record is logically
                    // absent and this request starts a new one.
                    *record = CounterRecord {
                        count: 1,
                        reset_at_ms: now + window_ms,
                    };

                    return StoreVerdict {
                        allowed: true,
                        count: 1,
                        reset_at_ms: record.reset_at_ms,
                    };
                }

                if record.count < max_requests {
                    record.count += 1;

                    return StoreVerdict {
                        allowed: true,
                        count: record.count,
                        reset_at_ms: record.reset_at_ms,
                    };
                }

                StoreVerdict {
                    allowed: false,
                    count: record.count,
                    reset_at_ms: record.reset_at_ms,
                }
            }
            Entry::Vacant(vacant) => {
                let record = CounterRecord {
                    count: 1,
                    reset_at_ms: now + window_ms,
                };
                vacant.insert(record);

                StoreVerdict {
                    allowed: true,
                    count: 1,
                    reset_at_ms: record.reset_at_ms,
                }
            }
        }
    }
}

impl CounterStore for MemoryStore {
    async fn check_and_increment(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<StoreVerdict, StorageError> {
        Ok(self.apply(key, max_requests, window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn first_request_creates_the_window() {
        let store = MemoryStore::new();

        let verdict = store.apply("ip:1.2.3.4", 5, WINDOW);

        assert!(verdict.allowed);
        assert_eq!(verdict.count, 1);
        assert!(verdict.reset_at_ms > now_epoch_ms());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn rejects_once_the_quota_is_exhausted() {
        let store = MemoryStore::new();

        for expected in 1..=5 {
            let verdict = store.apply("ip:1.2.3.4", 5, WINDOW);
            assert!(verdict.allowed);
            assert_eq!(verdict.count, expected);
        }

        let verdict = store.apply("ip:1.2.3.4", 5, WINDOW);
        assert!(!verdict.allowed);
        assert_eq!(verdict.count, 5);
    }

    #[test]
    fn rejected_requests_do_not_grow_the_count() {
        let store = MemoryStore::new();

        store.apply("key", 1, WINDOW);
        store.apply("key", 1, WINDOW);
        let verdict = store.apply("key", 1, WINDOW);

        assert!(!verdict.allowed);
        assert_eq!(verdict.count, 1);
    }

    #[test]
    fn separate_keys_have_separate_windows() {
        let store = MemoryStore::new();

        store.apply("ip:1.2.3.4", 1, WINDOW);
        let verdict = store.apply("ip:5.6.7.8", 1, WINDOW);

        assert!(verdict.allowed);
        assert_eq!(verdict.count, 1);
    }

    #[test]
    fn expired_window_restarts_the_count() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(20);

        assert!(store.apply("key", 1, window).allowed);
        assert!(!store.apply("key", 1, window).allowed);

        std::thread::sleep(Duration::from_millis(30));

        let verdict = store.apply("key", 1, window);
        assert!(verdict.allowed);
        assert_eq!(verdict.count, 1);
    }

    #[test]
    fn zero_quota_admits_only_the_window_creating_request() {
        let store = MemoryStore::new();

        assert!(store.apply("key", 0, WINDOW).allowed);
        assert!(!store.apply("key", 0, WINDOW).allowed);
        assert!(!store.apply("key", 0, WINDOW).allowed);
    }

    #[test]
    fn evict_expired_reclaims_finished_windows() {
        let store = MemoryStore::new();

        store.apply("short", 5, Duration::from_millis(10));
        store.apply("long", 5, WINDOW);
        assert_eq!(store.len(), 2);

        std::thread::sleep(Duration::from_millis(20));
        store.evict_expired();

        assert_eq!(store.len(), 1);
    }
}
