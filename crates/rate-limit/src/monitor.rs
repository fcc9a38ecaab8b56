//! Statistics monitor: rolling aggregates over admission decisions.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Maximum retained latency samples; the oldest sample is evicted first.
const LATENCY_SAMPLE_CAP: usize = 1_000;

/// Number of entries in the blocked top lists.
const TOP_ENTRIES: usize = 10;

/// Rolling aggregates over every admission decision.
///
/// Safe to call from concurrent request tasks; recording touches
/// atomics and sharded maps only. The monitor never reads or mutates
/// counter records, so resetting it has no effect on in-flight windows.
#[derive(Debug, Default)]
pub struct StatsMonitor {
    total_requests: AtomicU64,
    blocked_requests: AtomicU64,
    first_seen_seq: AtomicU64,
    endpoints: DashMap<String, EndpointStats>,
    callers: DashMap<String, BlockedStats>,
    latencies: Mutex<VecDeque<u64>>,
}

#[derive(Debug, Default)]
struct EndpointStats {
    total: u64,
    blocked: u64,
    first_seen: u64,
}

#[derive(Debug)]
struct BlockedStats {
    blocked: u64,
    first_seen: u64,
}

impl StatsMonitor {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one admission outcome.
    pub fn record_request(&self, endpoint: &str, caller: &str, latency_ms: u64, blocked: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if blocked {
            self.blocked_requests.fetch_add(1, Ordering::Relaxed);
        }

        {
            let mut stats = self
                .endpoints
                .entry(endpoint.to_string())
                .or_insert_with(|| EndpointStats {
                    first_seen: self.next_seq(),
                    ..Default::default()
                });

            stats.total += 1;

            if blocked {
                stats.blocked += 1;
            }
        }

        if blocked {
            let mut stats = self
                .callers
                .entry(caller.to_string())
                .or_insert_with(|| BlockedStats {
                    blocked: 0,
                    first_seen: self.next_seq(),
                });

            stats.blocked += 1;
        }

        let mut latencies = lock(&self.latencies);

        if latencies.len() == LATENCY_SAMPLE_CAP {
            latencies.pop_front();
        }

        latencies.push_back(latency_ms);
    }

    /// Point-in-time aggregate view.
    pub fn snapshot(&self) -> MonitorSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let blocked_requests = self.blocked_requests.load(Ordering::Relaxed);

        let blocked_percentage = if total_requests == 0 {
            0.0
        } else {
            blocked_requests as f64 / total_requests as f64 * 100.0
        };

        let (average_latency_ms, latency_samples) = {
            let latencies = lock(&self.latencies);

            if latencies.is_empty() {
                (0.0, 0)
            } else {
                let sum: u64 = latencies.iter().sum();
                (sum as f64 / latencies.len() as f64, latencies.len())
            }
        };

        let top_blocked_endpoints = top_entries(
            self.endpoints
                .iter()
                .filter(|entry| entry.value().blocked > 0)
                .map(|entry| (entry.key().clone(), entry.value().blocked, entry.value().first_seen)),
        );

        let top_blocked_callers = top_entries(
            self.callers
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().blocked, entry.value().first_seen)),
        );

        MonitorSnapshot {
            total_requests,
            blocked_requests,
            blocked_percentage,
            average_latency_ms,
            latency_samples,
            top_blocked_endpoints,
            top_blocked_callers,
        }
    }

    /// Clear every aggregate. Counter records in the shared store are
    /// not touched.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.blocked_requests.store(0, Ordering::Relaxed);
        self.first_seen_seq.store(0, Ordering::Relaxed);
        self.endpoints.clear();
        self.callers.clear();
        lock(&self.latencies).clear();
    }

    fn next_seq(&self) -> u64 {
        self.first_seen_seq.fetch_add(1, Ordering::Relaxed)
    }
}

fn lock(latencies: &Mutex<VecDeque<u64>>) -> std::sync::MutexGuard<'_, VecDeque<u64>> {
    latencies.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Top [`TOP_ENTRIES`] by blocked count, descending; ties keep
/// first-seen order.
fn top_entries(entries: impl Iterator<Item = (String, u64, u64)>) -> Vec<BlockedEntry> {
    let mut entries: Vec<_> = entries.collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    entries.truncate(TOP_ENTRIES);

    entries
        .into_iter()
        .map(|(name, blocked, _)| BlockedEntry { name, blocked })
        .collect()
}

/// Aggregated admission statistics.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    /// Requests recorded since startup or the last reset.
    pub total_requests: u64,
    /// Requests rejected over the same period.
    pub blocked_requests: u64,
    /// Share of rejected requests, in percent.
    pub blocked_percentage: f64,
    /// Mean admission latency over the retained samples, in
    /// milliseconds.
    pub average_latency_ms: f64,
    /// Number of retained latency samples.
    pub latency_samples: usize,
    /// Most-blocked endpoints, descending.
    pub top_blocked_endpoints: Vec<BlockedEntry>,
    /// Most-blocked callers, descending.
    pub top_blocked_callers: Vec<BlockedEntry>,
}

/// One row of a blocked top list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedEntry {
    /// Endpoint path or caller label.
    pub name: String,
    /// Number of blocked requests.
    pub blocked: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_monitor_snapshot() {
        let monitor = StatsMonitor::new();
        let snapshot = monitor.snapshot();

        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.blocked_requests, 0);
        assert_eq!(snapshot.blocked_percentage, 0.0);
        assert_eq!(snapshot.average_latency_ms, 0.0);
        assert!(snapshot.top_blocked_endpoints.is_empty());
        assert!(snapshot.top_blocked_callers.is_empty());
    }

    #[test]
    fn records_totals_and_blocked_counts() {
        let monitor = StatsMonitor::new();

        monitor.record_request("/api/products", "ip:1.2.3.4", 2, false);
        monitor.record_request("/api/products", "ip:1.2.3.4", 3, true);
        monitor.record_request("/api/shops", "client:42", 1, true);

        let snapshot = monitor.snapshot();

        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.blocked_requests, 2);
        assert_eq!(snapshot.latency_samples, 3);
        assert_eq!(snapshot.average_latency_ms, 2.0);
        assert!((snapshot.blocked_percentage - 66.666).abs() < 0.01);
    }

    #[test]
    fn only_blocked_requests_count_against_callers() {
        let monitor = StatsMonitor::new();

        monitor.record_request("/api/products", "ip:1.2.3.4", 1, false);
        monitor.record_request("/api/products", "ip:5.6.7.8", 1, true);

        let snapshot = monitor.snapshot();

        assert_eq!(
            snapshot.top_blocked_callers,
            vec![BlockedEntry {
                name: "ip:5.6.7.8".to_string(),
                blocked: 1
            }]
        );
    }

    #[test]
    fn top_lists_sort_by_count_with_first_seen_tie_break() {
        let monitor = StatsMonitor::new();

        monitor.record_request("/a", "ip:1.1.1.1", 1, true);
        monitor.record_request("/b", "ip:2.2.2.2", 1, true);
        monitor.record_request("/b", "ip:2.2.2.2", 1, true);
        monitor.record_request("/c", "ip:3.3.3.3", 1, true);

        let snapshot = monitor.snapshot();
        let names: Vec<_> = snapshot
            .top_blocked_endpoints
            .iter()
            .map(|entry| entry.name.as_str())
            .collect();

        // "/b" leads on count; "/a" beats "/c" on first-seen order.
        assert_eq!(names, vec!["/b", "/a", "/c"]);
    }

    #[test]
    fn top_lists_are_capped_at_ten() {
        let monitor = StatsMonitor::new();

        for i in 0..15 {
            monitor.record_request(&format!("/endpoint/{i}"), &format!("ip:10.0.0.{i}"), 1, true);
        }

        let snapshot = monitor.snapshot();

        assert_eq!(snapshot.top_blocked_endpoints.len(), 10);
        assert_eq!(snapshot.top_blocked_callers.len(), 10);
    }

    #[test]
    fn latency_buffer_evicts_the_oldest_sample() {
        let monitor = StatsMonitor::new();

        // One sample of 1000ms, then a full buffer of zeros evicts it.
        monitor.record_request("/a", "ip:1.1.1.1", 1_000, false);

        for _ in 0..LATENCY_SAMPLE_CAP {
            monitor.record_request("/a", "ip:1.1.1.1", 0, false);
        }

        let snapshot = monitor.snapshot();

        assert_eq!(snapshot.latency_samples, LATENCY_SAMPLE_CAP);
        assert_eq!(snapshot.average_latency_ms, 0.0);
    }

    #[test]
    fn reset_clears_all_aggregates() {
        let monitor = StatsMonitor::new();

        monitor.record_request("/api/products", "ip:1.2.3.4", 5, true);
        monitor.reset();

        let snapshot = monitor.snapshot();

        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.blocked_requests, 0);
        assert_eq!(snapshot.latency_samples, 0);
        assert!(snapshot.top_blocked_endpoints.is_empty());
        assert!(snapshot.top_blocked_callers.is_empty());
    }
}
