//! Request admission for Shopgate.
//!
//! This crate provides the admission core of the gateway:
//! - a rule registry resolving endpoints to named fixed-window rules,
//!   with role-based quota scaling
//! - a window counter engine deciding admissions against a shared
//!   counter store (in-memory or Redis), failing open to in-process
//!   counting when the store is unreachable
//! - a statistics monitor aggregating admission outcomes for
//!   operational visibility

#![deny(missing_docs)]

mod engine;
mod error;
mod monitor;
mod rules;
mod storage;

pub use engine::{AdmissionDecision, CounterEngine};
pub use error::RateLimitError;
pub use monitor::{BlockedEntry, MonitorSnapshot, StatsMonitor};
pub use rules::{RateLimitRule, RuleRegistry};
pub use storage::{CounterStore, MemoryStore, RedisStore, StorageError, StoreVerdict};

use config::RateLimitConfig;

/// The admission subsystem behind one explicitly constructed service
/// object: rule registry, counter engine and statistics monitor.
///
/// Construct it once at startup and share it behind an `Arc`; there is
/// no hidden module-level state.
pub struct RateLimiterService {
    registry: RuleRegistry,
    engine: CounterEngine,
    monitor: StatsMonitor,
}

impl RateLimiterService {
    /// Create the service with the configured storage backend.
    pub async fn new(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        let registry = RuleRegistry::new(config);
        let engine = CounterEngine::new(&config.storage).await?;

        Ok(Self {
            registry,
            engine,
            monitor: StatsMonitor::new(),
        })
    }

    /// The rule registry.
    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// The statistics monitor.
    pub fn monitor(&self) -> &StatsMonitor {
        &self.monitor
    }

    /// Admission decision for one request under `rule`, counted against
    /// the quota bucket identified by `key`.
    pub async fn admit(&self, key: &str, rule: &RateLimitRule) -> AdmissionDecision {
        self.engine.admit(key, rule).await
    }
}
