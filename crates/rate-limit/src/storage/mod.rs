//! Storage backends for the shared counter store.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

/// State of one quota bucket after an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreVerdict {
    /// Whether the request was applied to the window.
    pub allowed: bool,
    /// Count of requests applied to the current window, including this
    /// one when it was allowed.
    pub count: u64,
    /// Epoch milliseconds at which the current window ends.
    pub reset_at_ms: u64,
}

/// Trait for shared counter store backends.
///
/// A counter record is created by the first request of a window and is
/// logically destroyed once the window ends; an expired record is
/// treated as absent and overwritten by the next request.
#[allow(async_fn_in_trait)]
pub trait CounterStore: Send + Sync {
    /// Atomically apply one request to the fixed window for `key`.
    ///
    /// Creating the window admits the request unconditionally; within an
    /// existing window the count is incremented only while it is below
    /// `max_requests`. Rejected requests do not grow the count.
    async fn check_and_increment(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<StoreVerdict, StorageError>;
}

/// Errors that can occur in storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to reach the store.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command.
    #[error("Query error: {0}")]
    Query(String),

    /// The store did not answer within the configured response timeout.
    #[error("Store did not respond within {0:?}")]
    Timeout(Duration),
}

pub(crate) fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
