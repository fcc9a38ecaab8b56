//! Error types for request admission.

use crate::storage::StorageError;

/// Errors that can occur while setting up or running the admission
/// subsystem. Store failures during an admission check never surface
/// here; the engine absorbs them and fails open.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
