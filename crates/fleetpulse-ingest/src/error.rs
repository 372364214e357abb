//! Ingest Error Types
//!
//! ## Error Categories
//!
//! - `Cache` / `Store`: the append log or the history store failed. These
//!   are infrastructure problems: the entry is retried with backoff and only
//!   dead-lettered once its retry budget is spent.
//! - `Core`: the entry itself is unusable (malformed fields, out-of-range
//!   coordinates). Retrying cannot help, so the entry is dead-lettered on
//!   first sight.
//! - `Config`: an environment variable could not be parsed or a value is
//!   out of range. Fatal at startup.
//! - `Worker`: a worker task ended abnormally.

use fleetpulse_cache::CacheError;
use fleetpulse_core::CoreError;
use fleetpulse_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(e: tokio::task::JoinError) -> Self {
        IngestError::Worker(e.to_string())
    }
}

impl IngestError {
    /// Whether the failure is a property of the data, so retrying the same
    /// entry can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            IngestError::Core(_) | IngestError::Cache(CacheError::Core(_))
        )
    }
}
