//! Error types for fleetpulse core.
//!
//! Every variant here describes a *permanent* problem with a piece of data:
//! retrying the same input will fail the same way. Callers downstream use this
//! to route such entries straight to the dead-letter log.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Malformed entry: {0}")]
    MalformedEntry(String),

    #[error("Invalid entry id: {0}")]
    InvalidEntryId(String),

    #[error("Unknown driver status: {0}")]
    UnknownStatus(String),

    #[error("Timestamp out of range: {0}")]
    TimestampOutOfRange(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
