//! History Store Error Types
//!
//! ## Error Categories
//!
//! ### Database Errors
//! - `Database`: PostgreSQL failed a statement. Whether it is worth retrying
//!   depends on the SQLSTATE class (see [`StoreError::is_transient`]).
//!
//! ### Row Errors
//! - `RowRejected`: one or more rows violated a constraint. Raised by
//!   backends that do not go through PostgreSQL; for `Database` errors the
//!   same condition is recognised from the SQLSTATE (see
//!   [`StoreError::is_row_local`]).
//!
//! ### Setup Errors
//! - `InvalidTableName`: the configured table name is not a plain identifier.
//! - `Unavailable`: the backend cannot take writes right now.
//!
//! ## Retry Classification
//!
//! | SQLSTATE class | Meaning                          | Handling      |
//! |----------------|----------------------------------|---------------|
//! | `08`           | connection exception             | transient     |
//! | `40`           | serialization failure / deadlock | transient     |
//! | `53`           | insufficient resources           | transient     |
//! | `57`           | operator intervention / shutdown | transient     |
//! | `22`           | data exception                   | row-local     |
//! | `23`           | integrity constraint violation   | row-local     |
//! | anything else  |                                  | permanent     |

use fleetpulse_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Row rejected: {0}")]
    RowRejected(String),

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    #[error("History store unavailable: {0}")]
    Unavailable(String),
}

const TRANSIENT_CLASSES: [&str; 4] = ["08", "40", "53", "57"];
const ROW_LOCAL_CLASSES: [&str; 2] = ["22", "23"];

impl StoreError {
    /// Whether retrying the same write later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => sqlstate_class(db.code().as_deref())
                    .map_or(false, |class| TRANSIENT_CLASSES.contains(&class)),
                _ => false,
            },
            StoreError::Unavailable(_) => true,
            StoreError::Core(_) | StoreError::RowRejected(_) | StoreError::InvalidTableName(_) => {
                false
            }
        }
    }

    /// Whether the failure was caused by the contents of particular rows, so
    /// that writing the batch in smaller pieces can isolate them.
    pub fn is_row_local(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => {
                sqlstate_class(db.code().as_deref())
                    .map_or(false, |class| ROW_LOCAL_CLASSES.contains(&class))
            }
            StoreError::RowRejected(_) => true,
            _ => false,
        }
    }
}

fn sqlstate_class(code: Option<&str>) -> Option<&str> {
    code.and_then(|c| c.get(..2))
}

/// SQLSTATE for "relation already exists".
pub(crate) const DUPLICATE_TABLE: &str = "42P07";

pub(crate) fn is_duplicate_table(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(DUPLICATE_TABLE),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_class() {
        assert_eq!(sqlstate_class(Some("23505")), Some("23"));
        assert_eq!(sqlstate_class(Some("0")), None);
        assert_eq!(sqlstate_class(None), None);
    }

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(StoreError::from(sqlx::Error::PoolClosed).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(StoreError::from(sqlx::Error::Io(io)).is_transient());
    }

    #[test]
    fn test_classification_of_local_variants() {
        let rejected = StoreError::RowRejected("latitude check".to_string());
        assert!(rejected.is_row_local());
        assert!(!rejected.is_transient());

        let down = StoreError::Unavailable("maintenance".to_string());
        assert!(down.is_transient());
        assert!(!down.is_row_local());

        let bad_name = StoreError::InvalidTableName("drop table".to_string());
        assert!(!bad_name.is_transient());
        assert!(!bad_name.is_row_local());

        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
    }
}
