//! Poison-pill routing.
//!
//! An entry that can never be persisted is copied to the dead-letter log
//! together with its failure context, and only then acknowledged on its
//! source log. The copy comes first: if the worker dies in between, the
//! entry is redelivered and dead-lettered again rather than lost.

use std::sync::Arc;

use fleetpulse_cache::{AppendLog, DeadLetterRecord, LogEntry};
use tracing::error;

use crate::error::Result;

pub struct DeadLetterRouter {
    log: Arc<dyn AppendLog>,
    group: String,
}

impl DeadLetterRouter {
    pub fn new(log: Arc<dyn AppendLog>, group: impl Into<String>) -> Self {
        Self {
            log,
            group: group.into(),
        }
    }

    /// Dead-letter `entry` and acknowledge it.
    pub async fn route(&self, entry: &LogEntry, failure_count: u32, last_error: &str) -> Result<()> {
        self.route_all(&[(entry, failure_count, last_error.to_string())])
            .await
    }

    /// Dead-letter several entries, then acknowledge them together.
    pub async fn route_all(&self, failed: &[(&LogEntry, u32, String)]) -> Result<()> {
        if failed.is_empty() {
            return Ok(());
        }

        for (entry, failure_count, last_error) in failed {
            let record = DeadLetterRecord {
                driver_id: entry.driver_id,
                entry_id: entry.id,
                fields: entry.fields.clone(),
                failure_count: *failure_count,
                last_error: last_error.clone(),
            };
            self.log.dead_letter(&record).await?;
            error!(
                driver_id = entry.driver_id,
                entry_id = %entry.id,
                failure_count,
                error = %last_error,
                "Entry dead-lettered"
            );
        }

        let ids: Vec<_> = failed
            .iter()
            .map(|(entry, _, _)| (entry.driver_id, entry.id))
            .collect();
        self.log.ack(&self.group, &ids).await?;
        Ok(())
    }
}
