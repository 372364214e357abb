//! Partial-batch failure isolation.
//!
//! A batch is written in one transaction. When that transaction fails because
//! of what is *in* some rows (a check or type violation), the batch is split
//! in half and each half retried, recursively, until every failing row is
//! alone. Everything else commits.
//!
//! ```text
//! [a b c d e f g h]            fails (row-local)
//! [a b c d] [e f g h]          first commits, second fails
//!           [e f] [g h]        first commits, second fails
//!                 [g] [h]      g commits, h rejected
//! ```
//!
//! Rows failing validation never reach the database. Non row-local errors
//! abort the whole call; halves committed before that stay committed, which
//! is safe because history inserts ignore `(driver_id, recorded_at)`
//! conflicts.

use async_trait::async_trait;
use fleetpulse_core::TrackPoint;
use tracing::{debug, warn};

use crate::error::Result;
use crate::{PersistOutcome, RejectedRow};

/// One all-or-nothing write of a batch.
#[async_trait]
pub(crate) trait WriteBatch: Send + Sync {
    /// Returns the number of rows actually inserted (duplicates excluded).
    async fn write_batch(&self, rows: &[TrackPoint]) -> Result<u64>;
}

pub(crate) async fn persist_isolating<W>(writer: &W, rows: &[TrackPoint]) -> Result<PersistOutcome>
where
    W: WriteBatch + ?Sized,
{
    let mut outcome = PersistOutcome::default();

    let mut valid: Vec<(usize, TrackPoint)> = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        match row.point.validate() {
            Ok(()) => valid.push((index, *row)),
            Err(e) => outcome.rejected.push(RejectedRow {
                index,
                point: *row,
                reason: e.to_string(),
            }),
        }
    }

    let mut stack = vec![valid];
    while let Some(mut chunk) = stack.pop() {
        if chunk.is_empty() {
            continue;
        }
        let points: Vec<TrackPoint> = chunk.iter().map(|(_, p)| *p).collect();
        match writer.write_batch(&points).await {
            Ok(written) => outcome.written += written,
            Err(e) if e.is_row_local() => {
                if chunk.len() == 1 {
                    let (index, point) = chunk[0];
                    warn!(
                        driver_id = point.driver_id,
                        recorded_at = %point.recorded_at,
                        error = %e,
                        "Row rejected by history store"
                    );
                    outcome.rejected.push(RejectedRow {
                        index,
                        point,
                        reason: e.to_string(),
                    });
                } else {
                    debug!(rows = chunk.len(), error = %e, "Bisecting batch");
                    let right = chunk.split_off(chunk.len() / 2);
                    // Left half is popped first, keeping commit order stable.
                    stack.push(right);
                    stack.push(chunk);
                }
            }
            Err(e) => return Err(e),
        }
    }

    outcome.rejected.sort_by_key(|r| r.index);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use chrono::Utc;
    use std::sync::Mutex;

    /// Rejects any batch containing a poisoned driver, records committed rows.
    struct Picky {
        poisoned: Vec<i64>,
        committed: Mutex<Vec<i64>>,
        calls: Mutex<usize>,
        fail_hard: bool,
    }

    impl Picky {
        fn new(poisoned: Vec<i64>) -> Self {
            Self {
                poisoned,
                committed: Mutex::new(Vec::new()),
                calls: Mutex::new(0),
                fail_hard: false,
            }
        }
    }

    #[async_trait]
    impl WriteBatch for Picky {
        async fn write_batch(&self, rows: &[TrackPoint]) -> Result<u64> {
            *self.calls.lock().unwrap() += 1;
            if self.fail_hard {
                return Err(StoreError::Unavailable("down".to_string()));
            }
            if rows.iter().any(|r| self.poisoned.contains(&r.driver_id)) {
                return Err(StoreError::RowRejected("poisoned".to_string()));
            }
            self.committed
                .lock()
                .unwrap()
                .extend(rows.iter().map(|r| r.driver_id));
            Ok(rows.len() as u64)
        }
    }

    fn rows(ids: &[i64]) -> Vec<TrackPoint> {
        let ts = Utc::now();
        ids.iter().map(|&id| TrackPoint::new(id, 1.0, 1.0, ts)).collect()
    }

    #[tokio::test]
    async fn test_clean_batch_is_one_write() {
        let writer = Picky::new(vec![]);
        let outcome = persist_isolating(&writer, &rows(&[1, 2, 3])).await.unwrap();
        assert_eq!(outcome.written, 3);
        assert!(outcome.rejected.is_empty());
        assert_eq!(*writer.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bad_rows_are_isolated() {
        let writer = Picky::new(vec![3, 7]);
        let outcome = persist_isolating(&writer, &rows(&[1, 2, 3, 4, 5, 6, 7, 8]))
            .await
            .unwrap();

        assert_eq!(outcome.written, 6);
        let rejected: Vec<usize> = outcome.rejected.iter().map(|r| r.index).collect();
        assert_eq!(rejected, vec![2, 6]);
        assert_eq!(*writer.committed.lock().unwrap(), vec![1, 2, 4, 5, 6, 8]);
    }

    #[tokio::test]
    async fn test_invalid_coordinates_never_reach_writer() {
        let writer = Picky::new(vec![]);
        let mut batch = rows(&[1, 2]);
        batch[1].point.lat = 120.0;
        let outcome = persist_isolating(&writer, &batch).await.unwrap();

        assert_eq!(outcome.written, 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].index, 1);
        assert!(outcome.rejected[0].reason.contains("latitude"));
    }

    #[tokio::test]
    async fn test_transient_error_aborts() {
        let mut writer = Picky::new(vec![]);
        writer.fail_hard = true;
        let err = persist_isolating(&writer, &rows(&[1])).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_empty_batch_does_not_write() {
        let writer = Picky::new(vec![]);
        let outcome = persist_isolating(&writer, &[]).await.unwrap();
        assert_eq!(outcome.written, 0);
        assert_eq!(*writer.calls.lock().unwrap(), 0);
    }
}
