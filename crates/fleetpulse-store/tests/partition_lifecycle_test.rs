//! Partition routing and retention through the in-process store.

use chrono::{DateTime, Duration, TimeZone, Utc};
use fleetpulse_core::TrackPoint;
use fleetpulse_store::{
    partition_name, BatchPersister, MemoryHistoryStore, PartitionMaintenance, PartitionWeek,
};

fn monday(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

#[tokio::test]
async fn test_rows_land_in_their_week_or_default() {
    let store = MemoryHistoryStore::new("location_history").unwrap();
    let now = monday(2024, 5, 13); // week 20
    store.ensure_partitions(now, 4).await.unwrap();

    let in_week_22 = TrackPoint::new(1, 43.1, 131.9, now + Duration::weeks(2) + Duration::hours(5));
    let last_instant_of_20 =
        TrackPoint::new(2, 43.1, 131.9, now + Duration::weeks(1) - Duration::microseconds(1));
    let far_future = TrackPoint::new(3, 43.1, 131.9, now + Duration::weeks(30));
    let past = TrackPoint::new(4, 43.1, 131.9, now - Duration::days(1));

    let outcome = store
        .persist(&[in_week_22, last_instant_of_20, far_future, past])
        .await
        .unwrap();
    assert_eq!(outcome.written, 4);

    assert_eq!(
        store.partition_rows("location_history_y2024_w22").await,
        vec![in_week_22]
    );
    assert_eq!(
        store.partition_rows("location_history_y2024_w20").await,
        vec![last_instant_of_20]
    );
    assert_eq!(
        store.partition_rows("location_history_default").await,
        vec![far_future, past]
    );
}

#[tokio::test]
async fn test_retention_drops_only_weeks_before_cutoff() {
    let store = MemoryHistoryStore::new("location_history").unwrap();
    let start = monday(2024, 1, 1); // 2024-W01

    // Twelve weeks of partitions, one row each.
    for week in 0..12 {
        let at = start + Duration::weeks(week);
        store.ensure_partitions(at, 0).await.unwrap();
        store
            .persist(&[TrackPoint::new(1, 10.0, 10.0, at + Duration::hours(1))])
            .await
            .unwrap();
    }

    // now = start of W13, cutoff = start of W05.
    let now = start + Duration::weeks(12);
    let dropped = store.drop_expired(now, 8).await.unwrap();

    let expected: Vec<String> = (1..=4)
        .map(|w| partition_name("location_history", &PartitionWeek::new(2024, w).unwrap()))
        .collect();
    assert_eq!(dropped, expected);

    let remaining = store.partitions().await;
    for w in 5..=12 {
        let name = partition_name("location_history", &PartitionWeek::new(2024, w).unwrap());
        assert!(remaining.contains(&name), "{name} should be kept");
    }
    assert!(remaining.contains(&"location_history_default".to_string()));
    assert_eq!(store.rows().await.len(), 8);

    // A second run has nothing left to do.
    assert!(store.drop_expired(now, 8).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_rows_do_not_block_the_batch() {
    let store = MemoryHistoryStore::new("location_history").unwrap();
    store.reject_driver(13).await;
    let ts = monday(2024, 5, 13);

    let batch: Vec<TrackPoint> = (10..16)
        .map(|id| TrackPoint::new(id, 1.0, 1.0, ts))
        .collect();
    let outcome = store.persist(&batch).await.unwrap();

    assert_eq!(outcome.written, 5);
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].index, 3);
    assert_eq!(outcome.rejected[0].point.driver_id, 13);
}
