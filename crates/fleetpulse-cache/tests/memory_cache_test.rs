//! Behaviour of the in-process cache backend.
//!
//! These cover the read/write path contract and the consumer-group semantics
//! the persistence workers depend on.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use fleetpulse_cache::{AppendLog, DeadLetterRecord, LocationCache, MemoryLocationCache};
use fleetpulse_core::{DriverStatus, EntryId, LocationUpdate};

const GROUP: &str = "location-persisters";

fn update(driver_id: i64, lat: f64, lon: f64) -> LocationUpdate {
    LocationUpdate::new(driver_id, lat, lon, DriverStatus::Online, Utc::now())
}

// ---------------------------------------------------------------------------
// Write / read path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_active_drivers_reflect_latest_point() {
    let cache = MemoryLocationCache::new(Duration::from_secs(300));
    cache.update(&update(1, 43.1150, 131.8860)).await.unwrap();
    cache.update(&update(2, 55.0, 37.0)).await.unwrap();
    cache.update(&update(1, 43.1300, 131.9500)).await.unwrap();

    let mut active = cache.get_active_drivers().await.unwrap();
    active.sort_by_key(|p| p.driver_id);
    assert_eq!(active.len(), 2);
    assert_eq!(active[0].driver_id, 1);
    assert_eq!(active[0].lat, 43.1300);
    assert_eq!(active[0].lon, 131.9500);
    assert_eq!(active[1].driver_id, 2);

    let one = cache.get_driver_location(1).await.unwrap().unwrap();
    assert_eq!(one.lat, 43.1300);
    assert!(cache.get_driver_location(3).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_coordinates_are_rejected_without_side_effects() {
    let cache = MemoryLocationCache::default();
    assert!(cache.update(&update(1, 91.0, 0.0)).await.is_err());
    assert!(cache.update(&update(1, 0.0, f64::NAN)).await.is_err());

    assert!(cache.get_active_drivers().await.unwrap().is_empty());
    assert_eq!(cache.log_len(1).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_driver_is_evicted_on_read() {
    let cache = MemoryLocationCache::new(Duration::from_secs(300));
    cache.update(&update(1, 10.0, 10.0)).await.unwrap();

    tokio::time::advance(Duration::from_secs(200)).await;
    cache.update(&update(2, 20.0, 20.0)).await.unwrap();

    tokio::time::advance(Duration::from_secs(150)).await;
    let active = cache.get_active_drivers().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].driver_id, 2);
    assert!(cache.get_driver_location(1).await.unwrap().is_none());

    // The append log is unaffected by cache expiry.
    assert_eq!(cache.log_len(1).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_refreshed_driver_survives_eviction() {
    let cache = MemoryLocationCache::new(Duration::from_secs(300));
    cache.update(&update(1, 10.0, 10.0)).await.unwrap();

    tokio::time::advance(Duration::from_secs(299)).await;
    cache.update(&update(1, 10.0, 10.5)).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let active = cache.get_active_drivers().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].lon, 10.5);
}

#[tokio::test]
async fn test_without_append_log_updates_leave_no_entries() {
    let cache = MemoryLocationCache::default().with_append_log(false);
    cache.ensure_group(1, GROUP).await.unwrap();
    assert_eq!(cache.update(&update(1, 1.0, 1.0)).await.unwrap(), None);
    assert_eq!(cache.update(&update(1, 1.0, 2.0)).await.unwrap(), None);

    assert_eq!(cache.log_len(1).await, 0);
    assert_eq!(cache.get_driver_location(1).await.unwrap().unwrap().lon, 2.0);
    assert!(cache
        .read_new(GROUP, "a", &[1], 10, Duration::ZERO)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_update_resets_ttl() {
    let cache = MemoryLocationCache::new(Duration::from_secs(300));
    cache.update(&update(1, 10.0, 10.0)).await.unwrap();
    tokio::time::advance(Duration::from_secs(250)).await;
    cache.update(&update(1, 10.0, 10.1)).await.unwrap();
    tokio::time::advance(Duration::from_secs(250)).await;

    assert_eq!(cache.get_active_drivers().await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Consumer groups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_entries_are_delivered_once_per_group_in_order() {
    let cache = MemoryLocationCache::default();
    cache.ensure_group(1, GROUP).await.unwrap();
    for i in 0..5 {
        cache.update(&update(1, 10.0, 10.0 + i as f64)).await.unwrap();
    }

    let first = cache
        .read_new(GROUP, "a", &[1], 3, Duration::ZERO)
        .await
        .unwrap();
    let second = cache
        .read_new(GROUP, "b", &[1], 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(second.len(), 2);
    assert!(first.windows(2).all(|w| w[0].id < w[1].id));
    assert!(first.last().unwrap().id < second[0].id);
    assert_eq!(first[0].fields["lon"], "10");

    let nothing = cache
        .read_new(GROUP, "a", &[1], 10, Duration::ZERO)
        .await
        .unwrap();
    assert!(nothing.is_empty());
    assert_eq!(cache.pending_count(GROUP).await, 5);
}

#[tokio::test]
async fn test_blocking_read_wakes_on_append() {
    let cache = MemoryLocationCache::default();
    cache.ensure_group(7, GROUP).await.unwrap();

    let reader = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .read_new(GROUP, "a", &[7], 10, Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cache.update(&update(7, 1.0, 1.0)).await.unwrap();

    let entries = reader.await.unwrap().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].driver_id, 7);
}

#[tokio::test(start_paused = true)]
async fn test_blocking_read_times_out_empty() {
    let cache = MemoryLocationCache::default();
    cache.ensure_group(7, GROUP).await.unwrap();
    let entries = cache
        .read_new(GROUP, "a", &[7], 10, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn test_ack_removes_entry_and_retry_counter() {
    let cache = MemoryLocationCache::default();
    cache.ensure_group(1, GROUP).await.unwrap();
    let id = cache.update(&update(1, 1.0, 1.0)).await.unwrap().unwrap();

    let entries = cache
        .read_new(GROUP, "a", &[1], 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(entries[0].id, id);

    assert_eq!(cache.record_failure(1, &id).await.unwrap(), 1);
    assert_eq!(cache.record_failure(1, &id).await.unwrap(), 2);

    cache.ack(GROUP, &[(1, id)]).await.unwrap();
    assert_eq!(cache.log_len(1).await, 0);
    assert_eq!(cache.pending_count(GROUP).await, 0);
    // Counter starts over once the entry is gone.
    assert_eq!(cache.record_failure(1, &id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_read_pending_redelivers_own_unacked_entries() {
    let cache = MemoryLocationCache::default();
    cache.ensure_group(1, GROUP).await.unwrap();
    cache.update(&update(1, 1.0, 1.0)).await.unwrap();
    cache.update(&update(1, 1.0, 2.0)).await.unwrap();

    let delivered = cache
        .read_new(GROUP, "a", &[1], 10, Duration::ZERO)
        .await
        .unwrap();
    cache
        .ack(GROUP, &[(1, delivered[0].id)])
        .await
        .unwrap();

    // Same consumer name after a restart.
    let again = cache.read_pending(GROUP, "a", &[1], 10).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, delivered[1].id);
    assert_eq!(again[0].delivery_count, 2);

    let other = cache.read_pending(GROUP, "b", &[1], 10).await.unwrap();
    assert!(other.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_claim_idle_takes_over_stuck_entries() {
    let cache = MemoryLocationCache::default();
    cache.ensure_group(1, GROUP).await.unwrap();
    cache.update(&update(1, 1.0, 1.0)).await.unwrap();

    let delivered = cache
        .read_new(GROUP, "crashed", &[1], 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    let early = cache
        .claim_idle(GROUP, "rescuer", &[1], Duration::from_secs(60), 10)
        .await
        .unwrap();
    assert!(early.is_empty());

    tokio::time::advance(Duration::from_secs(61)).await;
    let claimed = cache
        .claim_idle(GROUP, "rescuer", &[1], Duration::from_secs(60), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, delivered[0].id);
    assert_eq!(claimed[0].delivery_count, 2);

    // Ownership moved: the crashed consumer no longer sees it as its own.
    assert!(cache
        .read_pending(GROUP, "crashed", &[1], 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_read_new_returns_at_most_count_across_drivers() {
    let cache = MemoryLocationCache::default();
    for driver_id in 1..=4 {
        cache.ensure_group(driver_id, GROUP).await.unwrap();
        for i in 0..3 {
            cache
                .update(&update(driver_id, 1.0, 1.0 + i as f64))
                .await
                .unwrap();
        }
    }

    let entries = cache
        .read_new(GROUP, "a", &[1, 2, 3, 4], 5, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(entries.len(), 5);
    assert_eq!(cache.pending_count(GROUP).await, 5);
}

// ---------------------------------------------------------------------------
// Group membership
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_live_members_drop_silent_members() {
    let cache = MemoryLocationCache::default();
    let ttl = Duration::from_secs(60);
    cache.heartbeat(GROUP, "host-b/worker-0").await.unwrap();
    cache.heartbeat(GROUP, "host-a/worker-0").await.unwrap();
    cache.heartbeat("other-group", "host-c/worker-0").await.unwrap();

    assert_eq!(
        cache.live_members(GROUP, ttl).await.unwrap(),
        vec!["host-a/worker-0", "host-b/worker-0"]
    );

    tokio::time::advance(Duration::from_secs(45)).await;
    cache.heartbeat(GROUP, "host-a/worker-0").await.unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;

    assert_eq!(
        cache.live_members(GROUP, ttl).await.unwrap(),
        vec!["host-a/worker-0"]
    );
    assert!(cache
        .live_members("other-group", ttl)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_leave_removes_member_at_once() {
    let cache = MemoryLocationCache::default();
    let ttl = Duration::from_secs(60);
    cache.heartbeat(GROUP, "a").await.unwrap();
    cache.heartbeat(GROUP, "b").await.unwrap();

    cache.leave(GROUP, "a").await.unwrap();
    cache.leave(GROUP, "never-joined").await.unwrap();
    assert_eq!(cache.live_members(GROUP, ttl).await.unwrap(), vec!["b"]);
}

#[tokio::test]
async fn test_dead_letters_are_append_only() {
    let cache = MemoryLocationCache::default();
    let fields: HashMap<String, String> = [("lat".to_string(), "north".to_string())].into();
    let raw = cache.append_raw(4, fields.clone()).await;

    let record = DeadLetterRecord {
        driver_id: 4,
        entry_id: raw,
        fields,
        failure_count: 1,
        last_error: "Malformed entry: field 'lat' is not a number".to_string(),
    };
    let first = cache.dead_letter(&record).await.unwrap();
    let second = cache.dead_letter(&record).await.unwrap();
    assert!(first < second);

    let stored = cache.dead_letters(10).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0], record);
    assert_eq!(cache.dead_letters(1).await.unwrap().len(), 1);
    assert_ne!(raw, EntryId::MIN);
}
