//! Distance-based down-sampling.
//!
//! A point is kept when it is the first one seen for its driver, or when it
//! lies at least `min_distance_meters` from the driver's last *persisted*
//! point. Everything else is dropped: the cache already serves the freshest
//! raw position, so history only needs points that show movement.
//!
//! ## Staging
//!
//! Decisions for a batch are computed against the persisted state plus the
//! points kept earlier in the same batch, without touching the state. The
//! state only moves forward through [`DownsampleFilter::commit`], once the
//! kept points are durably stored. A batch that fails to commit leaves the
//! filter exactly as it was, so its retry sees the same reference points.
//!
//! When the store refuses some kept points, the rest of the batch is decided
//! again with [`DownsampleFilter::restage`]: points already stored count as
//! references, refused ones do not, and undecided points are re-judged.
//!
//! ## Ownership
//!
//! The filter holds no locks. Drivers are assigned to workers by
//! [`HashRing`](crate::ring::HashRing) and every worker owns its own filter,
//! so a driver's state only ever has one writer. A worker that loses a driver
//! calls [`DownsampleFilter::forget`] so that, should the driver come back, its
//! state is reloaded from history.

use std::collections::{HashMap, HashSet};

use fleetpulse_core::{haversine_meters, DriverId, TrackPoint};

/// Default minimum movement between persisted points.
pub const DEFAULT_MIN_DISTANCE_METERS: f64 = 100.0;

/// Keyed store of each driver's last persisted point.
pub trait PointStateStore: Send {
    fn get(&self, driver_id: DriverId) -> Option<TrackPoint>;

    fn set(&mut self, point: TrackPoint);

    fn remove(&mut self, driver_id: DriverId);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`PointStateStore`] held in a `HashMap`.
#[derive(Debug, Default, Clone)]
pub struct MemoryPointState {
    points: HashMap<DriverId, TrackPoint>,
}

impl MemoryPointState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PointStateStore for MemoryPointState {
    fn get(&self, driver_id: DriverId) -> Option<TrackPoint> {
        self.points.get(&driver_id).copied()
    }

    fn set(&mut self, point: TrackPoint) {
        self.points.insert(point.driver_id, point);
    }

    fn remove(&mut self, driver_id: DriverId) {
        self.points.remove(&driver_id);
    }

    fn len(&self) -> usize {
        self.points.len()
    }
}

/// Outcome for one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Keep,
    /// Too close to the reference point.
    Drop { distance_meters: f64 },
}

impl Decision {
    pub fn is_keep(&self) -> bool {
        matches!(self, Decision::Keep)
    }
}

/// Where a point of a batch stands when the batch is staged again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Still to be decided.
    Open,
    /// Written to the store in this batch.
    Stored,
    /// Out of the batch: refused by the store, or given up on.
    Discarded,
}

pub struct DownsampleFilter<S = MemoryPointState> {
    state: S,
    min_distance_meters: f64,
    seeded: HashSet<DriverId>,
}

impl DownsampleFilter<MemoryPointState> {
    pub fn in_memory(min_distance_meters: f64) -> Self {
        Self::new(MemoryPointState::new(), min_distance_meters)
    }
}

impl<S: PointStateStore> DownsampleFilter<S> {
    pub fn new(state: S, min_distance_meters: f64) -> Self {
        Self {
            state,
            min_distance_meters,
            seeded: HashSet::new(),
        }
    }

    pub fn min_distance_meters(&self) -> f64 {
        self.min_distance_meters
    }

    pub fn last_persisted(&self, driver_id: DriverId) -> Option<TrackPoint> {
        self.state.get(driver_id)
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Drivers among `drivers` whose state was never loaded from history.
    pub fn unseeded(&self, drivers: impl IntoIterator<Item = DriverId>) -> Vec<DriverId> {
        let mut missing: Vec<DriverId> = drivers
            .into_iter()
            .filter(|d| !self.seeded.contains(d))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }

    /// Load history's most recent point for `drivers`.
    ///
    /// Drivers absent from `last_points` have no history; they are still
    /// marked seeded so history is not queried for them again.
    pub fn seed(&mut self, drivers: &[DriverId], mut last_points: HashMap<DriverId, TrackPoint>) {
        for &driver_id in drivers {
            if !self.seeded.insert(driver_id) {
                continue;
            }
            if let Some(point) = last_points.remove(&driver_id) {
                // A point committed by this filter since is newer than history.
                if self.state.get(driver_id).is_none() {
                    self.state.set(point);
                }
            }
        }
    }

    /// Decide a single point against a reference point.
    pub fn decide(&self, reference: Option<&TrackPoint>, point: &TrackPoint) -> Decision {
        match reference {
            None => Decision::Keep,
            Some(last) => {
                let distance_meters = haversine_meters(&last.point, &point.point);
                if distance_meters >= self.min_distance_meters {
                    Decision::Keep
                } else {
                    Decision::Drop { distance_meters }
                }
            }
        }
    }

    /// Decide every point of a batch, in order. The result is parallel to
    /// `points`. State is not modified.
    pub fn stage(&self, points: &[TrackPoint]) -> Vec<Decision> {
        let mut overlay: HashMap<DriverId, TrackPoint> = HashMap::new();
        points
            .iter()
            .map(|point| self.stage_one(&mut overlay, point))
            .collect()
    }

    /// Decide the [`Open`](Resolution::Open) points of a batch, in order,
    /// with the [`Stored`](Resolution::Stored) ones as references.
    /// `resolutions` is parallel to `points`; only open points get a decision.
    pub fn restage(
        &self,
        points: &[TrackPoint],
        resolutions: &[Resolution],
    ) -> Vec<Option<Decision>> {
        let mut overlay: HashMap<DriverId, TrackPoint> = HashMap::new();
        points
            .iter()
            .zip(resolutions)
            .map(|(point, resolution)| match resolution {
                Resolution::Open => Some(self.stage_one(&mut overlay, point)),
                Resolution::Stored => {
                    overlay.insert(point.driver_id, *point);
                    None
                }
                Resolution::Discarded => None,
            })
            .collect()
    }

    fn stage_one(&self, overlay: &mut HashMap<DriverId, TrackPoint>, point: &TrackPoint) -> Decision {
        let reference = overlay
            .get(&point.driver_id)
            .copied()
            .or_else(|| self.state.get(point.driver_id));
        let decision = self.decide(reference.as_ref(), point);
        if decision.is_keep() {
            overlay.insert(point.driver_id, *point);
        }
        decision
    }

    /// Drop everything known about a driver. The next batch for it seeds
    /// from history again.
    pub fn forget(&mut self, driver_id: DriverId) {
        self.state.remove(driver_id);
        self.seeded.remove(&driver_id);
    }

    /// Advance the state with points that are now durably stored, in batch
    /// order. A point older than the driver's current state (a redelivered
    /// entry) does not move it back.
    pub fn commit<'a>(&mut self, persisted: impl IntoIterator<Item = &'a TrackPoint>) {
        for point in persisted {
            self.seeded.insert(point.driver_id);
            let newer = self
                .state
                .get(point.driver_id)
                .map_or(true, |last| point.recorded_at >= last.recorded_at);
            if newer {
                self.state.set(*point);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn scenario() -> Vec<TrackPoint> {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 20, 9, 0, 0).unwrap();
        vec![
            TrackPoint::new(1, 43.1150, 131.8860, t0),
            TrackPoint::new(1, 43.1151, 131.8861, t0 + Duration::seconds(30)),
            TrackPoint::new(1, 43.1300, 131.9500, t0 + Duration::seconds(60)),
        ]
    }

    #[test]
    fn test_scenario_keeps_first_and_far_point() {
        let filter = DownsampleFilter::in_memory(DEFAULT_MIN_DISTANCE_METERS);
        let decisions = filter.stage(&scenario());

        assert_eq!(decisions[0], Decision::Keep);
        match decisions[1] {
            Decision::Drop { distance_meters } => assert!(distance_meters < 20.0),
            Decision::Keep => panic!("second point should be dropped"),
        }
        assert_eq!(decisions[2], Decision::Keep);
    }

    #[test]
    fn test_first_point_is_kept_at_any_distance() {
        let filter = DownsampleFilter::in_memory(1_000_000.0);
        let point = scenario()[0];
        assert_eq!(filter.decide(None, &point), Decision::Keep);
    }

    #[test]
    fn test_stage_does_not_touch_state() {
        let mut filter = DownsampleFilter::in_memory(100.0);
        let points = scenario();
        filter.stage(&points);
        assert!(filter.state().is_empty());

        filter.commit(&points[..1]);
        assert_eq!(filter.last_persisted(1), Some(points[0]));

        // Against the committed first point the near one is still dropped.
        let decisions = filter.stage(&points[1..]);
        assert!(!decisions[0].is_keep());
        assert!(decisions[1].is_keep());
    }

    #[test]
    fn test_far_point_compares_with_persisted_not_dropped() {
        // Creep: each step is under the threshold, but the last one is
        // more than 100m from the last persisted point.
        let t0 = Utc.with_ymd_and_hms(2024, 5, 20, 9, 0, 0).unwrap();
        let points: Vec<TrackPoint> = (0..5)
            .map(|i| TrackPoint::new(2, 43.0 + 0.00025 * i as f64, 131.0, t0 + Duration::seconds(i)))
            .collect();
        let decisions = DownsampleFilter::in_memory(100.0).stage(&points);
        let kept: Vec<usize> = decisions
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_keep())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(kept, vec![0, 4]);
    }

    #[test]
    fn test_seed_from_history() {
        let mut filter = DownsampleFilter::in_memory(100.0);
        let points = scenario();
        assert_eq!(filter.unseeded([1, 2, 1]), vec![1, 2]);

        let mut history = HashMap::new();
        history.insert(1, points[0]);
        filter.seed(&[1, 2], history);

        assert!(filter.unseeded([1, 2]).is_empty());
        assert_eq!(filter.last_persisted(1), Some(points[0]));
        assert_eq!(filter.last_persisted(2), None);

        // Redelivered copy of the persisted point is dropped.
        let decisions = filter.stage(&points[..1]);
        assert_eq!(decisions[0], Decision::Drop { distance_meters: 0.0 });
    }

    #[test]
    fn test_commit_ignores_older_points() {
        let mut filter = DownsampleFilter::in_memory(100.0);
        let points = scenario();
        filter.commit(&points[2..]);
        filter.commit(&points[..1]);
        assert_eq!(filter.last_persisted(1), Some(points[2]));
    }

    #[test]
    fn test_restage_skips_refused_reference() {
        let filter = DownsampleFilter::in_memory(100.0);
        let points = scenario();
        assert!(filter.stage(&points)[0].is_keep());
        assert!(!filter.stage(&points)[1].is_keep());

        // The first point was refused: the near one is now the first kept.
        let decisions = filter.restage(
            &points,
            &[Resolution::Discarded, Resolution::Open, Resolution::Open],
        );
        assert_eq!(decisions[0], None);
        assert_eq!(decisions[1], Some(Decision::Keep));
        assert_eq!(decisions[2], Some(Decision::Keep));
    }

    #[test]
    fn test_restage_measures_from_stored_points() {
        let filter = DownsampleFilter::in_memory(100.0);
        let points = scenario();
        let decisions = filter.restage(
            &points,
            &[Resolution::Stored, Resolution::Open, Resolution::Discarded],
        );
        assert_eq!(decisions[0], None);
        assert!(matches!(decisions[1], Some(Decision::Drop { .. })));
        assert_eq!(decisions[2], None);
        assert!(filter.state().is_empty());
    }

    #[test]
    fn test_forget_requires_new_seed() {
        let mut filter = DownsampleFilter::in_memory(100.0);
        let points = scenario();
        filter.seed(&[1], HashMap::new());
        filter.commit(&points[..1]);

        filter.forget(1);
        assert_eq!(filter.last_persisted(1), None);
        assert_eq!(filter.unseeded([1]), vec![1]);

        // History written by another worker meanwhile wins on re-seed.
        let mut history = HashMap::new();
        history.insert(1, points[2]);
        filter.seed(&[1], history);
        assert_eq!(filter.last_persisted(1), Some(points[2]));
    }

    #[test]
    fn test_drivers_are_independent() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 20, 9, 0, 0).unwrap();
        let points = vec![
            TrackPoint::new(1, 43.1150, 131.8860, t0),
            TrackPoint::new(2, 43.1150, 131.8860, t0),
        ];
        let decisions = DownsampleFilter::in_memory(100.0).stage(&points);
        assert!(decisions.iter().all(Decision::is_keep));
    }
}
