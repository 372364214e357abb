//! Great-circle distance.

use crate::location::GeoPoint;

/// Mean Earth radius (IUGG), meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Haversine distance between two points, in meters.
pub fn haversine_meters(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    // Clamp guards asin against h drifting past 1.0 for antipodal points.
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_point_is_zero() {
        let p = GeoPoint::new(43.115, 131.886);
        assert_eq!(haversine_meters(&p, &p), 0.0);
    }

    #[test]
    fn test_short_hop_is_about_fourteen_meters() {
        let a = GeoPoint::new(43.1150, 131.8860);
        let b = GeoPoint::new(43.1151, 131.8861);
        let d = haversine_meters(&a, &b);
        assert!(d > 10.0 && d < 20.0, "got {d}");
    }

    #[test]
    fn test_several_kilometers() {
        let a = GeoPoint::new(43.1150, 131.8860);
        let b = GeoPoint::new(43.1300, 131.9500);
        let d = haversine_meters(&a, &b);
        assert!(d > 5_000.0 && d < 6_000.0, "got {d}");
    }

    #[test]
    fn test_one_degree_of_latitude() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(1.0, 0.0);
        let d = haversine_meters(&a, &b);
        assert!((d - 111_195.0).abs() < 50.0, "got {d}");
    }

    #[test]
    fn test_symmetric() {
        let a = GeoPoint::new(55.75, 37.61);
        let b = GeoPoint::new(59.93, 30.33);
        assert!((haversine_meters(&a, &b) - haversine_meters(&b, &a)).abs() < 1e-6);
    }
}
