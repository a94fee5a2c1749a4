use serde::{Deserialize, Serialize};

/// Mean earth radius used by the great-circle distance.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        distance_meters(self, other)
    }

    /// Grid cell containing this position, `cell_degrees` on a side.
    ///
    /// Two positions in the same cell share a query signature, so a small
    /// move inside a cell reuses the cached venue set.
    pub fn geocell(&self, cell_degrees: f64) -> String {
        let size = cell_degrees.max(f64::EPSILON);
        let row = (self.lat / size).floor() as i64;
        let col = (self.lng / size).floor() as i64;
        format!("{row}:{col}@{size}")
    }
}

/// Haversine distance in meters.
pub fn distance_meters(from: &Position, to: &Position) -> f64 {
    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lng = (to.lng - from.lng).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_for_same_point() {
        let p = Position::new(40.0, -73.0);
        assert_eq!(distance_meters(&p, &p), 0.0);
    }

    #[test]
    fn matches_arc_length_along_equator() {
        let origin = Position::new(0.0, 0.0);
        let east = Position::new(0.0, 0.01);
        let expected = EARTH_RADIUS_METERS * 0.01_f64.to_radians();
        let actual = distance_meters(&origin, &east);
        assert!((actual - expected).abs() < 1e-6, "{actual} vs {expected}");
        assert!((actual - 1111.95).abs() < 0.1);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Position::new(40.7128, -74.0060);
        let b = Position::new(34.0522, -118.2437);
        let ab = distance_meters(&a, &b);
        let ba = distance_meters(&b, &a);
        assert!((ab - ba).abs() < 1e-6);
        assert!((ab / 1000.0 - 3935.0).abs() < 10.0);
    }

    #[test]
    fn nearby_points_share_a_geocell() {
        let a = Position::new(40.0012, -73.0034);
        let b = Position::new(40.0049, -73.0011);
        let c = Position::new(40.0151, -73.0011);
        assert_eq!(a.geocell(0.01), b.geocell(0.01));
        assert_ne!(a.geocell(0.01), c.geocell(0.01));
    }

    #[test]
    fn rejects_out_of_range_positions() {
        assert!(Position::new(0.0, 0.0).is_valid());
        assert!(!Position::new(91.0, 0.0).is_valid());
        assert!(!Position::new(0.0, f64::NAN).is_valid());
    }
}
