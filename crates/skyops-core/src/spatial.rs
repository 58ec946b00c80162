//! Spatial math shared by planning, coverage, and geo queries.

use crate::models::GeoPoint;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points in meters.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Point reached by travelling `distance_m` from `start` on `bearing_deg`.
pub fn destination_point(start: GeoPoint, bearing_deg: f64, distance_m: f64) -> GeoPoint {
    let delta = distance_m / EARTH_RADIUS_M;
    let theta = bearing_deg.to_radians();
    let phi1 = start.lat.to_radians();
    let lambda1 = start.lon.to_radians();

    let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

    GeoPoint {
        lat: phi2.to_degrees(),
        lon: lambda2.to_degrees(),
    }
}

/// Ray-cast test: is `(lat, lon)` inside the polygon of `[lat, lon]` vertices?
pub fn point_in_polygon(lat: f64, lon: f64, polygon: &[[f64; 2]]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let yi = polygon[i][0];
        let xi = polygon[i][1];
        let yj = polygon[j][0];
        let xj = polygon[j][1];

        if ((yi > lat) != (yj > lat)) && (lon < (xj - xi) * (lat - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }

    inside
}

/// Axis-aligned bounding box of a polygon: (min_lat, min_lon, max_lat, max_lon).
pub fn bounding_box(polygon: &[[f64; 2]]) -> Option<(f64, f64, f64, f64)> {
    let first = polygon.first()?;
    let mut min_lat = first[0];
    let mut max_lat = first[0];
    let mut min_lon = first[1];
    let mut max_lon = first[1];
    for vertex in polygon.iter().skip(1) {
        min_lat = min_lat.min(vertex[0]);
        max_lat = max_lat.max(vertex[0]);
        min_lon = min_lon.min(vertex[1]);
        max_lon = max_lon.max(vertex[1]);
    }
    Some((min_lat, min_lon, max_lat, max_lon))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        // Irvine to Newport Beach, roughly 9.3 km.
        let d = haversine_distance(33.6846, -117.8265, 33.6189, -117.9298);
        assert!(d > 9_000.0 && d < 13_000.0, "got {}", d);
    }

    #[test]
    fn haversine_zero_for_same_point() {
        assert_eq!(haversine_distance(10.0, 20.0, 10.0, 20.0), 0.0);
    }

    #[test]
    fn destination_point_round_trip() {
        let start = GeoPoint {
            lat: 33.68,
            lon: -117.82,
        };
        let moved = destination_point(start, 90.0, 500.0);
        let back = haversine_distance(start.lat, start.lon, moved.lat, moved.lon);
        assert!((back - 500.0).abs() < 1.0, "got {}", back);
    }

    #[test]
    fn point_in_polygon_square() {
        let square = [
            [33.0, -117.0],
            [33.0, -116.9],
            [33.1, -116.9],
            [33.1, -117.0],
            [33.0, -117.0],
        ];
        assert!(point_in_polygon(33.05, -116.95, &square));
        assert!(!point_in_polygon(33.2, -116.95, &square));
    }

    #[test]
    fn degenerate_polygon_contains_nothing() {
        assert!(!point_in_polygon(0.0, 0.0, &[[0.0, 0.0], [1.0, 1.0]]));
    }
}
