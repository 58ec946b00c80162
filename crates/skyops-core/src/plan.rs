//! Survey flight-plan generation.
//!
//! Produces deterministic waypoint lists for a polygon so downstream
//! coverage and efficiency figures are reproducible.

use crate::models::{FlightPattern, GeoPoint, MissionParameters, Waypoint};
use crate::spatial::{bounding_box, destination_point, haversine_distance, point_in_polygon};

/// Seconds charged per waypoint for deceleration and turn-in.
const TURN_OVERHEAD_S: f64 = 2.0;
/// Sampling step along a sweep line when clipping it to the polygon.
const CLIP_STEP_M: f64 = 10.0;
/// Hard cap on generated waypoints for a single mission.
const MAX_WAYPOINTS: usize = 2_000;

/// A generated plan with its estimates.
#[derive(Debug, Clone)]
pub struct FlightPlan {
    pub waypoints: Vec<Waypoint>,
    pub estimated_distance_m: f64,
    pub estimated_duration_s: f64,
}

/// Generate waypoints for `survey_area` using the requested pattern.
///
/// Degenerate polygons (fewer than 3 vertices) yield an empty plan.
pub fn generate_plan(
    survey_area: &[[f64; 2]],
    pattern: FlightPattern,
    params: &MissionParameters,
) -> FlightPlan {
    let mut waypoints = match pattern {
        FlightPattern::Grid => sweep(survey_area, params, 90.0),
        FlightPattern::Crosshatch => {
            let mut wps = sweep(survey_area, params, 90.0);
            wps.extend(sweep(survey_area, params, 0.0));
            wps
        }
        FlightPattern::Perimeter => perimeter(survey_area, params),
    };
    waypoints.truncate(MAX_WAYPOINTS);

    let estimated_distance_m = path_distance(&waypoints);
    let speed = params.speed_mps.max(0.1);
    let estimated_duration_s =
        estimated_distance_m / speed + waypoints.len() as f64 * TURN_OVERHEAD_S;

    FlightPlan {
        waypoints,
        estimated_distance_m,
        estimated_duration_s,
    }
}

/// Boustrophedon sweep across the polygon bounding box.
///
/// `sweep_bearing` 90.0 sweeps west-to-east lines stacked northward;
/// 0.0 sweeps south-to-north lines stacked eastward.
fn sweep(polygon: &[[f64; 2]], params: &MissionParameters, sweep_bearing: f64) -> Vec<Waypoint> {
    if polygon.len() < 3 {
        return Vec::new();
    }
    let Some((min_lat, min_lon, max_lat, max_lon)) = bounding_box(polygon) else {
        return Vec::new();
    };

    let origin = GeoPoint {
        lat: min_lat,
        lon: min_lon,
    };
    let spacing = params.spacing_m.max(1.0);
    let (line_extent_m, stack_extent_m, stack_bearing) = if sweep_bearing == 90.0 {
        (
            haversine_distance(min_lat, min_lon, min_lat, max_lon),
            haversine_distance(min_lat, min_lon, max_lat, min_lon),
            0.0,
        )
    } else {
        (
            haversine_distance(min_lat, min_lon, max_lat, min_lon),
            haversine_distance(min_lat, min_lon, min_lat, max_lon),
            90.0,
        )
    };

    let lines = (stack_extent_m / spacing).floor() as usize + 1;
    let mut waypoints = Vec::new();

    for line_index in 0..lines {
        let line_start =
            destination_point(origin, stack_bearing, spacing * line_index as f64);
        let mut inside: Vec<GeoPoint> = Vec::new();
        let steps = (line_extent_m / CLIP_STEP_M).ceil() as usize;
        for step in 0..=steps {
            let p = destination_point(line_start, sweep_bearing, CLIP_STEP_M * step as f64);
            if point_in_polygon(p.lat, p.lon, polygon) {
                inside.push(p);
            }
        }
        let (Some(first), Some(last)) = (inside.first(), inside.last()) else {
            continue;
        };

        // Alternate direction so consecutive lines connect at near ends.
        let (a, b) = if line_index % 2 == 0 {
            (*first, *last)
        } else {
            (*last, *first)
        };
        waypoints.push(Waypoint {
            lat: a.lat,
            lon: a.lon,
            alt_m: params.altitude_m,
        });
        if haversine_distance(a.lat, a.lon, b.lat, b.lon) >= CLIP_STEP_M {
            waypoints.push(Waypoint {
                lat: b.lat,
                lon: b.lon,
                alt_m: params.altitude_m,
            });
        }
    }

    waypoints
}

fn perimeter(polygon: &[[f64; 2]], params: &MissionParameters) -> Vec<Waypoint> {
    if polygon.len() < 3 {
        return Vec::new();
    }
    let mut waypoints: Vec<Waypoint> = polygon
        .iter()
        .map(|v| Waypoint {
            lat: v[0],
            lon: v[1],
            alt_m: params.altitude_m,
        })
        .collect();
    // Close the ring if the polygon wasn't already closed.
    if let (Some(first), Some(last)) = (waypoints.first().copied(), waypoints.last()) {
        if (first.lat - last.lat).abs() > 1e-9 || (first.lon - last.lon).abs() > 1e-9 {
            waypoints.push(first);
        }
    }
    waypoints
}

fn path_distance(waypoints: &[Waypoint]) -> f64 {
    waypoints
        .windows(2)
        .map(|pair| haversine_distance(pair[0].lat, pair[0].lon, pair[1].lat, pair[1].lon))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<[f64; 2]> {
        vec![
            [33.000, -117.000],
            [33.000, -116.995],
            [33.005, -116.995],
            [33.005, -117.000],
            [33.000, -117.000],
        ]
    }

    #[test]
    fn grid_plan_covers_square() {
        let plan = generate_plan(&square(), FlightPattern::Grid, &MissionParameters::default());
        assert!(plan.waypoints.len() >= 4, "got {}", plan.waypoints.len());
        assert!(plan.estimated_distance_m > 0.0);
        assert!(plan.estimated_duration_s > 0.0);
        for wp in &plan.waypoints {
            assert_eq!(wp.alt_m, MissionParameters::default().altitude_m);
        }
    }

    #[test]
    fn crosshatch_has_more_waypoints_than_grid() {
        let params = MissionParameters::default();
        let grid = generate_plan(&square(), FlightPattern::Grid, &params);
        let cross = generate_plan(&square(), FlightPattern::Crosshatch, &params);
        assert!(cross.waypoints.len() > grid.waypoints.len());
    }

    #[test]
    fn perimeter_closes_ring() {
        let open: Vec<[f64; 2]> = square().into_iter().take(4).collect();
        let plan = generate_plan(&open, FlightPattern::Perimeter, &MissionParameters::default());
        let first = plan.waypoints.first().unwrap();
        let last = plan.waypoints.last().unwrap();
        assert_eq!(first.lat, last.lat);
        assert_eq!(first.lon, last.lon);
    }

    #[test]
    fn degenerate_polygon_yields_empty_plan() {
        let plan = generate_plan(
            &[[33.0, -117.0], [33.1, -117.1]],
            FlightPattern::Grid,
            &MissionParameters::default(),
        );
        assert!(plan.waypoints.is_empty());
        assert_eq!(plan.estimated_distance_m, 0.0);
    }

    #[test]
    fn plans_are_deterministic() {
        let params = MissionParameters::default();
        let a = generate_plan(&square(), FlightPattern::Grid, &params);
        let b = generate_plan(&square(), FlightPattern::Grid, &params);
        assert_eq!(a.waypoints.len(), b.waypoints.len());
        assert_eq!(a.estimated_distance_m, b.estimated_distance_m);
    }
}
