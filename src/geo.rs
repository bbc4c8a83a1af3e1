//! Geometry on the WGS84 sphere.
//!
//! Bearings, haversine distances, and projection of a position onto the
//! route polyline. All coordinates are lat/lon in degrees.

use serde::{Deserialize, Serialize};

/// A geographic coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Result of projecting a position onto the route.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RouteProjection {
    /// Nearest point on the route.
    pub point: Coordinate,
    /// Index of the segment start vertex (0-based).
    pub segment_index: usize,
    /// Distance from the position to `point`, in meters.
    pub distance_m: f64,
}

/// Earth radius in meters (WGS84 mean).
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Below this distance the projected point is treated as sitting on the
/// next vertex, whose bearing from itself is undefined.
const VERTEX_SNAP_M: f64 = 0.5;

/// Initial bearing (forward azimuth) from one point to another, in
/// degrees [0, 360).
pub fn bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let y = dlon.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlon.cos();

    normalize_degrees(y.atan2(x).to_degrees())
}

/// Bearing between two coordinates.
pub fn bearing_between(a: &Coordinate, b: &Coordinate) -> f64 {
    bearing(a.lat, a.lon, b.lat, b.lon)
}

/// Haversine distance between two points in meters.
pub fn distance_meters(a: &Coordinate, b: &Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Total length of a polyline in meters.
pub fn polyline_length(points: &[Coordinate]) -> f64 {
    points
        .windows(2)
        .map(|w| distance_meters(&w[0], &w[1]))
        .sum()
}

/// Wrap an angle into [0, 360).
pub fn normalize_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Shortest signed rotation from `from` to `to`, in degrees [-180, 180].
///
/// Going from 0° to 359° is a -1° rotation, not +359°.
pub fn shortest_angle_delta(from: f64, to: f64) -> f64 {
    let delta = (to - from).rem_euclid(360.0);
    if delta > 180.0 {
        delta - 360.0
    } else {
        delta
    }
}

/// Project a position onto the nearest segment of the route.
///
/// Ties are broken by the lowest segment index. A single-vertex route
/// projects onto that vertex; an empty route yields `None`.
pub fn closest_point_on_route(position: &Coordinate, geometry: &[Coordinate]) -> Option<RouteProjection> {
    match geometry {
        [] => None,
        [only] => Some(RouteProjection {
            point: *only,
            segment_index: 0,
            distance_m: distance_meters(position, only),
        }),
        _ => {
            let mut best: Option<RouteProjection> = None;

            for (i, segment) in geometry.windows(2).enumerate() {
                let projected = project_on_segment(position, &segment[0], &segment[1]);
                let dist = distance_meters(position, &projected);

                let is_better = match &best {
                    Some(prev) => dist < prev.distance_m,
                    None => true,
                };

                if is_better {
                    best = Some(RouteProjection {
                        point: projected,
                        segment_index: i,
                        distance_m: dist,
                    });
                }
            }

            best
        }
    }
}

/// Direction of travel along the route at the traveler's projected
/// position: bearing from the projected point to the end of its segment.
pub fn route_bearing_for_user(position: &Coordinate, geometry: &[Coordinate]) -> Option<f64> {
    if geometry.len() < 2 {
        return None;
    }
    let projection = closest_point_on_route(position, geometry)?;
    let start = &geometry[projection.segment_index];
    let next = &geometry[projection.segment_index + 1];

    if distance_meters(&projection.point, next) < VERTEX_SNAP_M {
        Some(bearing_between(start, next))
    } else {
        Some(bearing_between(&projection.point, next))
    }
}

/// Project a point onto a line segment defined by two endpoints.
///
/// Uses a planar approximation scaled by latitude cosine, which is
/// accurate enough for the short segments of a walking route.
fn project_on_segment(p: &Coordinate, a: &Coordinate, b: &Coordinate) -> Coordinate {
    let cos_lat = ((a.lat + b.lat) / 2.0).to_radians().cos();

    let dx = (b.lon - a.lon) * cos_lat;
    let dy = b.lat - a.lat;
    let px = (p.lon - a.lon) * cos_lat;
    let py = p.lat - a.lat;

    let seg_len_sq = dx * dx + dy * dy;

    if seg_len_sq < 1e-20 {
        // Degenerate segment
        return *a;
    }

    let t = ((px * dx + py * dy) / seg_len_sq).clamp(0.0, 1.0);

    Coordinate {
        lat: a.lat + t * (b.lat - a.lat),
        lon: a.lon + t * (b.lon - a.lon),
    }
}
