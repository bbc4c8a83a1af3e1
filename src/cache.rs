//! "Last route" persistence.
//!
//! The session stores every accepted route so a host can show it again
//! after a restart, and so a session can still start when the directions
//! service is unreachable. The file-backed cache writes GPX 1.1 through
//! the `gpx` crate, which keeps the file readable by other map tools:
//!
//! - the destination is the single `<wpt>`
//! - the route geometry is a `<trk>`; its `<cmt>` holds the summary
//! - the steps are an `<rte>`; each `<rtept>` carries the raw instruction
//!   text as `<name>` and the step distance as `<cmt>`
//!
//! Steps are re-classified from their raw text on load.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use geo_types::Point as GeoPoint;
use gpx::{Gpx, GpxVersion, Track, TrackSegment, Waypoint};
use log::debug;

use crate::error::NavError;
use crate::geo::{polyline_length, Coordinate};
use crate::instruction::InstructionStep;
use crate::route::{Destination, RouteResult};

#[derive(Debug, Clone, PartialEq)]
pub struct CachedRoute {
    pub destination: Destination,
    pub route: RouteResult,
}

pub trait RouteCache: Send {
    fn get(&self) -> Result<Option<CachedRoute>, NavError>;
    fn set(&mut self, route: &CachedRoute) -> Result<(), NavError>;
}

/// In-process cache, mainly for hosts without storage and for tests.
#[derive(Debug, Default)]
pub struct MemoryRouteCache {
    last: Option<CachedRoute>,
}

impl MemoryRouteCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RouteCache for MemoryRouteCache {
    fn get(&self) -> Result<Option<CachedRoute>, NavError> {
        Ok(self.last.clone())
    }

    fn set(&mut self, route: &CachedRoute) -> Result<(), NavError> {
        self.last = Some(route.clone());
        Ok(())
    }
}

/// Cache persisted as a GPX file.
#[derive(Debug, Clone)]
pub struct GpxRouteCache {
    path: PathBuf,
}

impl GpxRouteCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RouteCache for GpxRouteCache {
    fn get(&self) -> Result<Option<CachedRoute>, NavError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let file = File::open(&self.path)
            .map_err(|e| NavError::Cache(format!("open {}: {e}", self.path.display())))?;
        read_route(BufReader::new(file)).map(Some)
    }

    fn set(&mut self, route: &CachedRoute) -> Result<(), NavError> {
        let file = File::create(&self.path)
            .map_err(|e| NavError::Cache(format!("create {}: {e}", self.path.display())))?;
        write_route(route, BufWriter::new(file))?;
        debug!("Cached route to {}", self.path.display());
        Ok(())
    }
}

fn waypoint(c: &Coordinate) -> Waypoint {
    Waypoint::new(GeoPoint::new(c.lon, c.lat))
}

fn coordinate(wp: &Waypoint) -> Coordinate {
    Coordinate::new(wp.point().y(), wp.point().x())
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn to_gpx(cached: &CachedRoute) -> Gpx {
    let mut destination = waypoint(&cached.destination.coordinate());
    destination.name = non_empty(&cached.destination.name);
    destination.description = non_empty(&cached.destination.description);

    let mut segment = TrackSegment::default();
    segment.points = cached.route.geometry.iter().map(waypoint).collect();

    let mut track = Track::default();
    track.name = Some("route".to_string());
    track.comment = Some(format!(
        "distance_m={};duration_s={}",
        cached.route.distance_m, cached.route.duration_s
    ));
    track.segments.push(segment);

    let mut steps = gpx::Route::default();
    steps.name = Some("steps".to_string());
    steps.points = cached
        .route
        .steps
        .iter()
        .map(|step| {
            let mut wp = waypoint(&step.location());
            wp.name = non_empty(&step.raw_text);
            wp.comment = Some(step.distance_m.to_string());
            wp
        })
        .collect();

    let mut gpx = Gpx::default();
    gpx.version = GpxVersion::Gpx11;
    gpx.creator = Some("walknav".to_string());
    gpx.waypoints = vec![destination];
    gpx.tracks = vec![track];
    gpx.routes = vec![steps];
    gpx
}

/// Parse `distance_m=..;duration_s=..` from the track comment.
fn parse_summary(comment: Option<&str>) -> (Option<f64>, Option<f64>) {
    let mut distance = None;
    let mut duration = None;
    for field in comment.unwrap_or_default().split(';') {
        match field.split_once('=') {
            Some(("distance_m", v)) => distance = v.parse().ok(),
            Some(("duration_s", v)) => duration = v.parse().ok(),
            _ => {}
        }
    }
    (distance, duration)
}

fn from_gpx(gpx: &Gpx) -> Result<CachedRoute, NavError> {
    let dest_wp = gpx
        .waypoints
        .first()
        .ok_or_else(|| NavError::Cache("cached route has no destination".into()))?;
    let dest = coordinate(dest_wp);
    let destination = Destination {
        lat: dest.lat,
        lon: dest.lon,
        name: dest_wp.name.clone().unwrap_or_default(),
        description: dest_wp.description.clone().unwrap_or_default(),
    };

    let track = gpx
        .tracks
        .first()
        .ok_or_else(|| NavError::Cache("cached route has no geometry".into()))?;
    let geometry: Vec<Coordinate> = track
        .segments
        .iter()
        .flat_map(|seg| seg.points.iter())
        .map(coordinate)
        .collect();
    if geometry.len() < 2 {
        return Err(NavError::Cache("cached geometry has fewer than 2 points".into()));
    }

    let steps = gpx
        .routes
        .first()
        .map(|r| r.points.as_slice())
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(i, wp)| {
            let distance = wp
                .comment
                .as_deref()
                .and_then(|c| c.parse().ok())
                .unwrap_or(0.0);
            InstructionStep::from_text(i, wp.name.as_deref().unwrap_or_default(), distance, coordinate(wp))
        })
        .collect();

    let (distance, duration) = parse_summary(track.comment.as_deref());

    Ok(CachedRoute {
        destination,
        route: RouteResult {
            distance_m: distance.unwrap_or_else(|| polyline_length(&geometry)),
            duration_s: duration.unwrap_or(0.0),
            geometry,
            steps,
        },
    })
}

pub fn write_route<W: Write>(route: &CachedRoute, writer: W) -> Result<(), NavError> {
    gpx::write(&to_gpx(route), writer).map_err(|e| NavError::Cache(format!("GPX write error: {e}")))
}

pub fn read_route<R: Read>(reader: R) -> Result<CachedRoute, NavError> {
    let gpx = gpx::read(reader).map_err(|e| NavError::Cache(format!("GPX parse error: {e}")))?;
    from_gpx(&gpx)
}
