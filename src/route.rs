//! Route fetching.
//!
//! `RouteProvider` is the seam to the external directions service. The
//! OpenRouteService client speaks the GeoJSON directions format; the
//! decoding into `RouteResult` is a separate pure function so it can be
//! tested without a network.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::TravelProfile;
use crate::error::NavError;
use crate::geo::Coordinate;
use crate::instruction::InstructionStep;

/// Where the traveler wants to go. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Destination {
    pub fn new(lat: f64, lon: f64, name: impl Into<String>) -> Self {
        Self {
            lat,
            lon,
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lon)
    }
}

/// A validated, normalized route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteResult {
    pub geometry: Vec<Coordinate>,
    pub steps: Vec<InstructionStep>,
    pub distance_m: f64,
    pub duration_s: f64,
}

#[async_trait]
pub trait RouteProvider: Send + Sync {
    async fn fetch_route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        profile: TravelProfile,
    ) -> Result<RouteResult, NavError>;
}

/// Run a fetch with a hard deadline.
pub async fn fetch_with_timeout(
    provider: &dyn RouteProvider,
    origin: Coordinate,
    destination: Coordinate,
    profile: TravelProfile,
    timeout: Duration,
) -> Result<RouteResult, NavError> {
    match tokio::time::timeout(timeout, provider.fetch_route(origin, destination, profile)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Route fetch timed out after {}ms", timeout.as_millis());
            Err(NavError::TimedOut(timeout))
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectionsResponse {
    #[serde(default)]
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Feature {
    pub geometry: Option<FeatureGeometry>,
    #[serde(default)]
    pub properties: FeatureProperties,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureGeometry {
    /// `[lon, lat]` pairs, optionally followed by elevation.
    #[serde(default)]
    pub coordinates: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureProperties {
    pub summary: Option<Summary>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Summary {
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub duration: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub steps: Vec<RawStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStep {
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub distance: f64,
    /// Indices into the geometry: start and end vertex of the step.
    #[serde(default)]
    pub way_points: Vec<usize>,
}

/// Validate and normalize a directions response.
///
/// Each step is anchored at the geometry vertex where it ends, which is
/// where the next maneuver happens (the last of its `way_points`). Steps
/// without way points fall back to the final vertex.
pub fn decode_directions(response: &DirectionsResponse) -> Result<RouteResult, NavError> {
    let feature = response
        .features
        .first()
        .ok_or_else(|| NavError::InvalidRouteData("response has no features".into()))?;

    let raw_coords = feature
        .geometry
        .as_ref()
        .map(|g| g.coordinates.as_slice())
        .unwrap_or_default();

    let geometry = raw_coords
        .iter()
        .map(|c| match c.as_slice() {
            [lon, lat, ..] => {
                let point = Coordinate::new(*lat, *lon);
                if point.is_valid() {
                    Ok(point)
                } else {
                    Err(NavError::InvalidRouteData(format!("coordinate out of range: {c:?}")))
                }
            }
            _ => Err(NavError::InvalidRouteData(format!("malformed coordinate: {c:?}"))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    if geometry.len() < 2 {
        return Err(NavError::InvalidRouteData(format!(
            "route geometry needs at least 2 points, got {}",
            geometry.len()
        )));
    }

    let summary = feature
        .properties
        .summary
        .as_ref()
        .ok_or_else(|| NavError::InvalidRouteData("response has no summary".into()))?;

    let mut steps = Vec::new();
    for raw in feature.properties.segments.iter().flat_map(|s| s.steps.iter()) {
        let vertex = raw.way_points.last().copied().unwrap_or(geometry.len() - 1);
        let location = geometry.get(vertex).copied().ok_or_else(|| {
            NavError::InvalidRouteData(format!(
                "step way point {vertex} beyond geometry of {} points",
                geometry.len()
            ))
        })?;
        steps.push(InstructionStep::from_text(steps.len(), &raw.instruction, raw.distance, location));
    }

    if steps.is_empty() {
        debug!("Directions response has no steps, synthesizing arrival");
        if let Some(last) = geometry.last() {
            steps.push(InstructionStep::from_text(0, "Arrive at destination", summary.distance, *last));
        }
    }

    Ok(RouteResult {
        geometry,
        steps,
        distance_m: summary.distance,
        duration_s: summary.duration,
    })
}

const DEFAULT_BASE_URL: &str = "https://api.openrouteservice.org";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
        }
    }
}

/// Directions client for the OpenRouteService HTTP API.
pub struct OpenRouteServiceClient {
    http: Client,
    config: ProviderConfig,
    language: String,
}

impl OpenRouteServiceClient {
    pub fn new(config: ProviderConfig, language: impl Into<String>) -> Result<Self, NavError> {
        let http = Client::builder()
            .build()
            .map_err(|e| NavError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            config,
            language: language.into(),
        })
    }

    fn directions_url(&self, profile: TravelProfile) -> String {
        format!(
            "{}/v2/directions/{}/geojson",
            self.config.base_url.trim_end_matches('/'),
            profile.as_str()
        )
    }
}

#[async_trait]
impl RouteProvider for OpenRouteServiceClient {
    async fn fetch_route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        profile: TravelProfile,
    ) -> Result<RouteResult, NavError> {
        let body = serde_json::json!({
            "coordinates": [[origin.lon, origin.lat], [destination.lon, destination.lat]],
            "language": self.language,
            "instructions": true,
        });

        let url = self.directions_url(profile);
        debug!("Requesting route {url}");

        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, &self.config.api_key)
            .header(ACCEPT, "application/geo+json, application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| NavError::RouteUnavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(NavError::RouteUnavailable(format!(
                "directions API error {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let directions: DirectionsResponse = response
            .json()
            .await
            .map_err(|e| NavError::InvalidRouteData(format!("undecodable response: {e}")))?;

        decode_directions(&directions)
    }
}
