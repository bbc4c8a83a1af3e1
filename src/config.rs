//! Tunable navigation parameters.
//!
//! All thresholds have working defaults, so hosts only need to pass the
//! keys they want to change:
//!
//! ```json
//! { "deviation_threshold_m": 15.0, "language": "pt" }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NavError;

/// Travel profile understood by the directions service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TravelProfile {
    #[default]
    FootWalking,
    FootHiking,
    Wheelchair,
}

impl TravelProfile {
    /// Path segment used by the directions API.
    pub fn as_str(self) -> &'static str {
        match self {
            TravelProfile::FootWalking => "foot-walking",
            TravelProfile::FootHiking => "foot-hiking",
            TravelProfile::Wheelchair => "wheelchair",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Distance to a step's maneuver point at which the step counts as reached.
    pub arrival_threshold_m: f64,
    /// Distance from the route beyond which the traveler is off-route.
    pub deviation_threshold_m: f64,
    /// Minimum time between two recalculations.
    pub recalculation_cooldown_ms: u64,
    /// Exponential smoothing factor for heading updates.
    pub heading_alpha: f64,
    /// Heading changes smaller than this are ignored.
    pub min_rotation_delta_deg: f64,
    pub min_rotation_interval_ms: u64,
    /// Hard limit on a single route fetch.
    pub route_timeout_ms: u64,
    /// Fixes less accurate than this are not evaluated for deviation.
    pub max_sample_accuracy_m: f64,
    pub profile: TravelProfile,
    pub language: String,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            arrival_threshold_m: 10.0,
            deviation_threshold_m: 10.0,
            recalculation_cooldown_ms: 30_000,
            heading_alpha: 0.2,
            min_rotation_delta_deg: 2.0,
            min_rotation_interval_ms: 1_000,
            route_timeout_ms: 10_000,
            max_sample_accuracy_m: 50.0,
            profile: TravelProfile::default(),
            language: "en".to_string(),
        }
    }
}

impl NavigationConfig {
    /// Parse a (possibly partial) JSON configuration and validate it.
    pub fn from_json(json: &str) -> Result<Self, NavError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| NavError::Config(format!("JSON parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NavError> {
        let positive = [
            ("arrival_threshold_m", self.arrival_threshold_m),
            ("deviation_threshold_m", self.deviation_threshold_m),
            ("max_sample_accuracy_m", self.max_sample_accuracy_m),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(NavError::Config(format!("{name} must be positive, got {value}")));
            }
        }
        if !(self.heading_alpha > 0.0 && self.heading_alpha <= 1.0) {
            return Err(NavError::Config(format!(
                "heading_alpha must be in (0, 1], got {}",
                self.heading_alpha
            )));
        }
        if !(self.min_rotation_delta_deg.is_finite() && self.min_rotation_delta_deg >= 0.0) {
            return Err(NavError::Config(format!(
                "min_rotation_delta_deg must be non-negative, got {}",
                self.min_rotation_delta_deg
            )));
        }
        if self.route_timeout_ms == 0 {
            return Err(NavError::Config("route_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn route_timeout(&self) -> Duration {
        Duration::from_millis(self.route_timeout_ms)
    }
}
