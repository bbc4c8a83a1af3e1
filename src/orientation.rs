//! Map rotation smoothing.
//!
//! Compass headings from phones are noisy. The smoother applies an
//! exponential filter on the shortest angular path and throttles updates
//! so the map does not jitter.

use crate::config::NavigationConfig;
use crate::geo::{normalize_degrees, shortest_angle_delta};

#[derive(Debug, Clone)]
pub struct OrientationSmoother {
    alpha: f64,
    min_delta_deg: f64,
    min_interval_ms: u64,
    smoothed: Option<f64>,
    last_applied_at_ms: Option<u64>,
    manual_override: Option<f64>,
}

impl OrientationSmoother {
    pub fn new(alpha: f64, min_delta_deg: f64, min_interval_ms: u64) -> Self {
        Self {
            alpha,
            min_delta_deg,
            min_interval_ms,
            smoothed: None,
            last_applied_at_ms: None,
            manual_override: None,
        }
    }

    pub fn from_config(config: &NavigationConfig) -> Self {
        Self::new(
            config.heading_alpha,
            config.min_rotation_delta_deg,
            config.min_rotation_interval_ms,
        )
    }

    /// Current rotation: the override angle if one is set, else the
    /// smoothed heading.
    pub fn heading(&self) -> Option<f64> {
        self.manual_override.or(self.smoothed)
    }

    pub fn manual_override(&self) -> Option<f64> {
        self.manual_override
    }

    /// Pin the rotation to a fixed angle, or release the pin with `None`.
    pub fn set_manual_override(&mut self, angle: Option<f64>) {
        self.manual_override = angle.map(normalize_degrees);
    }

    /// Feed a heading sample. Returns the new rotation when it changed,
    /// `None` when the sample was filtered out. While an override is set
    /// the override angle is returned as is and the sample is dropped.
    pub fn update(&mut self, heading_deg: f64, now_ms: u64) -> Option<f64> {
        if let Some(angle) = self.manual_override {
            return Some(angle);
        }
        if !heading_deg.is_finite() {
            return None;
        }

        let Some(current) = self.smoothed else {
            let initial = normalize_degrees(heading_deg);
            self.smoothed = Some(initial);
            self.last_applied_at_ms = Some(now_ms);
            return Some(initial);
        };

        if let Some(last) = self.last_applied_at_ms {
            if now_ms.saturating_sub(last) < self.min_interval_ms {
                return None;
            }
        }

        let delta = shortest_angle_delta(current, heading_deg);
        if delta.abs() < self.min_delta_deg {
            return None;
        }

        let next = normalize_degrees(current + self.alpha * delta);
        self.smoothed = Some(next);
        self.last_applied_at_ms = Some(now_ms);
        Some(next)
    }

    pub fn reset(&mut self) {
        self.smoothed = None;
        self.last_applied_at_ms = None;
    }
}

impl Default for OrientationSmoother {
    fn default() -> Self {
        Self::from_config(&NavigationConfig::default())
    }
}
