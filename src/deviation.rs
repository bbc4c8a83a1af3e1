//! Off-route detection.
//!
//! A recalculation is warranted only when the traveler is both far
//! enough from the route and the previous recalculation is old enough.

use std::time::Duration;

use crate::config::NavigationConfig;
use crate::geo::{closest_point_on_route, Coordinate};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviationDetector {
    threshold_m: f64,
    cooldown: Duration,
}

impl DeviationDetector {
    pub fn new(threshold_m: f64, cooldown: Duration) -> Self {
        Self { threshold_m, cooldown }
    }

    pub fn from_config(config: &NavigationConfig) -> Self {
        Self::new(
            config.deviation_threshold_m,
            Duration::from_millis(config.recalculation_cooldown_ms),
        )
    }

    /// Distance from `position` to the nearest point of the route, in
    /// meters. `None` for an empty route.
    pub fn deviation_m(&self, position: &Coordinate, geometry: &[Coordinate]) -> Option<f64> {
        closest_point_on_route(position, geometry).map(|p| p.distance_m)
    }

    /// Both gates must open: deviation above the threshold and the
    /// cooldown since `last_recalculation_at_ms` elapsed.
    pub fn should_recalculate(
        &self,
        position: &Coordinate,
        geometry: &[Coordinate],
        last_recalculation_at_ms: u64,
        now_ms: u64,
    ) -> bool {
        let elapsed = Duration::from_millis(now_ms.saturating_sub(last_recalculation_at_ms));
        if elapsed <= self.cooldown {
            return false;
        }

        match self.deviation_m(position, geometry) {
            Some(deviation) => deviation > self.threshold_m,
            None => false,
        }
    }
}

impl Default for DeviationDetector {
    fn default() -> Self {
        Self::from_config(&NavigationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon)
    }

    fn route() -> Vec<Coordinate> {
        // ~111 m west-east along the equator
        vec![pt(0.0, 0.0), pt(0.0, 0.001)]
    }

    // ~5.5 m and ~55 m north of the route
    const NEAR: f64 = 0.00005;
    const FAR: f64 = 0.0005;

    #[test]
    fn small_deviation_never_triggers() {
        let detector = DeviationDetector::default();
        for elapsed in [0, 31_000, 3_600_000] {
            assert!(!detector.should_recalculate(&pt(NEAR, 0.0005), &route(), 0, elapsed));
        }
    }

    #[test]
    fn cooldown_blocks_large_deviation() {
        let detector = DeviationDetector::default();
        for elapsed in [0, 10_000, 30_000] {
            assert!(!detector.should_recalculate(&pt(FAR, 0.0005), &route(), 0, elapsed));
        }
    }

    #[test]
    fn both_gates_open_triggers() {
        let detector = DeviationDetector::default();
        assert!(detector.should_recalculate(&pt(FAR, 0.0005), &route(), 1_000, 32_000));
    }

    #[test]
    fn clock_going_backwards_does_not_trigger() {
        let detector = DeviationDetector::default();
        assert!(!detector.should_recalculate(&pt(FAR, 0.0005), &route(), 50_000, 10_000));
    }

    #[test]
    fn custom_thresholds() {
        let detector = DeviationDetector::new(100.0, Duration::from_secs(5));
        assert!(!detector.should_recalculate(&pt(FAR, 0.0005), &route(), 0, 6_000));
        assert!(detector.should_recalculate(&pt(0.002, 0.0005), &route(), 0, 6_000));
    }

    #[test]
    fn deviation_distance() {
        let detector = DeviationDetector::default();
        let d = detector.deviation_m(&pt(FAR, 0.0005), &route()).unwrap();
        assert!((d - 55.6).abs() < 1.0, "Expected ~55.6 m, got {d}");
        assert!(detector.deviation_m(&pt(0.0, 0.0), &[]).is_none());
    }
}
