//! Speed-dependent map zoom.

/// Map zoom level for a travel speed in m/s.
///
/// Tier boundaries belong to the faster tier, so exactly 5 m/s already
/// zooms out to 16. Unknown (NaN) or negative speeds count as standing
/// still.
pub fn zoom_for_speed(speed_mps: f64) -> u8 {
    if speed_mps.is_nan() || speed_mps < 5.0 {
        18
    } else if speed_mps < 15.0 {
        16
    } else if speed_mps < 50.0 {
        14
    } else {
        12
    }
}

/// Tracks the zoom level last reported to the host.
#[derive(Debug, Clone, Default)]
pub struct ZoomController {
    level: Option<u8>,
}

impl ZoomController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> Option<u8> {
        self.level
    }

    /// Returns the new level only when it differs from the last one.
    pub fn update(&mut self, speed_mps: f64) -> Option<u8> {
        let level = zoom_for_speed(speed_mps);
        if self.level == Some(level) {
            return None;
        }
        self.level = Some(level);
        Some(level)
    }
}
