//! Position source boundary.
//!
//! The platform location service is modeled as a subscription with an
//! explicit start/stop lifecycle and a single consumer. `ChannelTracker`
//! is the implementation used by hosts that receive fixes through their
//! own callbacks (JNI, desktop) and push them into a `PositionFeed`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::NavError;
use crate::geo::Coordinate;

/// One location fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub lat: f64,
    pub lon: f64,
    /// Horizontal accuracy radius in meters.
    pub accuracy: f64,
    /// Compass heading in degrees, when the device reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Ground speed in m/s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl PositionSample {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionErrorCode {
    PermissionDenied,
    Unavailable,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionError {
    pub code: PositionErrorCode,
    pub message: String,
}

impl fmt::Display for PositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl From<PositionError> for NavError {
    fn from(err: PositionError) -> Self {
        match err.code {
            PositionErrorCode::PermissionDenied => NavError::PermissionDenied(err.message),
            PositionErrorCode::Unavailable => NavError::PositionUnavailable(err.message),
            PositionErrorCode::Timeout => NavError::PositionUnavailable(format!("timeout: {}", err.message)),
        }
    }
}

/// Item of the position stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionUpdate {
    Sample(PositionSample),
    Error(PositionError),
}

pub trait PositionTracker: Send {
    /// Begin delivering updates. Each call opens a fresh subscription.
    fn start(&mut self) -> Result<mpsc::UnboundedReceiver<PositionUpdate>, NavError>;

    /// End the subscription. Idempotent.
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

type SharedSender = Arc<Mutex<Option<mpsc::UnboundedSender<PositionUpdate>>>>;

fn lock(sender: &SharedSender) -> MutexGuard<'_, Option<mpsc::UnboundedSender<PositionUpdate>>> {
    sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracker fed by the host through a `PositionFeed`.
#[derive(Debug, Default)]
pub struct ChannelTracker {
    sender: SharedSender,
}

impl ChannelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle the host uses to push fixes. Fixes pushed while the
    /// tracker is stopped are dropped.
    pub fn feed(&self) -> PositionFeed {
        PositionFeed {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl PositionTracker for ChannelTracker {
    fn start(&mut self) -> Result<mpsc::UnboundedReceiver<PositionUpdate>, NavError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.sender) = Some(tx);
        debug!("Position subscription started");
        Ok(rx)
    }

    fn stop(&mut self) {
        if lock(&self.sender).take().is_some() {
            debug!("Position subscription stopped");
        }
    }

    fn is_active(&self) -> bool {
        lock(&self.sender).is_some()
    }
}

#[derive(Debug, Clone)]
pub struct PositionFeed {
    sender: SharedSender,
}

impl PositionFeed {
    /// Returns false when no subscription is active.
    pub fn push_sample(&self, sample: PositionSample) -> bool {
        self.push(PositionUpdate::Sample(sample))
    }

    pub fn push_error(&self, code: PositionErrorCode, message: impl Into<String>) -> bool {
        self.push(PositionUpdate::Error(PositionError {
            code,
            message: message.into(),
        }))
    }

    fn push(&self, update: PositionUpdate) -> bool {
        match lock(&self.sender).as_ref() {
            Some(tx) => tx.send(update).is_ok(),
            None => false,
        }
    }
}
