//! Error model.
//!
//! Every failure the engine can report maps to one `NavError` variant.
//! Hosts receive errors as `ErrorReport` values on the event channel, so
//! the variant also decides whether the session can continue.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NavError {
    #[error("destination is missing or has no coordinates")]
    MissingDestination,

    #[error("no initial position available")]
    MissingPosition,

    #[error("route unavailable: {0}")]
    RouteUnavailable(String),

    #[error("invalid route data: {0}")]
    InvalidRouteData(String),

    #[error("route request timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    #[error("location permission denied: {0}")]
    PermissionDenied(String),

    #[error("position unavailable: {0}")]
    PositionUnavailable(String),

    #[error("cannot {action} while session is {status}")]
    InvalidTransition {
        action: &'static str,
        status: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("route cache error: {0}")]
    Cache(String),
}

/// Closed classification of errors, as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingDestination,
    MissingPosition,
    RouteUnavailable,
    InvalidRouteData,
    TimedOut,
    PermissionDenied,
    PositionUnavailable,
    InvalidTransition,
    Config,
    Cache,
}

impl NavError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NavError::MissingDestination => ErrorKind::MissingDestination,
            NavError::MissingPosition => ErrorKind::MissingPosition,
            NavError::RouteUnavailable(_) => ErrorKind::RouteUnavailable,
            NavError::InvalidRouteData(_) => ErrorKind::InvalidRouteData,
            NavError::TimedOut(_) => ErrorKind::TimedOut,
            NavError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            NavError::PositionUnavailable(_) => ErrorKind::PositionUnavailable,
            NavError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            NavError::Config(_) => ErrorKind::Config,
            NavError::Cache(_) => ErrorKind::Cache,
        }
    }

    /// Whether the session (or a retry by the host) can carry on after
    /// this error. Start-time validation failures and bad configuration
    /// need the host to supply different input.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            NavError::MissingDestination
                | NavError::MissingPosition
                | NavError::InvalidTransition { .. }
                | NavError::Config(_)
        )
    }
}

/// Error payload delivered to the host on the event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
}

impl From<&NavError> for ErrorReport {
    fn from(err: &NavError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        }
    }
}
