//! Events produced for the host.
//!
//! The engine never draws or speaks. It reports what changed and the
//! host decides how to present it. Events serialize to tagged JSON for
//! hosts on the other side of the JNI boundary.

use log::debug;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{ErrorReport, NavError};
use crate::geo::Coordinate;
use crate::instruction::InstructionStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Arrived,
    UserCancelled,
    /// All session handles were dropped.
    HostClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NavEvent {
    InstructionChanged { step: InstructionStep },
    RotationChanged { angle_deg: f64 },
    ZoomChanged { level: u8 },
    RouteReplaced {
        geometry: Vec<Coordinate>,
        steps: Vec<InstructionStep>,
    },
    SessionEnded { reason: EndReason },
    RecalculationFailed { error: ErrorReport },
    Arrived,
    Error { error: ErrorReport },
}

/// Sending half of the host event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<NavEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<NavEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiver the host listens on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NavEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: NavEvent) {
        if self.tx.send(event).is_err() {
            debug!("Host event receiver dropped, event discarded");
        }
    }

    pub fn error(&self, err: &NavError) {
        self.emit(NavEvent::Error {
            error: ErrorReport::from(err),
        });
    }
}
