pub mod android_jni;
pub mod cache;
pub mod config;
pub mod deviation;
pub mod error;
pub mod events;
pub mod geo;
pub mod instruction;
pub mod orientation;
pub mod route;
pub mod session;
pub mod tracker;
pub mod zoom;

pub use config::{NavigationConfig, TravelProfile};
pub use error::{ErrorKind, ErrorReport, NavError};
pub use events::{EndReason, EventSink, NavEvent};
pub use geo::Coordinate;
pub use route::{Destination, RouteProvider, RouteResult};
pub use session::{NavigationSession, NavigationState, SessionHandle, SessionStatus};
pub use tracker::{ChannelTracker, PositionFeed, PositionSample, PositionTracker};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
