//! Navigation session state machine.
//!
//! ```text
//! Idle --start--> Active <--pause/resume--> Paused
//!                   |                         |
//!                   +----------end------------+--> Ended
//! ```
//!
//! The session owns all per-trip state. Position samples are handled
//! synchronously; the only suspending work is a route fetch, which runs
//! on a spawned task and reports back through an internal channel tagged
//! with its generation. Responses for anything but the latest generation
//! are dropped, so a slow fetch can never overwrite a newer route.
//!
//! Hosts either call the handlers directly or hand the session to
//! [`NavigationSession::run`] and steer it with a [`SessionHandle`].
//! Fetches are spawned on the Tokio runtime the session was created in,
//! or the one passed to [`NavigationSession::with_runtime`], so the sync
//! handlers can be called from threads outside the runtime, such as JNI
//! callback threads.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::{CachedRoute, RouteCache};
use crate::config::NavigationConfig;
use crate::deviation::DeviationDetector;
use crate::error::{ErrorReport, NavError};
use crate::events::{EndReason, EventSink, NavEvent};
use crate::geo::{distance_meters, route_bearing_for_user, Coordinate};
use crate::instruction::InstructionStep;
use crate::orientation::OrientationSmoother;
use crate::route::{fetch_with_timeout, Destination, RouteProvider, RouteResult};
use crate::tracker::{PositionErrorCode, PositionSample, PositionTracker, PositionUpdate};
use crate::zoom::ZoomController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Active,
    Paused,
    Ended,
}

impl SessionStatus {
    fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Ended => "ended",
        }
    }
}

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationState {
    pub status: SessionStatus,
    pub current_step_index: usize,
    /// Latest issued route generation. The initial route is generation 1.
    pub route_generation: u64,
    pub last_recalculation_at_ms: Option<u64>,
    pub smoothed_heading: Option<f64>,
    /// Meters per second.
    pub speed_estimate: Option<f64>,
}

impl Default for NavigationState {
    fn default() -> Self {
        Self {
            status: SessionStatus::Idle,
            current_step_index: 0,
            route_generation: 0,
            last_recalculation_at_ms: None,
            smoothed_heading: None,
            speed_estimate: None,
        }
    }
}

/// Host requests delivered to a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Pause,
    Resume,
    End(EndReason),
    /// Reroute from the last known position right away.
    Recalculate,
    SetRotationOverride(Option<f64>),
}

/// Cloneable control handle for a session driven by `run()`.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Returns false once the session is gone.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn pause(&self) -> bool {
        self.send(SessionCommand::Pause)
    }

    pub fn resume(&self) -> bool {
        self.send(SessionCommand::Resume)
    }

    pub fn end(&self, reason: EndReason) -> bool {
        self.send(SessionCommand::End(reason))
    }

    pub fn recalculate(&self) -> bool {
        self.send(SessionCommand::Recalculate)
    }

    pub fn set_rotation_override(&self, angle: Option<f64>) -> bool {
        self.send(SessionCommand::SetRotationOverride(angle))
    }
}

/// Outcome of a route fetch, tagged with the generation it was issued for.
#[derive(Debug)]
pub struct RouteResponse {
    pub generation: u64,
    pub requested_at_ms: u64,
    pub result: Result<RouteResult, NavError>,
}

#[derive(Debug, Clone)]
struct ActiveRoute {
    /// Generation that produced this route. Step progress is monotone
    /// per active route.
    generation: u64,
    route: RouteResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    OnStep,
    Advanced,
    Arrived,
}

pub struct NavigationSession {
    config: NavigationConfig,
    provider: Arc<dyn RouteProvider>,
    tracker: Box<dyn PositionTracker>,
    cache: Option<Box<dyn RouteCache>>,
    events: EventSink,

    state: NavigationState,
    destination: Option<Destination>,
    route: Option<ActiveRoute>,
    /// Generation of the recalculation currently awaiting its response.
    in_flight: Option<u64>,
    last_fix: Option<(Coordinate, u64)>,

    detector: DeviationDetector,
    smoother: OrientationSmoother,
    zoom: ZoomController,

    positions: Option<mpsc::UnboundedReceiver<PositionUpdate>>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    route_tx: mpsc::UnboundedSender<RouteResponse>,
    route_rx: mpsc::UnboundedReceiver<RouteResponse>,
    cancel: CancellationToken,
    runtime: Option<Handle>,
}

impl NavigationSession {
    pub fn new(
        config: NavigationConfig,
        provider: Arc<dyn RouteProvider>,
        tracker: Box<dyn PositionTracker>,
        events: EventSink,
    ) -> (Self, SessionHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (route_tx, route_rx) = mpsc::unbounded_channel();

        let session = Self {
            detector: DeviationDetector::from_config(&config),
            smoother: OrientationSmoother::from_config(&config),
            zoom: ZoomController::new(),
            config,
            provider,
            tracker,
            cache: None,
            events,
            state: NavigationState::default(),
            destination: None,
            route: None,
            in_flight: None,
            last_fix: None,
            positions: None,
            commands,
            route_tx,
            route_rx,
            cancel: CancellationToken::new(),
            runtime: Handle::try_current().ok(),
        };

        (session, SessionHandle { tx: command_tx })
    }

    /// Persist every accepted route to `cache`.
    pub fn with_cache(mut self, cache: Box<dyn RouteCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Spawn route fetches on `runtime`. Needed when the session is
    /// created outside a Tokio runtime.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    pub fn snapshot(&self) -> NavigationState {
        self.state.clone()
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn route(&self) -> Option<&RouteResult> {
        self.route.as_ref().map(|r| &r.route)
    }

    pub fn current_step(&self) -> Option<&InstructionStep> {
        self.route()?.steps.get(self.state.current_step_index)
    }

    /// Whether the position subscription is currently open.
    pub fn is_tracking(&self) -> bool {
        self.tracker.is_active()
    }

    fn invalid(&self, action: &'static str) -> NavError {
        NavError::InvalidTransition {
            action,
            status: self.state.status.as_str(),
        }
    }

    /// Fetch the first route and begin tracking.
    ///
    /// Nothing is subscribed and no state changes unless the whole
    /// start succeeds. When the directions service fails, a cached route
    /// to the same destination is used instead if one exists.
    pub async fn start(
        &mut self,
        destination: Option<Destination>,
        initial_position: Option<PositionSample>,
    ) -> Result<(), NavError> {
        if self.state.status != SessionStatus::Idle {
            return Err(self.invalid("start"));
        }

        let result = self.start_inner(destination, initial_position).await;
        if let Err(err) = &result {
            warn!("Navigation start failed: {err}");
            self.events.error(err);
        }
        result
    }

    async fn start_inner(
        &mut self,
        destination: Option<Destination>,
        initial_position: Option<PositionSample>,
    ) -> Result<(), NavError> {
        let destination = destination
            .filter(|d| d.coordinate().is_valid())
            .ok_or(NavError::MissingDestination)?;
        let initial = initial_position
            .filter(|p| p.coordinate().is_valid())
            .ok_or(NavError::MissingPosition)?;

        let origin = initial.coordinate();
        let route = match fetch_with_timeout(
            self.provider.as_ref(),
            origin,
            destination.coordinate(),
            self.config.profile,
            self.config.route_timeout(),
        )
        .await
        {
            Ok(route) => route,
            Err(err) => match self.cached_route_for(&destination) {
                Some(route) => {
                    warn!("Route fetch failed ({err}), using cached route");
                    route
                }
                None => return Err(err),
            },
        };

        let positions = self.tracker.start()?;

        info!(
            "Navigation started to {:?}: {} steps, {:.0} m",
            destination.name,
            route.steps.len(),
            route.distance_m
        );

        self.positions = Some(positions);
        self.destination = Some(destination);
        self.route = Some(ActiveRoute { generation: 1, route });
        self.state = NavigationState {
            status: SessionStatus::Active,
            current_step_index: 0,
            route_generation: 1,
            last_recalculation_at_ms: Some(initial.timestamp_ms),
            smoothed_heading: self.smoother.heading(),
            speed_estimate: None,
        };
        self.last_fix = Some((origin, initial.timestamp_ms));

        self.store_in_cache();
        if let Some(step) = self.current_step().cloned() {
            self.events.emit(NavEvent::InstructionChanged { step });
        }
        Ok(())
    }

    fn cached_route_for(&self, destination: &Destination) -> Option<RouteResult> {
        let cache = self.cache.as_ref()?;
        match cache.get() {
            Ok(Some(cached))
                if distance_meters(&cached.destination.coordinate(), &destination.coordinate())
                    <= self.config.arrival_threshold_m =>
            {
                Some(cached.route)
            }
            Ok(_) => None,
            Err(err) => {
                warn!("Route cache unreadable: {err}");
                None
            }
        }
    }

    fn store_in_cache(&mut self) {
        let (Some(cache), Some(destination), Some(active)) =
            (self.cache.as_mut(), self.destination.as_ref(), self.route.as_ref())
        else {
            return;
        };

        let cached = CachedRoute {
            destination: destination.clone(),
            route: active.route.clone(),
        };
        if let Err(err) = cache.set(&cached) {
            warn!("Failed to cache route: {err}");
        }
    }

    /// Stop tracking. A no-op when already paused.
    pub fn pause(&mut self) -> Result<(), NavError> {
        match self.state.status {
            SessionStatus::Active => {
                self.tracker.stop();
                self.positions = None;
                self.state.status = SessionStatus::Paused;
                info!("Navigation paused");
                Ok(())
            }
            SessionStatus::Paused => Ok(()),
            _ => Err(self.invalid("pause")),
        }
    }

    /// Reopen the position subscription. A no-op when already active.
    pub fn resume(&mut self) -> Result<(), NavError> {
        match self.state.status {
            SessionStatus::Paused => {
                self.positions = Some(self.tracker.start()?);
                self.state.status = SessionStatus::Active;
                info!("Navigation resumed");
                Ok(())
            }
            SessionStatus::Active => Ok(()),
            _ => Err(self.invalid("resume")),
        }
    }

    /// End the session. A no-op when already ended.
    pub fn end(&mut self, reason: EndReason) -> Result<(), NavError> {
        match self.state.status {
            SessionStatus::Active | SessionStatus::Paused => {
                self.finish(reason);
                Ok(())
            }
            SessionStatus::Ended => Ok(()),
            SessionStatus::Idle => Err(self.invalid("end")),
        }
    }

    fn finish(&mut self, reason: EndReason) {
        self.tracker.stop();
        self.positions = None;
        self.cancel.cancel();
        self.in_flight = None;
        self.route = None;
        self.state.status = SessionStatus::Ended;
        info!("Navigation ended: {reason:?}");
        self.events.emit(NavEvent::SessionEnded { reason });
    }

    /// Pin the map rotation to `angle`, or return to heading-driven
    /// rotation with `None`.
    pub fn set_rotation_override(&mut self, angle: Option<f64>) {
        self.smoother.set_manual_override(angle);
        self.state.smoothed_heading = self.smoother.heading();
        if let Some(angle_deg) = self.smoother.heading() {
            self.events.emit(NavEvent::RotationChanged { angle_deg });
        }
    }

    /// Process one location fix.
    pub fn on_position_update(&mut self, sample: &PositionSample) {
        if self.state.status != SessionStatus::Active {
            debug!("Ignoring position sample while {}", self.state.status.as_str());
            return;
        }

        let position = sample.coordinate();
        if !position.is_valid() {
            warn!("Ignoring invalid position sample {sample:?}");
            return;
        }
        let now = sample.timestamp_ms;

        match self.advance_progress(&position) {
            Progress::Arrived => {
                info!("Arrived at destination");
                self.events.emit(NavEvent::Arrived);
                self.finish(EndReason::Arrived);
                return;
            }
            Progress::Advanced => {}
            Progress::OnStep => self.check_deviation(sample, &position, now),
        }

        self.update_motion(sample, &position, now);
    }

    /// Each step's target is the point where it ends. Consecutive targets
    /// within reach are consumed in one go, so a zero-length final step
    /// arrives together with the step before it.
    fn advance_progress(&mut self, position: &Coordinate) -> Progress {
        let Some(active) = self.route.as_ref() else {
            return Progress::OnStep;
        };
        let steps = &active.route.steps;
        if self.state.current_step_index >= steps.len() {
            return Progress::Arrived;
        }

        let start = self.state.current_step_index;
        let mut index = start;
        while let Some(step) = steps.get(index) {
            if distance_meters(position, &step.location()) >= self.config.arrival_threshold_m {
                break;
            }
            index += 1;
        }
        if index == start {
            return Progress::OnStep;
        }

        self.state.current_step_index = index;
        match steps.get(index) {
            Some(next) => {
                debug!(
                    "Advanced to step {} ({}) on route generation {}",
                    next.index, next.maneuver, active.generation
                );
                self.events.emit(NavEvent::InstructionChanged { step: next.clone() });
                Progress::Advanced
            }
            None => Progress::Arrived,
        }
    }

    fn check_deviation(&mut self, sample: &PositionSample, position: &Coordinate, now: u64) {
        if self.in_flight.is_some() {
            return;
        }
        if !(sample.accuracy <= self.config.max_sample_accuracy_m) {
            debug!("Skipping deviation check for fix with accuracy {:.0} m", sample.accuracy);
            return;
        }
        let Some(active) = self.route.as_ref() else {
            return;
        };

        let last = self.state.last_recalculation_at_ms.unwrap_or(0);
        if self
            .detector
            .should_recalculate(position, &active.route.geometry, last, now)
        {
            info!("Off route, recalculating");
            if let Err(err) = self.begin_recalculation(*position, now) {
                debug!("Recalculation not started: {err}");
            }
        }
    }

    fn update_motion(&mut self, sample: &PositionSample, position: &Coordinate, now: u64) {
        let speed = sample
            .speed
            .filter(|s| s.is_finite() && *s >= 0.0)
            .or_else(|| {
                let (prev, at) = self.last_fix?;
                let elapsed_ms = now.checked_sub(at).filter(|dt| *dt > 0)?;
                Some(distance_meters(&prev, position) / (elapsed_ms as f64 / 1000.0))
            });
        self.last_fix = Some((*position, now));

        if let Some(speed) = speed {
            self.state.speed_estimate = Some(speed);
            if let Some(level) = self.zoom.update(speed) {
                self.events.emit(NavEvent::ZoomChanged { level });
            }
        }

        let heading = sample.heading.filter(|h| h.is_finite()).or_else(|| {
            self.route
                .as_ref()
                .and_then(|r| route_bearing_for_user(position, &r.route.geometry))
        });
        if let Some(heading) = heading {
            match self.smoother.update(heading, now) {
                Some(angle_deg) if self.state.smoothed_heading != Some(angle_deg) => {
                    self.state.smoothed_heading = Some(angle_deg);
                    self.events.emit(NavEvent::RotationChanged { angle_deg });
                }
                _ => {}
            }
        }
    }

    /// Request a new route from `origin`, superseding any recalculation
    /// still in flight. Returns the new generation.
    pub fn recalculate(&mut self, origin: Coordinate, now_ms: u64) -> Result<u64, NavError> {
        if self.state.status != SessionStatus::Active {
            return Err(self.invalid("recalculate"));
        }
        self.begin_recalculation(origin, now_ms)
    }

    fn begin_recalculation(&mut self, origin: Coordinate, now_ms: u64) -> Result<u64, NavError> {
        let destination = self
            .destination
            .as_ref()
            .ok_or(NavError::MissingDestination)?
            .coordinate();
        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            let err = NavError::RouteUnavailable("no async runtime to fetch on".into());
            warn!("Cannot recalculate: {err}");
            self.state.last_recalculation_at_ms = Some(now_ms);
            self.events.emit(NavEvent::RecalculationFailed {
                error: ErrorReport::from(&err),
            });
            return Err(err);
        };

        self.state.route_generation += 1;
        let generation = self.state.route_generation;
        self.in_flight = Some(generation);
        info!("Requesting route generation {generation}");

        let provider = Arc::clone(&self.provider);
        let tx = self.route_tx.clone();
        let cancel = self.cancel.clone();
        let profile = self.config.profile;
        let timeout = self.config.route_timeout();

        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Route fetch for generation {generation} cancelled");
                }
                result = fetch_with_timeout(provider.as_ref(), origin, destination, profile, timeout) => {
                    let _ = tx.send(RouteResponse {
                        generation,
                        requested_at_ms: now_ms,
                        result,
                    });
                }
            }
        });

        Ok(generation)
    }

    /// Wait for the next route fetch to resolve.
    pub async fn next_route_response(&mut self) -> Option<RouteResponse> {
        self.route_rx.recv().await
    }

    /// Apply a resolved fetch. Stale generations are discarded; failures
    /// keep the current route.
    pub fn apply_route_response(&mut self, response: RouteResponse) {
        if self.state.status == SessionStatus::Ended {
            debug!("Session ended, dropping route generation {}", response.generation);
            return;
        }
        if response.generation != self.state.route_generation {
            debug!(
                "Discarding stale route generation {} (current {})",
                response.generation, self.state.route_generation
            );
            return;
        }

        self.in_flight = None;
        self.state.last_recalculation_at_ms = Some(response.requested_at_ms);

        match response.result {
            Ok(route) => {
                info!(
                    "Route replaced (generation {}): {} steps, {:.0} m",
                    response.generation,
                    route.steps.len(),
                    route.distance_m
                );
                let geometry = route.geometry.clone();
                let steps = route.steps.clone();
                self.route = Some(ActiveRoute {
                    generation: response.generation,
                    route,
                });
                self.state.current_step_index = 0;
                self.store_in_cache();

                let first = steps.first().cloned();
                self.events.emit(NavEvent::RouteReplaced { geometry, steps });
                if let Some(step) = first {
                    self.events.emit(NavEvent::InstructionChanged { step });
                }
            }
            Err(err) => {
                warn!("Recalculation failed, keeping current route: {err}");
                self.events.emit(NavEvent::RecalculationFailed {
                    error: ErrorReport::from(&err),
                });
            }
        }
    }

    fn handle_position_update(&mut self, update: PositionUpdate) {
        match update {
            PositionUpdate::Sample(sample) => self.on_position_update(&sample),
            PositionUpdate::Error(err) => {
                let code = err.code;
                let err = NavError::from(err);
                warn!("Position source error: {err}");
                if code == PositionErrorCode::PermissionDenied {
                    if let Err(pause_err) = self.pause() {
                        debug!("Could not pause after permission loss: {pause_err}");
                    }
                }
                self.events.error(&err);
            }
        }
    }

    fn handle_command(&mut self, command: SessionCommand) -> Result<(), NavError> {
        debug!("Session command {command:?}");
        match command {
            SessionCommand::Pause => self.pause(),
            SessionCommand::Resume => self.resume(),
            SessionCommand::End(reason) => self.end(reason),
            SessionCommand::Recalculate => {
                let (position, at) = self.last_fix.ok_or(NavError::MissingPosition)?;
                self.recalculate(position, at).map(|_| ())
            }
            SessionCommand::SetRotationOverride(angle) => {
                self.set_rotation_override(angle);
                Ok(())
            }
        }
    }

    /// Drive a started session until it ends.
    ///
    /// Dropping every `SessionHandle` ends the session with
    /// `EndReason::HostClosed`.
    pub async fn run(&mut self) {
        if self.state.status == SessionStatus::Idle {
            warn!("run() called on a session that was never started");
            return;
        }

        while self.state.status != SessionStatus::Ended {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(err) = self.handle_command(command) {
                            warn!("Session command rejected: {err}");
                            self.events.error(&err);
                        }
                    }
                    None => {
                        info!("All session handles dropped");
                        self.finish(EndReason::HostClosed);
                    }
                },
                update = next_position(&mut self.positions) => match update {
                    Some(update) => self.handle_position_update(update),
                    None => {
                        debug!("Position stream closed");
                        self.positions = None;
                    }
                },
                Some(response) = self.route_rx.recv() => self.apply_route_response(response),
            }
        }
    }
}

/// Next item of the position stream; pending forever while unsubscribed.
async fn next_position(
    positions: &mut Option<mpsc::UnboundedReceiver<PositionUpdate>>,
) -> Option<PositionUpdate> {
    match positions {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{GpxRouteCache, MemoryRouteCache};
    use crate::config::TravelProfile;
    use crate::instruction::ManeuverKey;
    use crate::tracker::{ChannelTracker, PositionFeed};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn pt(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon)
    }

    fn sample(lat: f64, lon: f64, timestamp_ms: u64) -> PositionSample {
        PositionSample {
            lat,
            lon,
            accuracy: 5.0,
            heading: None,
            speed: None,
            timestamp_ms,
        }
    }

    /// Origin, a corner due east/west of it at the destination's
    /// longitude, then the destination. Each step targets the point where
    /// it ends.
    fn three_step_route(origin: Coordinate, destination: Coordinate) -> RouteResult {
        let corner = pt(origin.lat, destination.lon);
        RouteResult {
            geometry: vec![origin, corner, destination],
            steps: vec![
                InstructionStep::from_text(0, "Head east on Avenida Um", 1000.0, corner),
                InstructionStep::from_text(1, "Turn left onto Rua da Praia", 1000.0, destination),
                InstructionStep::from_text(2, "Arrive at destination", 0.0, destination),
            ],
            distance_m: 2000.0,
            duration_s: 1500.0,
        }
    }

    #[derive(Default)]
    struct StubProvider {
        calls: AtomicUsize,
        fail: AtomicBool,
        gates: Mutex<Vec<(Coordinate, oneshot::Receiver<()>)>>,
        /// Degrees of latitude the route start is moved north of the
        /// requested origin, like a service snapping onto a street.
        snap_north: f64,
    }

    impl StubProvider {
        fn snapping(snap_north: f64) -> Self {
            Self {
                snap_north,
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        /// Hold fetches from `origin` until the returned sender fires.
        fn gate(&self, origin: Coordinate) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().push((origin, rx));
            tx
        }

        fn take_gate(&self, origin: Coordinate) -> Option<oneshot::Receiver<()>> {
            let mut gates = self.gates.lock().unwrap();
            let index = gates.iter().position(|(c, _)| *c == origin)?;
            Some(gates.remove(index).1)
        }
    }

    #[async_trait]
    impl RouteProvider for StubProvider {
        async fn fetch_route(
            &self,
            origin: Coordinate,
            destination: Coordinate,
            _profile: TravelProfile,
        ) -> Result<RouteResult, NavError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = self.take_gate(origin) {
                let _ = gate.await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(NavError::RouteUnavailable("stub offline".into()));
            }
            let start = pt(origin.lat + self.snap_north, origin.lon);
            Ok(three_step_route(start, destination))
        }
    }

    struct Harness {
        session: NavigationSession,
        handle: SessionHandle,
        feed: PositionFeed,
        events: mpsc::UnboundedReceiver<NavEvent>,
        provider: Arc<StubProvider>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(NavigationConfig::default(), StubProvider::default())
        }

        fn with(config: NavigationConfig, provider: StubProvider) -> Self {
            let provider = Arc::new(provider);
            let tracker = ChannelTracker::new();
            let feed = tracker.feed();
            let (sink, events) = EventSink::channel();
            let (session, handle) =
                NavigationSession::new(config, provider.clone(), Box::new(tracker), sink);
            Self {
                session,
                handle,
                feed,
                events,
                provider,
            }
        }

        async fn started() -> Self {
            Self::new().start().await
        }

        async fn start(mut self) -> Self {
            self.session
                .start(Some(Destination::new(1.0, 1.0, "Destination")), Some(sample(0.0, 0.0, 0)))
                .await
                .unwrap();
            self
        }

        fn drain(&mut self) -> Vec<NavEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    fn instruction_indices(events: &[NavEvent]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|e| match e {
                NavEvent::InstructionChanged { step } => Some(step.index),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn start_activates_session() {
        let mut h = Harness::started().await;

        let state = h.session.snapshot();
        assert_eq!(state.status, SessionStatus::Active);
        assert_eq!(state.current_step_index, 0);
        assert_eq!(state.route_generation, 1);
        assert_eq!(state.last_recalculation_at_ms, Some(0));
        assert!(h.session.is_tracking());
        assert_eq!(h.session.route().unwrap().steps.len(), 3);
        assert_eq!(h.provider.calls(), 1);
        assert_eq!(instruction_indices(&h.drain()), vec![0]);
    }

    #[tokio::test]
    async fn start_without_destination_has_no_side_effects() {
        let mut h = Harness::new();
        let err = h.session.start(None, Some(sample(0.0, 0.0, 0))).await.unwrap_err();

        assert_eq!(err, NavError::MissingDestination);
        assert_eq!(h.session.status(), SessionStatus::Idle);
        assert!(!h.session.is_tracking());
        assert_eq!(h.provider.calls(), 0);
        match h.drain().as_slice() {
            [NavEvent::Error { error }] => assert!(!error.recoverable),
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_without_position_fails() {
        let mut h = Harness::new();
        let err = h
            .session
            .start(Some(Destination::new(1.0, 1.0, "Destination")), None)
            .await
            .unwrap_err();
        assert_eq!(err, NavError::MissingPosition);
        assert!(!h.session.is_tracking());
    }

    #[tokio::test]
    async fn start_with_unreachable_provider_stays_idle() {
        let mut h = Harness::new();
        h.provider.set_failing(true);
        let err = h
            .session
            .start(Some(Destination::new(1.0, 1.0, "Destination")), Some(sample(0.0, 0.0, 0)))
            .await
            .unwrap_err();

        assert!(matches!(err, NavError::RouteUnavailable(_)));
        assert_eq!(h.session.status(), SessionStatus::Idle);
        assert!(!h.session.is_tracking());
    }

    #[tokio::test]
    async fn start_falls_back_to_cached_route() {
        let destination = Destination::new(1.0, 1.0, "Destination");
        let mut cache = MemoryRouteCache::new();
        cache
            .set(&CachedRoute {
                destination: destination.clone(),
                route: three_step_route(pt(0.5, 0.5), destination.coordinate()),
            })
            .unwrap();

        let mut h = Harness::new();
        h.provider.set_failing(true);
        let mut session = h.session.with_cache(Box::new(cache));
        session
            .start(Some(destination), Some(sample(0.0, 0.0, 0)))
            .await
            .unwrap();

        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.route().unwrap().geometry[0], pt(0.5, 0.5));
    }

    #[tokio::test]
    async fn started_route_is_written_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_route.gpx");

        let h = Harness::new();
        let mut session = h.session.with_cache(Box::new(GpxRouteCache::new(&path)));
        session
            .start(Some(Destination::new(1.0, 1.0, "Destination")), Some(sample(0.0, 0.0, 0)))
            .await
            .unwrap();

        let cached = GpxRouteCache::new(&path).get().unwrap().unwrap();
        assert_eq!(cached.destination.name, "Destination");
        assert_eq!(cached.route.steps.len(), 3);
        assert_eq!(cached.route.steps[1].maneuver, ManeuverKey::TurnLeft);
    }

    #[tokio::test]
    async fn reaching_step_target_advances_instruction() {
        let mut h = Harness::started().await;
        h.drain();

        // Corner at the end of the first step
        h.session.on_position_update(&sample(0.0, 1.0, 1_000));

        assert_eq!(h.session.snapshot().current_step_index, 1);
        assert_eq!(instruction_indices(&h.drain()), vec![1]);
        assert_eq!(h.session.current_step().unwrap().street_name, "Rua da Praia");
    }

    #[tokio::test]
    async fn off_route_after_cooldown_triggers_one_fetch() {
        let mut h = Harness::started().await;
        h.session.on_position_update(&sample(0.0, 0.0, 1_000));

        // ~111 m north of the first segment
        h.session.on_position_update(&sample(0.001, 0.5, 31_000));
        h.session.on_position_update(&sample(0.0012, 0.5, 31_500));
        assert_eq!(h.session.snapshot().route_generation, 2);

        let response = h.session.next_route_response().await.unwrap();
        assert_eq!(response.generation, 2);
        assert_eq!(h.provider.calls(), 2);
        h.session.apply_route_response(response);

        let state = h.session.snapshot();
        assert_eq!(state.current_step_index, 0);
        assert_eq!(state.last_recalculation_at_ms, Some(31_000));
        assert_eq!(h.session.route().unwrap().geometry[0], pt(0.001, 0.5));
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, NavEvent::RouteReplaced { .. })));
    }

    #[tokio::test]
    async fn off_route_within_cooldown_does_not_fetch() {
        let mut h = Harness::started().await;
        h.session.on_position_update(&sample(0.001, 0.5, 10_000));
        h.session.on_position_update(&sample(0.001, 0.5, 30_000));

        assert_eq!(h.session.snapshot().route_generation, 1);
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn inaccurate_fix_does_not_trigger_recalculation() {
        let mut h = Harness::started().await;
        let mut fix = sample(0.001, 0.5, 40_000);
        fix.accuracy = 120.0;
        h.session.on_position_update(&fix);

        assert_eq!(h.session.snapshot().route_generation, 1);
    }

    #[tokio::test]
    async fn stale_generation_is_discarded() {
        let mut h = Harness::started().await;
        let b = pt(0.002, 0.5);
        let c = pt(0.003, 0.5);
        let release_b = h.provider.gate(b);
        let release_c = h.provider.gate(c);

        let gen_b = h.session.recalculate(b, 40_000).unwrap();
        let gen_c = h.session.recalculate(c, 41_000).unwrap();
        assert_eq!((gen_b, gen_c), (2, 3));

        release_c.send(()).unwrap();
        let first = h.session.next_route_response().await.unwrap();
        assert_eq!(first.generation, 3);
        h.session.apply_route_response(first);

        release_b.send(()).unwrap();
        let second = h.session.next_route_response().await.unwrap();
        assert_eq!(second.generation, 2);
        h.session.apply_route_response(second);

        assert_eq!(h.session.route().unwrap().geometry[0], c);
        assert_eq!(h.session.snapshot().last_recalculation_at_ms, Some(41_000));
        let replaced = h
            .drain()
            .iter()
            .filter(|e| matches!(e, NavEvent::RouteReplaced { .. }))
            .count();
        assert_eq!(replaced, 1);
    }

    #[tokio::test]
    async fn failed_recalculation_keeps_route_and_respects_cooldown() {
        let mut h = Harness::started().await;
        let original = h.session.route().unwrap().clone();
        h.provider.set_failing(true);

        h.session.on_position_update(&sample(0.001, 0.5, 31_000));
        let response = h.session.next_route_response().await.unwrap();
        h.session.apply_route_response(response);

        assert_eq!(h.session.route().unwrap(), &original);
        assert_eq!(h.session.status(), SessionStatus::Active);
        assert_eq!(h.session.snapshot().last_recalculation_at_ms, Some(31_000));
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, NavEvent::RecalculationFailed { error } if error.recoverable)));

        // Still off route, but the failed attempt restarted the cooldown
        h.session.on_position_update(&sample(0.001, 0.5, 45_000));
        assert_eq!(h.session.snapshot().route_generation, 2);
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test]
    async fn walking_all_steps_arrives() {
        let mut h = Harness::started().await;
        h.session.on_position_update(&sample(0.0, 0.5, 1_000));
        h.session.on_position_update(&sample(0.0, 1.0, 2_000));
        assert_eq!(h.session.snapshot().current_step_index, 1);
        // Last turn and the zero-length arrival share a target
        h.session.on_position_update(&sample(1.0, 1.0, 3_000));

        assert_eq!(h.session.status(), SessionStatus::Ended);
        assert!(!h.session.is_tracking());
        assert!(h.session.route().is_none());

        let events = h.drain();
        let tail: Vec<_> = events.iter().rev().take(2).rev().cloned().collect();
        assert_eq!(
            tail,
            vec![
                NavEvent::Arrived,
                NavEvent::SessionEnded {
                    reason: EndReason::Arrived
                }
            ]
        );
    }

    #[tokio::test]
    async fn pause_resume_end_lifecycle() {
        let mut h = Harness::started().await;

        h.session.pause().unwrap();
        h.session.pause().unwrap();
        assert_eq!(h.session.status(), SessionStatus::Paused);
        assert!(!h.session.is_tracking());

        // Samples are ignored while paused
        h.session.on_position_update(&sample(0.0, 1.0, 1_000));
        assert_eq!(h.session.snapshot().current_step_index, 0);

        h.session.resume().unwrap();
        assert!(h.session.is_tracking());
        assert_eq!(h.session.status(), SessionStatus::Active);

        h.session.end(EndReason::UserCancelled).unwrap();
        h.session.end(EndReason::UserCancelled).unwrap();
        assert_eq!(h.session.status(), SessionStatus::Ended);
        assert!(h.session.route().is_none());
        assert!(!h.session.is_tracking());
        assert!(matches!(
            h.session.pause(),
            Err(NavError::InvalidTransition { action: "pause", .. })
        ));
    }

    #[tokio::test]
    async fn idle_session_rejects_pause() {
        let mut h = Harness::new();
        assert!(h.session.pause().is_err());
        assert!(h.session.end(EndReason::UserCancelled).is_err());
    }

    #[tokio::test]
    async fn permission_denied_pauses_session() {
        let mut h = Harness::started().await;
        h.drain();

        h.session.handle_position_update(PositionUpdate::Error(crate::tracker::PositionError {
            code: PositionErrorCode::PermissionDenied,
            message: "revoked".into(),
        }));

        assert_eq!(h.session.status(), SessionStatus::Paused);
        assert!(!h.session.is_tracking());
        match h.drain().as_slice() {
            [NavEvent::Error { error }] => {
                assert_eq!(error.kind, crate::error::ErrorKind::PermissionDenied);
                assert!(error.recoverable);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn heading_and_speed_drive_rotation_and_zoom() {
        let mut h = Harness::started().await;
        h.drain();

        let mut fix = sample(0.0, 0.3, 5_000);
        fix.heading = Some(90.0);
        fix.speed = Some(6.0);
        h.session.on_position_update(&fix);

        let events = h.drain();
        assert!(events.contains(&NavEvent::ZoomChanged { level: 16 }));
        assert!(events.contains(&NavEvent::RotationChanged { angle_deg: 90.0 }));

        h.session.set_rotation_override(Some(45.0));
        assert_eq!(h.session.snapshot().smoothed_heading, Some(45.0));
        assert_eq!(h.drain(), vec![NavEvent::RotationChanged { angle_deg: 45.0 }]);

        // The pinned angle is not re-announced for every fix
        let mut fix = sample(0.0, 0.4, 7_000);
        fix.heading = Some(180.0);
        h.session.on_position_update(&fix);
        assert!(!h
            .drain()
            .iter()
            .any(|e| matches!(e, NavEvent::RotationChanged { .. })));
    }

    #[tokio::test]
    async fn speed_is_estimated_from_consecutive_fixes() {
        let mut h = Harness::started().await;
        h.drain();

        // ~11.1 m east of the start fix, one second later
        h.session.on_position_update(&sample(0.0, 0.0001, 1_000));

        let speed = h.session.snapshot().speed_estimate.unwrap();
        assert!((speed - 11.12).abs() < 0.1, "Expected ~11.1 m/s, got {speed}");
        assert!(h.drain().contains(&NavEvent::ZoomChanged { level: 16 }));

        // Same spot again: standing still
        h.session.on_position_update(&sample(0.0, 0.0001, 3_000));
        assert_eq!(h.session.snapshot().speed_estimate, Some(0.0));
        assert!(h.drain().contains(&NavEvent::ZoomChanged { level: 18 }));
    }

    #[tokio::test]
    async fn missing_heading_follows_route_bearing() {
        let mut h = Harness::started().await;
        h.drain();

        // Mid first segment, which runs due east
        h.session.on_position_update(&sample(0.0, 0.3, 5_000));

        let angle = h
            .drain()
            .into_iter()
            .find_map(|e| match e {
                NavEvent::RotationChanged { angle_deg } => Some(angle_deg),
                _ => None,
            })
            .unwrap();
        assert!((angle - 90.0).abs() < 1e-6, "Expected 90, got {angle}");
        assert_eq!(h.session.snapshot().smoothed_heading, Some(angle));
    }

    #[tokio::test]
    async fn transient_tracker_errors_keep_session_active() {
        let mut h = Harness::started().await;
        h.drain();

        for code in [PositionErrorCode::Unavailable, PositionErrorCode::Timeout] {
            h.session.handle_position_update(PositionUpdate::Error(crate::tracker::PositionError {
                code,
                message: "no fix".into(),
            }));

            assert_eq!(h.session.status(), SessionStatus::Active);
            assert!(h.session.is_tracking());
            match h.drain().as_slice() {
                [NavEvent::Error { error }] => {
                    assert_eq!(error.kind, crate::error::ErrorKind::PositionUnavailable);
                    assert!(error.recoverable);
                }
                other => panic!("unexpected events for {code:?}: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn timed_out_recalculation_keeps_route() {
        let config = NavigationConfig {
            route_timeout_ms: 50,
            ..NavigationConfig::default()
        };
        let mut h = Harness::with(config, StubProvider::default()).start().await;
        let original = h.session.route().unwrap().clone();
        h.drain();

        let origin = pt(0.001, 0.5);
        let _never_released = h.provider.gate(origin);
        assert_eq!(h.session.recalculate(origin, 40_000).unwrap(), 2);

        let response = h.session.next_route_response().await.unwrap();
        assert_eq!(response.generation, 2);
        assert_eq!(response.result, Err(NavError::TimedOut(Duration::from_millis(50))));
        h.session.apply_route_response(response);

        assert_eq!(h.session.route().unwrap(), &original);
        assert_eq!(h.session.status(), SessionStatus::Active);
        assert_eq!(h.session.snapshot().last_recalculation_at_ms, Some(40_000));
        match h.drain().as_slice() {
            [NavEvent::RecalculationFailed { error }] => {
                assert_eq!(error.kind, crate::error::ErrorKind::TimedOut);
                assert!(error.recoverable);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn joining_route_past_first_vertex_reaches_destination() {
        // The route starts ~22 m north of the start fix
        let mut h = Harness::with(NavigationConfig::default(), StubProvider::snapping(0.0002))
            .start()
            .await;
        assert_eq!(h.session.route().unwrap().geometry[0], pt(0.0002, 0.0));

        // Join the street ~22 m past its first vertex, then walk it
        h.session.on_position_update(&sample(0.0002, 0.0002, 1_000));
        h.session.on_position_update(&sample(0.0002, 0.5, 60_000));
        h.session.on_position_update(&sample(0.0002, 1.0, 120_000));
        assert_eq!(h.session.snapshot().current_step_index, 1);
        h.session.on_position_update(&sample(1.0, 1.0, 240_000));

        assert_eq!(h.session.status(), SessionStatus::Ended);
        assert_eq!(h.provider.calls(), 1);
        let events = h.drain();
        assert_eq!(instruction_indices(&events), vec![0, 1]);
        assert!(events.contains(&NavEvent::Arrived));
    }

    #[test]
    fn fetches_spawn_on_runtime_given_at_construction() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        // Built and driven from a thread that is not inside the runtime
        let mut h = Harness::new();
        h.session = h.session.with_runtime(runtime.handle().clone());
        let mut h = runtime.block_on(h.start());

        h.session.on_position_update(&sample(0.001, 0.5, 31_000));
        assert_eq!(h.session.snapshot().route_generation, 2);

        let response = runtime.block_on(h.session.next_route_response()).unwrap();
        assert_eq!(response.generation, 2);
        h.session.apply_route_response(response);
        assert_eq!(h.session.route().unwrap().geometry[0], pt(0.001, 0.5));
    }

    #[test]
    fn recalculation_without_runtime_is_reported() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut h = runtime.block_on(Harness::new().start());
        h.drain();

        let err = h.session.recalculate(pt(0.001, 0.5), 31_000).unwrap_err();

        assert!(matches!(err, NavError::RouteUnavailable(_)));
        assert_eq!(h.session.snapshot().route_generation, 1);
        assert_eq!(h.session.status(), SessionStatus::Active);
        assert!(matches!(
            h.drain().as_slice(),
            [NavEvent::RecalculationFailed { error }] if error.recoverable
        ));
    }

    #[tokio::test]
    async fn run_loop_processes_feed_and_commands() {
        let h = Harness::started().await;
        let Harness {
            mut session,
            handle,
            feed,
            mut events,
            ..
        } = h;

        let task = tokio::spawn(async move {
            session.run().await;
            session
        });

        assert!(feed.push_sample(sample(0.0, 1.0, 1_000)));
        loop {
            match events.recv().await.unwrap() {
                NavEvent::InstructionChanged { step } if step.index == 1 => break,
                _ => continue,
            }
        }

        assert!(handle.end(EndReason::UserCancelled));
        let session = task.await.unwrap();
        assert_eq!(session.status(), SessionStatus::Ended);
        assert!(!feed.push_sample(sample(0.0, 1.0, 2_000)));
    }

    #[tokio::test]
    async fn dropping_handles_ends_session() {
        let h = Harness::started().await;
        let Harness {
            mut session,
            handle,
            mut events,
            ..
        } = h;
        drop(handle);

        session.run().await;

        assert_eq!(session.status(), SessionStatus::Ended);
        let mut ended = None;
        while let Ok(event) = events.try_recv() {
            if let NavEvent::SessionEnded { reason } = event {
                ended = Some(reason);
            }
        }
        assert_eq!(ended, Some(EndReason::HostClosed));
    }
}
