//! Spatial processor — spec.md §4.E.
//!
//! Converts a live stream of controller states into bounded, smoothed,
//! backpressured movement deltas dispatched to the motion subsystem.
//! Two input modes share one accumulator/threshold/backpressure path:
//! *position mode* (deltas against the previous sample) and *velocity
//! mode* (its own fixed-rate integration tick).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VelocityCurve {
    Linear,
    #[default]
    Cubic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_z: f64,
    pub max_z: f64,
}

impl Default for Bounds {
    fn default() -> Self {
        Self { min_x: -150.0, max_x: 150.0, min_y: -100.0, max_y: 100.0, min_z: 0.0, max_z: 1.0 }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    pub deadzone: f64,
    pub velocity_curve: VelocityCurve,
    pub max_linear_speed: f64,
    pub max_angular_speed: f64,
    pub linear_damping: f64,
    pub angular_damping: f64,
    pub smoothing_alpha: f64,
    pub bounds: Bounds,
    pub tick_rate_hz: f64,
    pub network_latency_ms: f64,
    pub movement_threshold: f64,
    pub max_pending_commands: u32,
    pub min_command_interval_ms: u64,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            deadzone: 0.08,
            velocity_curve: VelocityCurve::Cubic,
            max_linear_speed: 200.0,
            max_angular_speed: 6.0,
            linear_damping: 0.92,
            angular_damping: 0.96,
            smoothing_alpha: 0.15,
            bounds: Bounds::default(),
            tick_rate_hz: 120.0,
            network_latency_ms: 15.0,
            movement_threshold: 0.5,
            max_pending_commands: 3,
            min_command_interval_ms: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// A completed (or still-running) movement dispatch. Mirrors spec.md
/// §9's "uniform completion-notifying handle" direction: callers hand
/// back something awaitable rather than a synchronous-or-future union.
pub type MovementFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback invoked once an accumulated delta crosses the emission
/// threshold. Returns a future that resolves when the dispatched motion
/// command completes (success or failure) so backpressure accounting can
/// release the in-flight slot.
pub type MovementCallback = Box<dyn Fn(f64, f64, bool) -> MovementFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SpatialState {
    pub position: Point3,
    pub velocity: Point3,
    pub angular_velocity: f64,
    pub pen_down: bool,
}

struct Inner {
    config: SpatialConfig,
    last_sample: Option<Point3>,
    position: Point3,
    velocity: Point3,
    target_velocity: Point3,
    angular_velocity: f64,
    pending_dx: f64,
    pending_dy: f64,
    pen_down: bool,
    pending_commands: u32,
    last_emit: Option<Instant>,
    tick_handle: Option<JoinHandle<()>>,
}

impl Inner {
    fn new(config: SpatialConfig) -> Self {
        Self {
            config,
            last_sample: None,
            position: Point3::default(),
            velocity: Point3::default(),
            target_velocity: Point3::default(),
            angular_velocity: 0.0,
            pending_dx: 0.0,
            pending_dy: 0.0,
            pen_down: false,
            pending_commands: 0,
            last_emit: None,
            tick_handle: None,
        }
    }

    fn clamp_to_bounds(&self, p: Point3) -> Point3 {
        let b = self.config.bounds;
        Point3 {
            x: p.x.clamp(b.min_x, b.max_x),
            y: p.y.clamp(b.min_y, b.max_y),
            z: p.z.clamp(b.min_z, b.max_z),
        }
    }

    fn apply_curve(&self, v: f64) -> f64 {
        let dz = self.config.deadzone;
        let mag = v.abs();
        if mag < dz {
            return 0.0;
        }
        let rescaled = (mag - dz) / (1.0 - dz);
        let shaped = match self.config.velocity_curve {
            VelocityCurve::Linear => rescaled,
            VelocityCurve::Cubic => rescaled.powi(3),
        };
        shaped.copysign(v)
    }

    /// Returns `Some((dx, dy, pen_down))` if this accumulation should
    /// emit now, consuming the accumulator and reserving a backpressure
    /// slot.
    fn try_emit(&mut self) -> Option<(f64, f64, bool)> {
        if self.pending_commands >= self.config.max_pending_commands {
            return None;
        }
        if let Some(last) = self.last_emit {
            if last.elapsed() < Duration::from_millis(self.config.min_command_interval_ms) {
                return None;
            }
        }
        let magnitude = (self.pending_dx.powi(2) + self.pending_dy.powi(2)).sqrt();
        if magnitude < self.config.movement_threshold {
            return None;
        }

        let dx = self.pending_dx;
        let dy = self.pending_dy;
        self.position.x += dx;
        self.position.y += dy;
        self.pending_dx = 0.0;
        self.pending_dy = 0.0;
        self.pending_commands += 1;
        self.last_emit = Some(Instant::now());
        Some((dx, dy, self.pen_down))
    }
}

/// Real-time input conditioner (spec.md §4.E). Holds no reference to the
/// motion subsystem directly — callers supply a [`MovementCallback`] so
/// the processor stays testable in isolation.
pub struct SpatialProcessor {
    inner: RwLock<Inner>,
    state_events: broadcast::Sender<SpatialState>,
}

impl SpatialProcessor {
    pub fn new(config: SpatialConfig) -> Self {
        let (state_events, _) = broadcast::channel(64);
        Self { inner: RwLock::new(Inner::new(config)), state_events }
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<SpatialState> {
        self.state_events.subscribe()
    }

    pub async fn config(&self) -> SpatialConfig {
        self.inner.read().await.config.clone()
    }

    pub async fn configure(&self, config: SpatialConfig) {
        self.inner.write().await.config = config;
    }

    pub async fn position(&self) -> Point3 {
        self.inner.read().await.position
    }

    /// `getPredictedPosition()`: position + velocity * networkLatency.
    pub async fn predicted_position(&self) -> Point3 {
        let inner = self.inner.read().await;
        let latency_s = inner.config.network_latency_ms / 1000.0;
        Point3 {
            x: inner.position.x + inner.velocity.x * latency_s,
            y: inner.position.y + inner.velocity.y * latency_s,
            z: inner.position.z + inner.velocity.z * latency_s,
        }
    }

    /// Overwrite the integrated position (after home / emergency stop).
    pub async fn sync_position(&self, pos: Point3) {
        let mut inner = self.inner.write().await;
        inner.position = pos;
        inner.last_sample = None;
        inner.pending_dx = 0.0;
        inner.pending_dy = 0.0;
    }

    pub async fn set_pen_down(&self, down: bool) {
        self.inner.write().await.pen_down = down;
    }

    /// `home` action event: zero position and pending accumulation.
    pub async fn reset_to_home(&self) {
        let mut inner = self.inner.write().await;
        inner.position = Point3::default();
        inner.last_sample = None;
        inner.pending_dx = 0.0;
        inner.pending_dy = 0.0;
    }

    /// `stop` action event: stop the tick, zero targets/velocities.
    pub async fn stop(&self) {
        let mut inner = self.inner.write().await;
        inner.target_velocity = Point3::default();
        inner.velocity = Point3::default();
        inner.angular_velocity = 0.0;
        if let Some(handle) = inner.tick_handle.take() {
            handle.abort();
        }
    }

    /// Enter velocity mode: spawn the fixed-rate tick loop (idempotent —
    /// a second call while one is already running is a no-op).
    pub async fn start_velocity_loop(self: &Arc<Self>, callback: MovementCallback)
    where
        Self: Send + Sync + 'static,
    {
        let mut inner = self.inner.write().await;
        if inner.tick_handle.is_some() {
            return;
        }
        let period = Duration::from_secs_f64(1.0 / inner.config.tick_rate_hz.max(1.0));
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut last = Instant::now();
            loop {
                interval.tick().await;
                let now = Instant::now();
                let dt = now.duration_since(last);
                last = now;
                this.tick(dt, &callback).await;
            }
        });
        inner.tick_handle = Some(handle);
    }

    async fn release_slot(inner: &RwLock<Inner>) {
        let mut guard = inner.write().await;
        guard.pending_commands = guard.pending_commands.saturating_sub(1);
    }

    /// Position-mode sample: an absolute target point in mm.
    pub async fn submit_position(&self, point: Point3, callback: &MovementCallback) {
        let maybe_emit = {
            let mut inner = self.inner.write().await;
            let clamped = inner.clamp_to_bounds(point);

            let Some(last) = inner.last_sample else {
                inner.last_sample = Some(clamped);
                inner.position = clamped;
                return;
            };

            let dx = clamped.x - last.x;
            let dy = clamped.y - last.y;
            inner.last_sample = Some(clamped);
            inner.pending_dx += dx;
            inner.pending_dy += dy;
            inner.try_emit()
        };

        if let Some((dx, dy, pen_down)) = maybe_emit {
            let fut = callback(dx, dy, pen_down);
            fut.await;
            Self::release_slot(&self.inner).await;
        }
    }

    /// Velocity-mode sample: raw stick/axis input in [-1, 1], shaped by
    /// the deadzone/curve before becoming a target velocity.
    pub async fn submit_velocity(&self, vx: f64, vy: f64, angular: f64) {
        let mut inner = self.inner.write().await;
        let max = inner.config.max_linear_speed;
        let shaped_x = inner.apply_curve(vx);
        let shaped_y = inner.apply_curve(vy);
        inner.target_velocity = Point3 { x: shaped_x * max, y: shaped_y * max, z: 0.0 };
        let max_angular = inner.config.max_angular_speed;
        inner.angular_velocity = inner.apply_curve(angular) * max_angular;
    }

    /// Run one velocity-mode integration tick. Call at `tickRate` Hz
    /// from a spawned loop; not self-driving so tests can step it
    /// manually.
    pub async fn tick(&self, dt: Duration, callback: &MovementCallback) {
        let maybe_emit = {
            let mut inner = self.inner.write().await;
            let dt_s = dt.as_secs_f64();
            let alpha = inner.config.smoothing_alpha;

            inner.velocity.x += (inner.target_velocity.x - inner.velocity.x) * alpha;
            inner.velocity.y += (inner.target_velocity.y - inner.velocity.y) * alpha;
            inner.velocity.x *= inner.config.linear_damping;
            inner.velocity.y *= inner.config.linear_damping;
            inner.angular_velocity *= inner.config.angular_damping;

            let delta = Point3 { x: inner.velocity.x * dt_s, y: inner.velocity.y * dt_s, z: 0.0 };
            let prev = inner.position;
            let integrated = Point3 { x: prev.x + delta.x, y: prev.y + delta.y, z: prev.z };
            let clamped = inner.clamp_to_bounds(integrated);

            let dx = clamped.x - prev.x;
            let dy = clamped.y - prev.y;
            inner.pending_dx += dx;
            inner.pending_dy += dy;
            let emit = inner.try_emit();

            let state = SpatialState {
                position: inner.position,
                velocity: inner.velocity,
                angular_velocity: inner.angular_velocity,
                pen_down: inner.pen_down,
            };
            let _ = self.state_events.send(state);
            emit
        };

        if let Some((dx, dy, pen_down)) = maybe_emit {
            let fut = callback(dx, dy, pen_down);
            fut.await;
            Self::release_slot(&self.inner).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_callback() -> MovementCallback {
        Box::new(|_, _, _| Box::pin(async {}))
    }

    #[tokio::test]
    async fn first_position_sample_is_adopted_with_no_emission() {
        let processor = SpatialProcessor::new(SpatialConfig::default());
        let cb = noop_callback();
        processor.submit_position(Point3 { x: 10.0, y: 10.0, z: 0.0 }, &cb).await;
        assert_eq!(processor.position().await.x, 10.0);
    }

    #[tokio::test]
    async fn accumulated_deltas_emit_once_threshold_crossed() {
        let config = SpatialConfig {
            movement_threshold: 0.5,
            max_pending_commands: 2,
            min_command_interval_ms: 0,
            ..Default::default()
        };
        let processor = SpatialProcessor::new(config);
        let cb = noop_callback();

        processor.submit_position(Point3 { x: 0.0, y: 0.0, z: 0.0 }, &cb).await;
        processor.submit_position(Point3 { x: 0.2, y: 0.0, z: 0.0 }, &cb).await;
        processor.submit_position(Point3 { x: 0.4, y: 0.0, z: 0.0 }, &cb).await;
        // cumulative pending delta (0.4) is still below the 0.5 threshold, so
        // nothing has been emitted yet and position hasn't moved.
        assert!((processor.position().await.x - 0.0).abs() < 1e-9);

        processor.submit_position(Point3 { x: 0.6, y: 0.0, z: 0.0 }, &cb).await;
        // cumulative delta (0.6) crosses the threshold; the whole
        // accumulation is applied in one emission.
        assert!((processor.position().await.x - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_delta_sample_produces_no_accumulation() {
        let processor = SpatialProcessor::new(SpatialConfig::default());
        let cb = noop_callback();
        processor.submit_position(Point3 { x: 5.0, y: 5.0, z: 0.0 }, &cb).await;
        processor.submit_position(Point3 { x: 5.0, y: 5.0, z: 0.0 }, &cb).await;
        let inner = processor.inner.read().await;
        assert_eq!(inner.pending_dx, 0.0);
        assert_eq!(inner.pending_dy, 0.0);
    }
}
