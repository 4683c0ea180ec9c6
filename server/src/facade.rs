//! AxiDraw facade — spec.md §4.D.
//!
//! Composes the servo and motion subsystems over the serial driver behind
//! a single state machine (`disconnected -> connected -> ready -> busy ->
//! ready | error`, with `paused` a peer of `busy`). Every public operation
//! advances `ready -> busy -> ready` and appends an action-history entry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ebb_protocol::{ControlError, FacadeState, FirmwareVersion, PenState, Resolution, Units};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use crate::config::Config;
use crate::motion::{Model, MotionController, Position};
use crate::serial::{CommandKind, SerialDriver, DEFAULT_TIMEOUT};
use crate::servo::{ServoConfig, ServoController};

const DEFAULT_RESOLUTION: Resolution = Resolution::Sixteenth;
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);
const PATH_HISTORY_CAP: usize = 5_000;
const ACTION_HISTORY_CAP: usize = 500;
const FIFO_RESIZE_MIN_VERSION: FirmwareVersion = FirmwareVersion::new(2, 4, 0);
const NICKNAME_MIN_VERSION: FirmwareVersion = FirmwareVersion::new(2, 3, 0);

#[derive(Debug, Clone, Serialize)]
pub struct ActionHistoryEntry {
    pub op: String,
    pub ok: bool,
    pub message: Option<String>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PathPoint {
    pub x: i64,
    pub y: i64,
    pub pen_down: bool,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone)]
pub enum FacadeEvent {
    StateChanged(FacadeState),
    PathUpdate(PathPoint),
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A single step of the mini command language accepted by `execute`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum MiniCommand {
    MoveTo { x: f64, y: f64, units: Units },
    Move { dx: f64, dy: f64, units: Units, speed_ips: Option<f64>, duration_ms: Option<f64> },
    LineTo { dx: f64, dy: f64, units: Units, speed_ips: Option<f64>, duration_ms: Option<f64> },
    PenUp,
    PenDown,
    Pause { ms: u64 },
    Home { rate: Option<f64> },
}

pub struct AxiDrawFacade {
    driver: SerialDriver,
    motion: MotionController,
    servo: Arc<ServoController>,
    state: Arc<RwLock<FacadeState>>,
    pen_is_down: RwLock<bool>,
    path_history: RwLock<VecDeque<PathPoint>>,
    action_history: RwLock<VecDeque<ActionHistoryEntry>>,
    events: broadcast::Sender<FacadeEvent>,
    heartbeat_failures: Arc<RwLock<u32>>,
    config: Config,
    heartbeat_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
    /// Runtime-overridable (pen-up, pen-down) default speeds in in/s,
    /// seeded from `config` but adjustable live via `/speed`.
    speeds: RwLock<(f64, f64)>,
}

impl AxiDrawFacade {
    pub fn new(driver: SerialDriver, config: Config) -> Arc<Self> {
        let model = Model::by_name(&config.model);
        let motion = MotionController::new(driver.clone(), model);
        let servo = ServoController::new(driver.clone(), config.servo_profile);
        let (events, _) = broadcast::channel(256);
        let speeds = RwLock::new((config.speed_pen_up_ips, config.speed_pen_down_ips));

        Arc::new(Self {
            driver,
            motion,
            servo,
            state: Arc::new(RwLock::new(FacadeState::Disconnected)),
            pen_is_down: RwLock::new(false),
            path_history: RwLock::new(VecDeque::with_capacity(64)),
            action_history: RwLock::new(VecDeque::with_capacity(64)),
            events,
            heartbeat_failures: Arc::new(RwLock::new(0)),
            config,
            heartbeat_handle: RwLock::new(None),
            speeds,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<FacadeEvent> {
        self.events.subscribe()
    }

    /// Current (pen-up, pen-down) default speeds in in/s.
    pub async fn speeds(&self) -> (f64, f64) {
        *self.speeds.read().await
    }

    pub async fn set_speeds(&self, pen_up_ips: Option<f64>, pen_down_ips: Option<f64>) {
        let mut speeds = self.speeds.write().await;
        if let Some(v) = pen_up_ips {
            speeds.0 = v;
        }
        if let Some(v) = pen_down_ips {
            speeds.1 = v;
        }
    }

    pub async fn state(&self) -> FacadeState {
        *self.state.read().await
    }

    pub async fn position(&self) -> Position {
        self.motion.position().await
    }

    pub async fn position_mm(&self) -> (f64, f64) {
        let pos = self.motion.position().await;
        (self.motion.steps_to_mm(pos.x).await, self.motion.steps_to_mm(pos.y).await)
    }

    pub async fn pen_state(&self) -> PenState {
        self.servo.pen_state().await
    }

    pub async fn path_history(&self) -> Vec<PathPoint> {
        self.path_history.read().await.iter().copied().collect()
    }

    pub async fn action_history(&self) -> Vec<ActionHistoryEntry> {
        self.action_history.read().await.iter().cloned().collect()
    }

    async fn set_state(&self, s: FacadeState) {
        *self.state.write().await = s;
        let _ = self.events.send(FacadeEvent::StateChanged(s));
    }

    async fn push_history(&self, op: &str, ok: bool, message: Option<String>) {
        let mut h = self.action_history.write().await;
        h.push_back(ActionHistoryEntry { op: op.to_string(), ok, message, timestamp_ms: now_ms() });
        if h.len() > ACTION_HISTORY_CAP {
            h.pop_front();
        }
    }

    async fn push_path_point(&self, pos: Position) {
        let pen_down = *self.pen_is_down.read().await;
        let point = PathPoint { x: pos.x, y: pos.y, pen_down, timestamp_ms: now_ms() };
        let mut h = self.path_history.write().await;
        h.push_back(point);
        if h.len() > PATH_HISTORY_CAP {
            h.pop_front();
        }
        let _ = self.events.send(FacadeEvent::PathUpdate(point));
    }

    fn require_state(&self, current: FacadeState, expected: FacadeState) -> Result<(), ControlError> {
        if current != expected {
            return Err(ControlError::state_conflict(format!(
                "operation requires state {expected:?}, found {current:?}"
            )));
        }
        Ok(())
    }

    /// Advance disconnected -> connected -> ready on demand.
    pub async fn ensure_ready(&self, port: Option<String>) -> Result<(), ControlError> {
        match self.state().await {
            FacadeState::Ready | FacadeState::Busy | FacadeState::Paused => return Ok(()),
            FacadeState::Disconnected => {
                self.connect(port).await?;
            }
            FacadeState::Error => {
                return Err(ControlError::state_conflict("facade is in error state, call disconnect() first"));
            }
            FacadeState::Connected => {}
        }
        self.initialize().await
    }

    pub async fn connect(&self, port: Option<String>) -> Result<(), ControlError> {
        self.require_state(self.state().await, FacadeState::Disconnected)?;
        self.driver.connect(port).await?;
        self.set_state(FacadeState::Connected).await;
        Ok(())
    }

    async fn initialize(&self) -> Result<(), ControlError> {
        self.require_state(self.state().await, FacadeState::Connected)?;

        self.motion.clear_position().await?;

        let info = self.driver.info().await;
        if info.min_version(FIFO_RESIZE_MIN_VERSION) {
            self.driver.command("CU,4,3", DEFAULT_TIMEOUT).await?;
        }

        self.servo.initialize().await?;
        self.motion.motors_on(DEFAULT_RESOLUTION).await?;

        if self.servo.pen_state().await != PenState::Up {
            self.servo.pen_up(false).await?;
        }
        *self.pen_is_down.write().await = false;

        self.set_state(FacadeState::Ready).await;
        self.start_heartbeat().await;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), ControlError> {
        self.stop_heartbeat().await;
        self.driver.disconnect().await;
        self.set_state(FacadeState::Disconnected).await;
        Ok(())
    }

    async fn start_heartbeat(&self) {
        let driver = self.driver.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let failures = self.heartbeat_failures.clone();
        let threshold = self.config.heartbeat_fail_threshold;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_PERIOD);
            loop {
                interval.tick().await;
                let ok = driver
                    .query("QG", CommandKind::QueryWithTerminator, DEFAULT_TIMEOUT)
                    .await
                    .is_ok();

                let mut f = failures.write().await;
                if ok {
                    *f = 0;
                    continue;
                }
                *f += 1;
                warn!(failures = *f, "heartbeat query failed");
                if *f >= threshold {
                    *state.write().await = FacadeState::Disconnected;
                    let _ = events.send(FacadeEvent::StateChanged(FacadeState::Disconnected));
                    break;
                }
            }
        });

        *self.heartbeat_handle.write().await = Some(handle);
    }

    async fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_handle.write().await.take() {
            handle.abort();
        }
        *self.heartbeat_failures.write().await = 0;
    }

    async fn begin_op(&self) -> Result<(), ControlError> {
        let current = self.state().await;
        self.require_state(current, FacadeState::Ready)?;
        self.set_state(FacadeState::Busy).await;
        Ok(())
    }

    async fn end_op(&self, name: &str, result: &Result<(), ControlError>) {
        match result {
            Ok(()) => {
                self.set_state(FacadeState::Ready).await;
                self.push_history(name, true, None).await;
            }
            Err(e) => {
                self.set_state(FacadeState::Ready).await;
                self.push_history(name, false, Some(e.to_string())).await;
            }
        }
    }

    // ── Public operations (spec.md §4.D table) ─────────────────────────

    pub async fn pen_up(&self) -> Result<(), ControlError> {
        self.begin_op().await?;
        let result = self.pen_up_inner().await;
        self.end_op("pen_up", &result).await;
        result
    }

    async fn pen_up_inner(&self) -> Result<(), ControlError> {
        self.servo.pen_up(false).await?;
        *self.pen_is_down.write().await = false;
        Ok(())
    }

    pub async fn pen_down(&self) -> Result<(), ControlError> {
        self.begin_op().await?;
        let result = self.pen_down_inner().await;
        self.end_op("pen_down", &result).await;
        result
    }

    async fn pen_down_inner(&self) -> Result<(), ControlError> {
        self.servo.pen_down(false).await?;
        *self.pen_is_down.write().await = true;
        Ok(())
    }

    pub async fn pen_toggle(&self) -> Result<PenState, ControlError> {
        self.begin_op().await?;
        let result = self.servo.pen_toggle().await;
        if let Ok(state) = &result {
            *self.pen_is_down.write().await = *state == PenState::Down;
        }
        let unit_result = result.as_ref().map(|_| ()).map_err(|e| e.clone());
        self.end_op("pen_toggle", &unit_result).await;
        result
    }

    pub async fn pen_sync(&self) -> Result<PenState, ControlError> {
        self.begin_op().await?;
        let result = self.servo.query_hardware_state().await;
        let unit_result = result.as_ref().map(|_| ()).map_err(|e| e.clone());
        self.end_op("pen_sync", &unit_result).await;
        result
    }

    pub async fn configure_pen(&self, cfg: ServoConfig) -> Result<(), ControlError> {
        self.begin_op().await?;
        let result = async {
            self.servo.configure(cfg).await;
            self.servo.initialize().await
        }
        .await;
        self.end_op("configure_pen", &result).await;
        result
    }

    pub async fn home(&self, rate: Option<f64>) -> Result<(), ControlError> {
        self.begin_op().await?;
        let result = self.home_inner(rate).await;
        self.end_op("home", &result).await;
        result
    }

    async fn home_inner(&self, rate: Option<f64>) -> Result<(), ControlError> {
        if self.servo.pen_state().await != PenState::Up {
            self.pen_up_inner().await?;
        }
        self.motion.home(rate.unwrap_or(2_000.0)).await?;
        self.push_path_point(self.motion.position().await).await;
        Ok(())
    }

    pub async fn move_to(&self, x: f64, y: f64, units: Units) -> Result<(), ControlError> {
        self.begin_op().await?;
        let result = self.move_to_inner(x, y, units).await;
        self.end_op("move_to", &result).await;
        result
    }

    async fn move_to_inner(&self, x: f64, y: f64, units: Units) -> Result<(), ControlError> {
        if self.servo.pen_state().await != PenState::Up {
            self.pen_up_inner().await?;
        }
        let x_steps = self.motion.to_steps(x, units).await;
        let y_steps = self.motion.to_steps(y, units).await;
        let (pen_up_ips, _) = self.speeds().await;
        self.motion
            .move_absolute(x_steps, y_steps, None, pen_up_ips)
            .await?;
        self.push_path_point(self.motion.position().await).await;
        Ok(())
    }

    pub async fn move_xy(
        &self,
        dx: f64,
        dy: f64,
        units: Units,
        speed_ips: Option<f64>,
        duration_ms: Option<f64>,
    ) -> Result<(), ControlError> {
        self.begin_op().await?;
        let result = self.move_xy_inner(dx, dy, units, speed_ips, duration_ms).await;
        self.end_op("move", &result).await;
        result
    }

    async fn move_xy_inner(
        &self,
        dx: f64,
        dy: f64,
        units: Units,
        speed_ips: Option<f64>,
        duration_ms: Option<f64>,
    ) -> Result<(), ControlError> {
        if self.servo.pen_state().await != PenState::Up {
            self.pen_up_inner().await?;
        }
        let dx_steps = self.motion.to_steps(dx, units).await;
        let dy_steps = self.motion.to_steps(dy, units).await;
        let (pen_up_ips, _) = self.speeds().await;
        self.motion
            .move_relative(dx_steps, dy_steps, duration_ms, speed_ips.unwrap_or(pen_up_ips))
            .await?;
        self.push_path_point(self.motion.position().await).await;
        Ok(())
    }

    pub async fn line_to(
        &self,
        dx: f64,
        dy: f64,
        units: Units,
        speed_ips: Option<f64>,
        duration_ms: Option<f64>,
    ) -> Result<(), ControlError> {
        self.begin_op().await?;
        let result = self.line_to_inner(dx, dy, units, speed_ips, duration_ms).await;
        self.end_op("line_to", &result).await;
        result
    }

    async fn line_to_inner(
        &self,
        dx: f64,
        dy: f64,
        units: Units,
        speed_ips: Option<f64>,
        duration_ms: Option<f64>,
    ) -> Result<(), ControlError> {
        if self.servo.pen_state().await != PenState::Down {
            self.pen_down_inner().await?;
        }
        let dx_steps = self.motion.to_steps(dx, units).await;
        let dy_steps = self.motion.to_steps(dy, units).await;
        let (_, pen_down_ips) = self.speeds().await;
        self.motion
            .move_relative(
                dx_steps,
                dy_steps,
                duration_ms,
                speed_ips.unwrap_or(pen_down_ips),
            )
            .await?;
        self.push_path_point(self.motion.position().await).await;
        Ok(())
    }

    pub async fn execute(&self, commands: Vec<MiniCommand>) -> Result<(), ControlError> {
        self.begin_op().await?;
        let mut result = Ok(());
        for cmd in commands {
            result = match cmd {
                MiniCommand::MoveTo { x, y, units } => self.move_to_inner(x, y, units).await,
                MiniCommand::Move { dx, dy, units, speed_ips, duration_ms } => {
                    self.move_xy_inner(dx, dy, units, speed_ips, duration_ms).await
                }
                MiniCommand::LineTo { dx, dy, units, speed_ips, duration_ms } => {
                    self.line_to_inner(dx, dy, units, speed_ips, duration_ms).await
                }
                MiniCommand::PenUp => self.pen_up_inner().await,
                MiniCommand::PenDown => self.pen_down_inner().await,
                MiniCommand::Pause { ms } => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(())
                }
                MiniCommand::Home { rate } => self.home_inner(rate).await,
            };
            if result.is_err() {
                break;
            }
        }
        self.end_op("execute", &result).await;
        result
    }

    pub async fn motors_on(&self) -> Result<(), ControlError> {
        self.begin_op().await?;
        let result = self.motion.motors_on(DEFAULT_RESOLUTION).await;
        self.end_op("motors_on", &result).await;
        result
    }

    pub async fn motors_off(&self) -> Result<(), ControlError> {
        self.begin_op().await?;
        let result = self.motion.motors_off().await;
        self.end_op("motors_off", &result).await;
        result
    }

    pub async fn emergency_stop(&self) -> Result<(), ControlError> {
        let result = self.motion.emergency_stop(false).await;
        self.push_history("emergency_stop", result.is_ok(), result.as_ref().err().map(|e| e.to_string())).await;
        self.set_state(FacadeState::Connected).await;
        result
    }

    /// `motorsOff -> motorsOn -> clearSteps -> syncPosition` (spec.md §9
    /// Open Question, resolved as a first-class operation). Position can
    /// be transiently negative with respect to the true physical origin
    /// until this completes.
    pub async fn reorigin(&self) -> Result<(), ControlError> {
        self.begin_op().await?;
        let result = async {
            self.motion.motors_off().await?;
            self.motion.motors_on(DEFAULT_RESOLUTION).await?;
            self.motion.clear_position().await?;
            self.motion.sync_position_from_device().await
        }
        .await;
        self.end_op("reorigin", &result).await;
        result
    }

    pub async fn get_version(&self) -> Result<String, ControlError> {
        let info = self.driver.info().await;
        info.firmware_version
            .map(|v| v.to_string())
            .ok_or(ControlError::NotConnected)
    }

    pub async fn set_nickname(&self, name: &str) -> Result<(), ControlError> {
        let info = self.driver.info().await;
        if !info.min_version(NICKNAME_MIN_VERSION) {
            return Err(ControlError::state_conflict("firmware does not support nicknames"));
        }
        self.driver.command(format!("ST,{name}"), DEFAULT_TIMEOUT).await
    }

    /// The device persists its own nickname; the host treats `QT` as the
    /// only source of truth for it (spec.md §6).
    pub async fn get_nickname(&self) -> Result<String, ControlError> {
        self.driver
            .query("QT", CommandKind::QueryWithTerminator, DEFAULT_TIMEOUT)
            .await
            .map(|s| s.trim().to_string())
    }

    /// `RB`: no response, the device severs the connection to enter its
    /// bootloader-reboot cycle.
    pub async fn reboot(&self) -> Result<(), ControlError> {
        self.driver.write_raw("RB").await
    }

    pub async fn reset_device(&self) -> Result<(), ControlError> {
        self.driver.command("R", DEFAULT_TIMEOUT).await
    }

    pub async fn pen_config(&self) -> crate::servo::ServoConfig {
        self.servo.config().await
    }

    pub async fn resolution_for_status(&self) -> Resolution {
        self.motion.resolution().await
    }

    pub fn model_name(&self) -> &'static str {
        self.motion.model_name()
    }

    pub async fn clear_path_history(&self) {
        self.path_history.write().await.clear();
    }
}
