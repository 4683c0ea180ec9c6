//! Motion controller — spec.md §4.C.
//!
//! Tracks position in steps, converts between steps/mm/inches, clamps
//! into the workspace rectangle, and enforces the device's step-rate
//! safety envelope before dispatching a mixed-axis move.

use std::time::Duration;

use ebb_protocol::{ControlError, Resolution, StatusByte, Units};
use tokio::sync::RwLock;
use tracing::info;

use crate::serial::{CommandKind, SerialDriver, DEFAULT_TIMEOUT, MOTION_SLACK};

/// Maximum steps/sec any single mixed-axis motor may be commanded to run
/// at (spec.md §4.C, §8 invariant 2).
const MAX_STEP_RATE: f64 = 25_000.0;
const MIN_DURATION_MS: f64 = 2.0;
const HOME_POLL_INTERVAL: Duration = Duration::from_millis(50);
const HOME_DEADLINE_SLACK_MS: f64 = 100.0;

#[derive(Debug, Clone, Copy)]
pub struct Model {
    pub name: &'static str,
    pub travel_x_in: f64,
    pub travel_y_in: f64,
    /// Steps per inch at 1/16 microstepping (the reference resolution).
    pub base_steps_per_inch: f64,
}

pub const MODEL_V3: Model = Model {
    name: "V3",
    travel_x_in: 11.81,
    travel_y_in: 8.58,
    base_steps_per_inch: 2032.0,
};

pub const MODEL_MINI: Model = Model {
    name: "Mini",
    travel_x_in: 6.30,
    travel_y_in: 4.0,
    base_steps_per_inch: 2032.0,
};

impl Model {
    pub fn by_name(name: &str) -> Model {
        match name.to_uppercase().as_str() {
            "MINI" => MODEL_MINI,
            _ => MODEL_V3,
        }
    }

    pub fn steps_per_inch(&self, resolution: Resolution) -> f64 {
        self.base_steps_per_inch * resolution.steps_per_inch_scale()
    }

    pub fn workspace_steps(&self, resolution: Resolution) -> (i64, i64) {
        let spi = self.steps_per_inch(resolution);
        (
            (self.travel_x_in * spi).round() as i64,
            (self.travel_y_in * spi).round() as i64,
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

pub struct MotionController {
    driver: SerialDriver,
    model: Model,
    resolution: RwLock<Resolution>,
    position: RwLock<Position>,
}

impl MotionController {
    pub fn new(driver: SerialDriver, model: Model) -> Self {
        Self {
            driver,
            model,
            resolution: RwLock::new(Resolution::Disabled),
            position: RwLock::new(Position::default()),
        }
    }

    pub async fn position(&self) -> Position {
        *self.position.read().await
    }

    pub async fn resolution(&self) -> Resolution {
        *self.resolution.read().await
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name
    }

    async fn steps_per_inch(&self) -> f64 {
        self.model.steps_per_inch(*self.resolution.read().await)
    }

    async fn workspace(&self) -> (i64, i64) {
        self.model.workspace_steps(*self.resolution.read().await)
    }

    // ── Unit conversions ───────────────────────────────────────────────

    pub async fn inches_to_steps(&self, inches: f64) -> i64 {
        (inches * self.steps_per_inch().await).round() as i64
    }

    pub async fn steps_to_inches(&self, steps: i64) -> f64 {
        steps as f64 / self.steps_per_inch().await
    }

    pub async fn mm_to_steps(&self, mm: f64) -> i64 {
        self.inches_to_steps(mm / 25.4).await
    }

    pub async fn steps_to_mm(&self, steps: i64) -> f64 {
        self.steps_to_inches(steps).await * 25.4
    }

    pub async fn to_steps(&self, value: f64, units: Units) -> i64 {
        match units {
            Units::Steps => value.round() as i64,
            Units::Inches => self.inches_to_steps(value).await,
            Units::Mm => self.mm_to_steps(value).await,
        }
    }

    // ── Motors ──────────────────────────────────────────────────────────

    pub async fn motors_on(&self, resolution: Resolution) -> Result<(), ControlError> {
        let code = resolution.code();
        self.driver
            .command(format!("EM,{code},{code}"), DEFAULT_TIMEOUT)
            .await?;
        *self.resolution.write().await = resolution;
        Ok(())
    }

    pub async fn motors_off(&self) -> Result<(), ControlError> {
        self.driver.command("EM,0,0", DEFAULT_TIMEOUT).await?;
        *self.resolution.write().await = Resolution::Disabled;
        Ok(())
    }

    // ── Moves ───────────────────────────────────────────────────────────

    fn step_rate_floor_ms(dx: i64, dy: i64) -> f64 {
        let motor1 = (dx + dy).unsigned_abs() as f64;
        let motor2 = (dx - dy).unsigned_abs() as f64;
        (motor1.max(motor2) / (MAX_STEP_RATE / 1000.0)).ceil()
    }

    /// Relative move in steps, clamped into the workspace. `speed_ips` is
    /// used to compute the default duration when `duration_ms` is `None`.
    pub async fn move_relative(
        &self,
        dx: i64,
        dy: i64,
        duration_ms: Option<f64>,
        speed_ips: f64,
    ) -> Result<(), ControlError> {
        let (max_x, max_y) = self.workspace().await;
        let current = self.position().await;

        let target_x = (current.x + dx).clamp(0, max_x);
        let target_y = (current.y + dy).clamp(0, max_y);
        let clamped_dx = target_x - current.x;
        let clamped_dy = target_y - current.y;

        if clamped_dx == 0 && clamped_dy == 0 {
            return Ok(());
        }

        let duration = match duration_ms {
            Some(d) => d,
            None => {
                let spi = self.steps_per_inch().await;
                let distance_in = ((clamped_dx.pow(2) + clamped_dy.pow(2)) as f64).sqrt() / spi;
                distance_in / speed_ips * 1000.0
            }
        };

        let floor = Self::step_rate_floor_ms(clamped_dx, clamped_dy);
        let duration = duration.max(MIN_DURATION_MS).max(floor);

        let motor1 = clamped_dx + clamped_dy;
        let motor2 = clamped_dx - clamped_dy;

        self.driver
            .command(
                format!("XM,{},{},{}", duration.round() as i64, motor1, motor2),
                Duration::from_millis(duration.round() as u64) + MOTION_SLACK,
            )
            .await?;

        let mut pos = self.position.write().await;
        pos.x += clamped_dx;
        pos.y += clamped_dy;
        info!(x = pos.x, y = pos.y, "motion: relative move complete");
        Ok(())
    }

    pub async fn move_absolute(
        &self,
        x: i64,
        y: i64,
        duration_ms: Option<f64>,
        speed_ips: f64,
    ) -> Result<(), ControlError> {
        let (max_x, max_y) = self.workspace().await;
        let target_x = x.clamp(0, max_x);
        let target_y = y.clamp(0, max_y);
        let current = self.position().await;
        self.move_relative(target_x - current.x, target_y - current.y, duration_ms, speed_ips)
            .await
    }

    pub async fn home(&self, rate_steps_per_sec: f64) -> Result<(), ControlError> {
        let current = self.position().await;
        let distance = ((current.x.pow(2) + current.y.pow(2)) as f64).sqrt();
        let deadline_ms = if rate_steps_per_sec > 0.0 {
            distance / rate_steps_per_sec * 1000.0 + HOME_DEADLINE_SLACK_MS
        } else {
            HOME_DEADLINE_SLACK_MS
        };

        self.driver
            .command(format!("HM,{}", rate_steps_per_sec.round() as i64), DEFAULT_TIMEOUT)
            .await?;

        self.wait_idle(Duration::from_millis(deadline_ms.round() as u64)).await?;

        *self.position.write().await = Position::default();
        Ok(())
    }

    async fn query_status(&self) -> Result<StatusByte, ControlError> {
        let raw = self
            .driver
            .query("QG", CommandKind::QueryWithTerminator, DEFAULT_TIMEOUT)
            .await?;
        let byte = u8::from_str_radix(raw.trim(), 16)
            .map_err(|_| ControlError::device_error(format!("unparseable QG response: {raw}")))?;
        Ok(StatusByte::from_byte(byte))
    }

    async fn wait_idle(&self, deadline: Duration) -> Result<(), ControlError> {
        let start = tokio::time::Instant::now();
        loop {
            let status = self.query_status().await?;
            if status.is_idle() {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                return Err(ControlError::Timeout);
            }
            tokio::time::sleep(HOME_POLL_INTERVAL).await;
        }
    }

    /// Halt the device, optionally disable motors, then resync the
    /// internal position mirror from the device's step counters (an
    /// emergency stop aborts motion in flight, so the firmware's own
    /// counters are now the only source of truth).
    pub async fn emergency_stop(&self, disable_motors: bool) -> Result<(), ControlError> {
        if disable_motors {
            self.driver.command("ES,1", DEFAULT_TIMEOUT).await?;
        } else {
            self.driver.command("ES", DEFAULT_TIMEOUT).await?;
        }
        self.sync_position_from_device().await
    }

    /// Read the device's own step counters (`QS`) and overwrite the
    /// internal mirror. Used after an emergency stop.
    pub async fn sync_position_from_device(&self) -> Result<(), ControlError> {
        let raw = self
            .driver
            .query("QS", CommandKind::QueryWithTerminator, DEFAULT_TIMEOUT)
            .await?;
        let mut parts = raw.trim().split(',');
        let x: i64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ControlError::device_error(format!("unparseable QS response: {raw}")))?;
        let y: i64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ControlError::device_error(format!("unparseable QS response: {raw}")))?;
        *self.position.write().await = Position { x, y };
        Ok(())
    }

    /// Zero the device's step counters and the internal mirror. Callers
    /// that track a logical origin should treat this as a re-origin
    /// rather than a physical zero (spec.md §4.C).
    pub async fn clear_position(&self) -> Result<(), ControlError> {
        self.driver.command("CS", DEFAULT_TIMEOUT).await?;
        *self.position.write().await = Position::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_rate_floor_enforces_25k_steps_per_sec() {
        // Per spec S3: stepsX alone (dy = 0).
        let floor = MotionController::step_rate_floor_ms(1000, 0);
        assert_eq!(floor, (1000f64 / 25.0).ceil());
    }

    #[test]
    fn workspace_scales_with_resolution() {
        let (max_x_full, _) = MODEL_V3.workspace_steps(Resolution::Full);
        let (max_x_sixteenth, _) = MODEL_V3.workspace_steps(Resolution::Sixteenth);
        assert!(max_x_sixteenth > max_x_full);
    }

    #[test]
    fn mm_round_trips_within_a_step() {
        let spi = MODEL_V3.steps_per_inch(Resolution::Sixteenth);
        let mm = 123.456;
        let steps = (mm / 25.4 * spi).round();
        let back_mm = steps / spi * 25.4;
        assert!((back_mm - mm).abs() < 25.4 / spi + 1e-6);
    }
}
