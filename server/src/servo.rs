//! Servo (pen-lift) subsystem — spec.md §4.B.
//!
//! Two immutable profiles with pulse-width bounds, sweep-time constants,
//! and per-profile pin/channel assignments. All math here is pure; the
//! only I/O is the handful of `SC`/`SR`/`SP`/`QP` exchanges through the
//! serial driver.

use std::sync::Arc;
use std::time::Duration;

use ebb_protocol::{ControlError, FirmwareVersion, PenState, ServoProfileKind};
use tokio::sync::RwLock;
use tracing::info;

use crate::serial::{CommandKind, SerialDriver, DEFAULT_TIMEOUT};

/// Firmware version at which the standard servo profile gains the
/// power-timeout (`SR`) command.
const POWER_TIMEOUT_MIN_VERSION: FirmwareVersion = FirmwareVersion::new(2, 6, 0);

#[derive(Debug, Clone, Copy)]
pub struct ServoProfile {
    pub kind: ServoProfileKind,
    pub pin: u8,
    pub pulse_min: u32,
    pub pulse_max: u32,
    pub sweep_time_ms: f64,
    pub move_min_ms: f64,
    pub move_slope_ms_per_pct: f64,
    pub pwm_period: f64,
    pub channels: u8,
}

pub const STANDARD: ServoProfile = ServoProfile {
    kind: ServoProfileKind::Standard,
    pin: 1,
    pulse_min: 9855,
    pulse_max: 27831,
    sweep_time_ms: 200.0,
    move_min_ms: 45.0,
    move_slope_ms_per_pct: 2.69,
    pwm_period: 0.24,
    channels: 8,
};

pub const NARROW_BAND: ServoProfile = ServoProfile {
    kind: ServoProfileKind::NarrowBand,
    pin: 2,
    pulse_min: 5400,
    pulse_max: 12600,
    sweep_time_ms: 70.0,
    move_min_ms: 20.0,
    move_slope_ms_per_pct: 1.28,
    pwm_period: 0.03,
    channels: 1,
};

impl ServoProfile {
    pub fn for_kind(kind: ServoProfileKind) -> Self {
        match kind {
            ServoProfileKind::Standard => STANDARD,
            ServoProfileKind::NarrowBand => NARROW_BAND,
        }
    }

    /// Map a percent position in [0,100] linearly onto the pulse range.
    pub fn position_to_pulse(&self, percent: f64) -> u32 {
        let p = percent.clamp(0.0, 100.0) / 100.0;
        let range = (self.pulse_max - self.pulse_min) as f64;
        (self.pulse_min as f64 + range * p).round() as u32
    }

    /// `rateValue = round(range * pwmPeriod * r / sweepTime)`.
    pub fn rate_value(&self, rate_percent: f64) -> u32 {
        let range = (self.pulse_max - self.pulse_min) as f64;
        (range * self.pwm_period * rate_percent / self.sweep_time_ms).round() as u32
    }

    /// Move-time formula (spec.md §4.B): vertical distance `d` (%), rate
    /// `r` (%), extra delay `delta_ms`.
    pub fn move_time_ms(&self, d: f64, r: f64, delta_ms: f64) -> f64 {
        if d < 0.9 {
            return delta_ms.max(0.0);
        }
        let fast = self.move_slope_ms_per_pct * d + self.move_min_ms;
        let slow = self.sweep_time_ms * d / r.max(1.0);
        (fast.powi(4) + slow.powi(4)).powf(0.25).round() + delta_ms
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServoConfig {
    pub pos_up: f64,
    pub pos_down: f64,
    pub rate_raise: f64,
    pub rate_lower: f64,
    pub delay_up_ms: f64,
    pub delay_down_ms: f64,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            pos_up: 60.0,
            pos_down: 40.0,
            rate_raise: 75.0,
            rate_lower: 75.0,
            delay_up_ms: 0.0,
            delay_down_ms: 0.0,
        }
    }
}

/// `SP` pen state flags, matching the real EBB firmware convention.
const SP_RAISE: u8 = 1;
const SP_LOWER: u8 = 0;

pub struct ServoController {
    driver: SerialDriver,
    profile: ServoProfile,
    config: RwLock<ServoConfig>,
    pen_state: RwLock<PenState>,
}

impl ServoController {
    pub fn new(driver: SerialDriver, kind: ServoProfileKind) -> Arc<Self> {
        let controller = Arc::new(Self {
            driver: driver.clone(),
            profile: ServoProfile::for_kind(kind),
            config: RwLock::new(ServoConfig::default()),
            pen_state: RwLock::new(PenState::Unknown),
        });

        // Invalidate the cached pen state whenever the driver reports a
        // command error, so the next pen action can't be wrongly elided.
        let weak_state = controller.clone();
        let mut errors = driver.subscribe_command_errors();
        tokio::spawn(async move {
            while errors.recv().await.is_ok() {
                *weak_state.pen_state.write().await = PenState::Unknown;
            }
        });

        controller
    }

    pub async fn pen_state(&self) -> PenState {
        *self.pen_state.read().await
    }

    pub async fn config(&self) -> ServoConfig {
        self.config.read().await.clone()
    }

    pub async fn configure(&self, cfg: ServoConfig) {
        *self.config.write().await = cfg;
    }

    /// Initialization sequence (spec.md §4.B): position-up, position-down,
    /// raise-rate, lower-rate, PWM-channel count; power-timeout for the
    /// standard servo only on firmware >= 2.6.0; then query hardware state.
    pub async fn initialize(&self) -> Result<(), ControlError> {
        let cfg = self.config().await;
        let up_pulse = self.profile.position_to_pulse(cfg.pos_up);
        let down_pulse = self.profile.position_to_pulse(cfg.pos_down);
        let raise_rate = self.profile.rate_value(cfg.rate_raise);
        let lower_rate = self.profile.rate_value(cfg.rate_lower);

        self.driver.command(format!("SC,4,{up_pulse}"), DEFAULT_TIMEOUT).await?;
        self.driver.command(format!("SC,5,{down_pulse}"), DEFAULT_TIMEOUT).await?;
        self.driver.command(format!("SC,10,{raise_rate}"), DEFAULT_TIMEOUT).await?;
        self.driver.command(format!("SC,11,{lower_rate}"), DEFAULT_TIMEOUT).await?;
        self.driver
            .command(format!("SC,8,{}", self.profile.channels), DEFAULT_TIMEOUT)
            .await?;

        if self.profile.kind == ServoProfileKind::Standard {
            let info = self.driver.info().await;
            if info.min_version(POWER_TIMEOUT_MIN_VERSION) {
                self.driver.command("SR,5000", DEFAULT_TIMEOUT).await?;
            }
        }

        self.query_hardware_state().await?;
        Ok(())
    }

    /// Parse the pen bit off a `QP` exchange and cache it.
    pub async fn query_hardware_state(&self) -> Result<PenState, ControlError> {
        let data = self
            .driver
            .query("QP", CommandKind::QueryWithTerminator, DEFAULT_TIMEOUT)
            .await?;
        let bit = data.trim();
        let state = if bit.starts_with('1') {
            PenState::Up
        } else {
            PenState::Down
        };
        *self.pen_state.write().await = state;
        Ok(state)
    }

    async fn move_pen(&self, raise: bool, force: bool) -> Result<(), ControlError> {
        let current = self.pen_state().await;
        let target = if raise { PenState::Up } else { PenState::Down };
        if !force && current == target {
            return Ok(());
        }

        let cfg = self.config().await;
        let distance = (cfg.pos_up - cfg.pos_down).abs();
        let rate = if raise { cfg.rate_raise } else { cfg.rate_lower };
        let delay = if raise { cfg.delay_up_ms } else { cfg.delay_down_ms };
        let move_ms = self.profile.move_time_ms(distance, rate, delay);

        let sp_state = if raise { SP_RAISE } else { SP_LOWER };
        let delay_param = move_ms.round() as u64;
        self.driver
            .command(format!("SP,{sp_state},{delay_param},{}", self.profile.pin), DEFAULT_TIMEOUT)
            .await?;

        let sleep_ms = if move_ms > 50.0 { move_ms - 30.0 } else { move_ms };
        tokio::time::sleep(Duration::from_millis(sleep_ms.max(0.0) as u64)).await;

        let state = self.query_hardware_state().await?;
        info!(raise, ?state, "pen move complete");
        Ok(())
    }

    pub async fn pen_up(&self, force: bool) -> Result<(), ControlError> {
        self.move_pen(true, force).await
    }

    pub async fn pen_down(&self, force: bool) -> Result<(), ControlError> {
        self.move_pen(false, force).await
    }

    pub async fn pen_toggle(&self) -> Result<PenState, ControlError> {
        let current = match self.pen_state().await {
            PenState::Unknown => self.query_hardware_state().await?,
            s => s,
        };
        match current {
            PenState::Up => {
                self.pen_down(false).await?;
                Ok(PenState::Down)
            }
            _ => {
                self.pen_up(false).await?;
                Ok(PenState::Up)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_maps_linearly() {
        assert_eq!(STANDARD.position_to_pulse(0.0), STANDARD.pulse_min);
        assert_eq!(STANDARD.position_to_pulse(100.0), STANDARD.pulse_max);
    }

    #[test]
    fn move_time_below_threshold_is_just_delay() {
        assert_eq!(STANDARD.move_time_ms(0.5, 75.0, 10.0), 10.0);
    }

    #[test]
    fn move_time_above_threshold_uses_quartic_blend() {
        let t = STANDARD.move_time_ms(20.0, 75.0, 0.0);
        assert!(t > 0.0);
        // Sanity bound: should be in the same order of magnitude as the
        // sweep time for a full-range move.
        assert!(t < STANDARD.sweep_time_ms * 2.0);
    }
}
