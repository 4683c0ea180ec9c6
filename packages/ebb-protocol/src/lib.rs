//! # ebb-protocol
//!
//! Shared wire-facing types for the plotter control plane.
//!
//! These types are used by:
//! - `server`: the serial driver, motion/servo subsystems, job queue and
//!   session coordinator
//! - integration tests that exercise the driver against a mock EBB
//!
//! No I/O lives here — this crate is pure data plus the error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;

// ── Units ──────────────────────────────────────────────────────────────────

/// Unit tag for a position/delta supplied across an interface boundary.
/// Conversion to steps is total at the boundary; everything past it
/// operates on steps only (spec.md §9 Design Notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    #[default]
    Mm,
    Inches,
    Steps,
}

// ── Pen state ──────────────────────────────────────────────────────────────

/// Tri-state pen position. Never encoded as a nullable boolean at
/// interface boundaries (spec.md §9 Design Notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PenState {
    Up,
    Down,
    Unknown,
}

impl fmt::Display for PenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PenState::Up => "up",
            PenState::Down => "down",
            PenState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

// ── Motor resolution ───────────────────────────────────────────────────────

/// Motor microstepping resolution, as accepted by the `EM` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Disabled,
    Sixteenth,
    Eighth,
    Quarter,
    Half,
    Full,
}

impl Resolution {
    /// `EM,<code>` resolution code (1-5), 0 meaning disabled.
    pub fn code(self) -> u8 {
        match self {
            Resolution::Disabled => 0,
            Resolution::Sixteenth => 1,
            Resolution::Eighth => 2,
            Resolution::Quarter => 3,
            Resolution::Half => 4,
            Resolution::Full => 5,
        }
    }

    /// Scale factor relative to the model's base (1/16 microstepping)
    /// steps-per-inch figure: `2^(5-code)/16`.
    pub fn steps_per_inch_scale(self) -> f64 {
        let code = self.code().max(1) as i32;
        2f64.powi(5 - code) / 16.0
    }
}

// ── Servo profile ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServoProfileKind {
    Standard,
    NarrowBand,
}

// ── Job priority & lifecycle ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Commands,
    Svg,
}

// ── Facade state machine ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacadeState {
    Disconnected,
    Connected,
    Ready,
    Busy,
    Paused,
    Error,
}

// ── EBB status byte (QG) ───────────────────────────────────────────────────

/// Decoded form of the EBB's `QG` status byte. See spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusByte {
    pub fifo_non_empty: bool,
    pub motor2_moving: bool,
    pub motor1_moving: bool,
    pub command_executing: bool,
    pub pen_up: bool,
    pub prg_button_pressed: bool,
    pub power_lost_latch: bool,
    pub limit_switch_triggered: bool,
}

impl StatusByte {
    pub fn from_byte(b: u8) -> Self {
        Self {
            fifo_non_empty: b & 0x01 != 0,
            motor2_moving: b & 0x02 != 0,
            motor1_moving: b & 0x04 != 0,
            command_executing: b & 0x08 != 0,
            pen_up: b & 0x10 != 0,
            prg_button_pressed: b & 0x20 != 0,
            power_lost_latch: b & 0x40 != 0,
            limit_switch_triggered: b & 0x80 != 0,
        }
    }

    /// "Idle" per spec.md §4.C: no command executing, neither motor
    /// moving, and the FIFO is empty.
    pub fn is_idle(&self) -> bool {
        !self.command_executing
            && !self.motor1_moving
            && !self.motor2_moving
            && !self.fifo_non_empty
    }
}

// ── Firmware version ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parse a `major.minor.patch` triple out of a free-form banner string,
    /// e.g. `"EBBv13_and_above EB Firmware Version 3.0.1"`.
    pub fn parse_from_banner(banner: &str) -> Option<Self> {
        let token = banner
            .split_whitespace()
            .rev()
            .find(|tok| tok.chars().filter(|c| *c == '.').count() == 2)?;
        let mut parts = token.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        Some(Self { major, minor, patch })
    }

    pub fn at_least(&self, other: FirmwareVersion) -> bool {
        *self >= other
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ── Error taxonomy (spec.md §7) ────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlError {
    #[error("not connected")]
    NotConnected,

    #[error("timed out waiting for device response")]
    Timeout,

    #[error("write to serial port failed: {message}")]
    WriteFailed { message: String },

    #[error("device reported an error: {message}")]
    DeviceError { message: String },

    #[error("unexpected device identity: {message}")]
    IdentityMismatch { message: String },

    #[error("invalid input: {message}")]
    Validation { message: String },

    #[error("operation not valid in current state: {message}")]
    StateConflict { message: String },

    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },
}

impl ControlError {
    pub fn validation(message: impl Into<String>) -> Self {
        ControlError::Validation { message: message.into() }
    }

    pub fn state_conflict(message: impl Into<String>) -> Self {
        ControlError::StateConflict { message: message.into() }
    }

    pub fn device_error(message: impl Into<String>) -> Self {
        ControlError::DeviceError { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_scale_matches_1_16_base() {
        assert_eq!(Resolution::Sixteenth.steps_per_inch_scale(), 1.0);
        assert_eq!(Resolution::Full.steps_per_inch_scale(), 0.0625);
        assert_eq!(Resolution::Eighth.steps_per_inch_scale(), 0.5);
    }

    #[test]
    fn status_byte_decodes_bit_layout() {
        let s = StatusByte::from_byte(0b0001_0001);
        assert!(s.fifo_non_empty);
        assert!(s.pen_up);
        assert!(!s.is_idle()); // fifo non-empty -> not idle

        let idle = StatusByte::from_byte(0b0001_0000);
        assert!(idle.is_idle());
    }

    #[test]
    fn firmware_version_parses_banner() {
        let v = FirmwareVersion::parse_from_banner(
            "EBBv13_and_above EB Firmware Version 3.0.1",
        )
        .unwrap();
        assert_eq!(v, FirmwareVersion::new(3, 0, 1));
        assert!(v.at_least(FirmwareVersion::new(2, 6, 0)));
        assert!(!v.at_least(FirmwareVersion::new(3, 1, 0)));
    }
}
