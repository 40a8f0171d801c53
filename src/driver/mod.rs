//! Device driver interface consumed by the setup pipeline.
//!
//! The physical driver layer is an external collaborator. Every async call here
//! is a potentially blocking hardware round-trip and is the only place a setup
//! run suspends. Each call either returns normally or raises one of the declared
//! [`SetupFault`] kinds; anything else (a panic) is an undeclared failure and is
//! handled by the worker pool.
//!
//! ## Sub-devices
//! - [`Amplifier`]: the solid-state amplifier (SSA) feeding the cavity
//! - [`Tuner`]: the mechanical (stepper) tuner, which has its own abort flag
//!
//! No two cavities share a sub-device, so drivers need no cross-device locking.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SetupFault;

pub mod sim;

/// RF control mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RfMode {
    /// Closed-loop amplitude and phase control
    Selap,
    /// Closed-loop amplitude, open-loop phase
    Sela,
    /// Self-excited loop
    Sel,
    /// Self-excited loop, raw drive
    SelRaw,
    /// Pulsed
    Pulse,
    /// Chirp
    Chirp,
}

impl RfMode {
    /// Wire code of the mode control point.
    pub fn code(self) -> i64 {
        match self {
            RfMode::Selap => 0,
            RfMode::Sela => 1,
            RfMode::Sel => 2,
            RfMode::SelRaw => 3,
            RfMode::Pulse => 4,
            RfMode::Chirp => 5,
        }
    }

    /// Decode a wire code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(RfMode::Selap),
            1 => Some(RfMode::Sela),
            2 => Some(RfMode::Sel),
            3 => Some(RfMode::SelRaw),
            4 => Some(RfMode::Pulse),
            5 => Some(RfMode::Chirp),
            _ => None,
        }
    }

    /// True for full closed-loop (amplitude and phase) regulation.
    pub fn is_closed_loop(self) -> bool {
        self == RfMode::Selap
    }
}

/// Solid-state amplifier owned by one cavity.
#[async_trait]
pub trait Amplifier: Send + Sync {
    /// Enable the amplifier if it is not on already.
    async fn turn_on(&self) -> Result<(), SetupFault>;

    /// Disable the amplifier.
    async fn turn_off(&self) -> Result<(), SetupFault>;

    /// Clear amplifier faults.
    async fn reset(&self) -> Result<(), SetupFault>;

    /// Run the amplifier calibration at the given drive.
    async fn calibrate(&self, drive_max: f64) -> Result<(), SetupFault>;

    /// Maximum safe drive level for calibration.
    fn drive_max(&self) -> f64;
}

/// Mechanical tuner with its own abort semantics.
///
/// A tuner move checks this flag internally; an abort requested at the tuner
/// level must reach the tuner even if the cavity-level checkpoint has not yet
/// run.
pub trait Tuner: Send + Sync {
    /// Raise the tuner's abort flag.
    fn request_abort(&self) -> Result<(), SetupFault>;

    /// Lower the tuner's abort flag.
    fn clear_abort(&self) -> Result<(), SetupFault>;
}

/// Blocking operations on one cavity and its sub-devices.
#[async_trait]
pub trait CavityDriver: Send + Sync {
    /// The cavity's amplifier.
    fn amplifier(&self) -> &dyn Amplifier;

    /// The cavity's mechanical tuner.
    fn tuner(&self) -> &dyn Tuner;

    /// Disable RF drive.
    async fn turn_rf_off(&self) -> Result<(), SetupFault>;

    /// Enable RF drive.
    async fn turn_rf_on(&self) -> Result<(), SetupFault>;

    /// Clear all cavity interlocks.
    async fn reset_interlocks(&self) -> Result<(), SetupFault>;

    /// Move the mechanical tuner to resonance.
    ///
    /// `closed_loop` selects tuning under closed-loop amplitude control.
    async fn move_to_resonance(&self, closed_loop: bool) -> Result<(), SetupFault>;

    /// Run cavity characterization.
    async fn characterize(&self) -> Result<(), SetupFault>;

    /// Acknowledge the probe-Q result of a characterization as valid.
    async fn acknowledge_probe_q(&self) -> Result<(), SetupFault>;

    /// Enable piezo tuner feedback.
    async fn enable_piezo_feedback(&self) -> Result<(), SetupFault>;

    /// Switch to open-loop amplitude control.
    async fn set_open_loop_mode(&self) -> Result<(), SetupFault>;

    /// Switch to closed-loop amplitude and phase control.
    async fn set_closed_loop_mode(&self) -> Result<(), SetupFault>;

    /// Write the amplitude setpoint directly.
    async fn set_amplitude(&self, amplitude: f64) -> Result<(), SetupFault>;

    /// Walk the amplitude setpoint toward `target` in increments of at most `step`.
    async fn ramp_amplitude(&self, target: f64, step: f64) -> Result<(), SetupFault>;

    /// Whether RF is currently on.
    async fn is_on(&self) -> Result<bool, SetupFault>;

    /// Current RF mode.
    async fn rf_mode(&self) -> Result<RfMode, SetupFault>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rf_mode_codes() {
        for mode in [
            RfMode::Selap,
            RfMode::Sela,
            RfMode::Sel,
            RfMode::SelRaw,
            RfMode::Pulse,
            RfMode::Chirp,
        ] {
            assert_eq!(RfMode::from_code(mode.code()), Some(mode));
        }
        assert!(RfMode::Selap.is_closed_loop());
        assert!(!RfMode::Sela.is_closed_loop());
        assert_eq!(RfMode::from_code(42), None);
    }
}
