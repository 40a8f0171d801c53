//! Error types for the setup engine.
//!
//! Two layers are defined here using `thiserror`:
//!
//! - **`SetupFault`**: the declared fault kinds a device driver (or the engine
//!   itself) can raise while a setup or shutdown pipeline is running. Every
//!   variant is terminal to the current run; nothing here is retried. Faults are
//!   caught exactly once, at the pipeline boundary in [`crate::cavity`], which
//!   moves the device to ERROR and publishes the fault's message.
//! - **`SetupError`**: the crate-level error for everything outside a running
//!   pipeline: configuration problems, unknown topology members, control-point
//!   failures while binding, and wrapped faults.
//!
//! `AbortedByOperator` is a fault like any other from the pipeline's point of
//! view, but it is reported to the operator as a successful cancellation rather
//! than a failure. Use [`SetupFault::is_abort`] to tell them apart.

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, SetupError>;

/// Declared, run-terminal faults.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SetupFault {
    #[error("Stepper fault: {0}")]
    Stepper(String),

    #[error("Detune fault: {0}")]
    Detune(String),

    #[error("Amplifier calibration fault: {0}")]
    AmplifierCalibration(String),

    #[error("Control point {0} unavailable")]
    ControlPointUnavailable(String),

    #[error("Quench fault: {0}")]
    Quench(String),

    #[error("Loaded Q calibration fault: {0}")]
    LoadedQ(String),

    #[error("Scale factor calibration fault: {0}")]
    ScaleFactor(String),

    #[error("Amplifier hardware fault: {0}")]
    AmplifierHardware(String),

    #[error("{0}")]
    AbortedByOperator(String),

    #[error("Hardware mode fault: {0}")]
    HardwareMode(String),

    #[error("Cavity fault: {0}")]
    Cavity(String),
}

impl SetupFault {
    /// True if this fault is an operator-requested cancellation.
    pub fn is_abort(&self) -> bool {
        matches!(self, SetupFault::AbortedByOperator(_))
    }

    /// Short machine-readable name of the fault kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            SetupFault::Stepper(_) => "stepper",
            SetupFault::Detune(_) => "detune",
            SetupFault::AmplifierCalibration(_) => "amplifier_calibration",
            SetupFault::ControlPointUnavailable(_) => "control_point_unavailable",
            SetupFault::Quench(_) => "quench",
            SetupFault::LoadedQ(_) => "loaded_q",
            SetupFault::ScaleFactor(_) => "scale_factor",
            SetupFault::AmplifierHardware(_) => "amplifier_hardware",
            SetupFault::AbortedByOperator(_) => "aborted",
            SetupFault::HardwareMode(_) => "hardware_mode",
            SetupFault::Cavity(_) => "cavity",
        }
    }
}

/// Crate-level error type.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fault(#[from] SetupFault),

    #[error("Control point {name} holds {found}, expected {expected}")]
    ControlPointType {
        name: String,
        expected: &'static str,
        found: String,
    },

    #[error("Unknown linac '{0}'")]
    UnknownLinac(String),

    #[error("Unknown cryomodule '{0}'")]
    UnknownCryomodule(String),

    #[error("Cavity {cavity} not found in cryomodule {cryomodule}")]
    UnknownCavity { cryomodule: String, cavity: u8 },
}
