//! Control-point naming convention.
//!
//! These names are shared with deployed hardware-facing software and must stay
//! bit-exact. A cavity's points live under `ACCL:L{linac}B:{cm}{cavity}0:`, its
//! auto-setup points under the `AUTO:` namespace below that.

/// Auto-setup start request.
pub const SETUP_START: &str = "AUTO:SETUPSTRT";
/// Auto-setup stop request; backs the abort token.
pub const SETUP_STOP: &str = "AUTO:SETUPSTOP";
/// Shutoff request.
pub const OFF_START: &str = "AUTO:OFFSTRT";
/// Amplifier calibration enable request.
pub const CALIBRATION_REQUEST: &str = "AUTO:SETUP_SSAREQ";
/// Auto-tune enable request.
pub const TUNE_REQUEST: &str = "AUTO:SETUP_TUNEREQ";
/// Characterization enable request.
pub const CHARACTERIZATION_REQUEST: &str = "AUTO:SETUP_CHARREQ";
/// RF ramp enable request.
pub const RAMP_REQUEST: &str = "AUTO:SETUP_RAMPREQ";
/// Numeric status code (0=READY, 1=RUNNING, 2=ERROR).
pub const STATUS: &str = "AUTO:STATUS";
/// Numeric progress in [0, 100].
pub const PROGRESS: &str = "AUTO:PROG";
/// Free-text status message.
pub const MESSAGE: &str = "AUTO:MSG";

/// Amplitude setpoint.
pub const AMPLITUDE_SETPOINT: &str = "ADES";
/// Amplitude readback.
pub const AMPLITUDE_READBACK: &str = "AACTMEAN";
/// Amplitude maximum.
pub const AMPLITUDE_MAX: &str = "ADES_MAX";
/// RF mode control.
pub const RF_MODE: &str = "RFMODECTRL";
/// Interlock reset.
pub const INTERLOCK_RESET: &str = "INTLK_RESET_ALL";

/// Group amplitude target.
pub const GROUP_TARGET: &str = "AUTO:ADES";
/// Group readback sum.
pub const GROUP_READBACK: &str = "AACTMEANSUM";

/// Machine-wide readback sum.
pub const MACHINE_READBACK: &str = "ACCL:SYS0:1:AACTMEANSUM";
/// Machine-wide prefix for group points.
pub const MACHINE_PREFIX: &str = "ACCL:SYS0:1:";

/// Prefix for a cavity's control points.
pub fn cavity_prefix(linac_index: u8, cryomodule: &str, cavity: u8) -> String {
    format!("ACCL:L{linac_index}B:{cryomodule}{cavity}0:")
}

/// Prefix for a cryomodule's control points.
pub fn cryomodule_prefix(linac_index: u8, cryomodule: &str) -> String {
    format!("ACCL:L{linac_index}B:{cryomodule}00:")
}

/// Prefix for a linac section's control points.
///
/// The harmonic linearizer shares L1B's index and is namespaced with `HL_`.
pub fn linac_prefix(linac_index: u8, harmonic_linearizer: bool) -> String {
    if harmonic_linearizer {
        format!("ACCL:L{linac_index}B:1:HL_")
    } else {
        format!("ACCL:L{linac_index}B:1:")
    }
}

/// Mechanical tuner (stepper) sub-device prefix under a cavity prefix.
pub fn tuner_prefix(cavity_prefix: &str) -> String {
    format!("{cavity_prefix}STEP:")
}
