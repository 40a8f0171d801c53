//! Simulated cavity driver
//!
//! Provides a software cavity for running the engine without hardware. The
//! simulator keeps its amplitude setpoint, readback and RF mode in control
//! points so group telemetry and the request listener see it exactly as they
//! would see a real cavity.
//!
//! # Test hooks
//!
//! - Call log for verifying operation order
//! - One-shot fault injection per operation
//! - Abort injection: raise an [`AbortToken`] while an operation runs, the way
//!   an operator pressing abort mid-calibration would
//! - Holds: park an operation until the test releases it
//! - Panic injection for undeclared failures
//! - Optional per-call latency
//!
//! # Example
//!
//! ```rust,ignore
//! let cavity = SimulatedCavity::new(&transport, "ACCL:L1B:0210:")?;
//! cavity.fail_on(DriverOp::Characterize, SetupFault::LoadedQ("out of range".into()));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::abort::AbortToken;
use crate::control_point::{ControlPoint, ControlPointExt, PvValue, Transport};
use crate::driver::{Amplifier, CavityDriver, RfMode, Tuner};
use crate::error::SetupFault;
use crate::naming;

/// Default amplifier drive limit used by the simulator.
pub const DEFAULT_DRIVE_MAX: f64 = 0.8;

/// Operations recorded and targeted by the simulator's hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DriverOp {
    AmplifierOn,
    AmplifierOff,
    AmplifierReset,
    AmplifierCalibrate,
    RfOff,
    RfOn,
    ResetInterlocks,
    MoveToResonance,
    Characterize,
    AcknowledgeProbeQ,
    EnablePiezoFeedback,
    SetOpenLoopMode,
    SetClosedLoopMode,
    SetAmplitude,
    RampAmplitude,
}

impl fmt::Display for DriverOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverOp::AmplifierOn => "amplifier_on",
            DriverOp::AmplifierOff => "amplifier_off",
            DriverOp::AmplifierReset => "amplifier_reset",
            DriverOp::AmplifierCalibrate => "amplifier_calibrate",
            DriverOp::RfOff => "rf_off",
            DriverOp::RfOn => "rf_on",
            DriverOp::ResetInterlocks => "reset_interlocks",
            DriverOp::MoveToResonance => "move_to_resonance",
            DriverOp::Characterize => "characterize",
            DriverOp::AcknowledgeProbeQ => "acknowledge_probe_q",
            DriverOp::EnablePiezoFeedback => "enable_piezo_feedback",
            DriverOp::SetOpenLoopMode => "set_open_loop_mode",
            DriverOp::SetClosedLoopMode => "set_closed_loop_mode",
            DriverOp::SetAmplitude => "set_amplitude",
            DriverOp::RampAmplitude => "ramp_amplitude",
        };
        f.write_str(s)
    }
}

/// Hook state shared by the cavity and its sub-devices.
#[derive(Default)]
struct Hooks {
    calls: Mutex<Vec<DriverOp>>,
    faults: Mutex<HashMap<DriverOp, SetupFault>>,
    aborts: Mutex<HashMap<DriverOp, AbortToken>>,
    holds: Mutex<HashMap<DriverOp, Arc<Notify>>>,
    panics: Mutex<Vec<DriverOp>>,
    latency_ms: AtomicU64,
}

impl Hooks {
    /// Record `op` and apply whatever hooks are armed for it.
    #[allow(clippy::panic)]
    async fn enter(&self, op: DriverOp) -> Result<(), SetupFault> {
        self.calls.lock().push(op);
        tracing::debug!(%op, "simulated driver call");

        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let hold = self.holds.lock().remove(&op);
        if let Some(gate) = hold {
            gate.notified().await;
        }

        let abort = self.aborts.lock().remove(&op);
        if let Some(token) = abort {
            token.request_abort()?;
        }

        let should_panic = {
            let mut panics = self.panics.lock();
            match panics.iter().position(|p| *p == op) {
                Some(idx) => {
                    panics.remove(idx);
                    true
                }
                None => false,
            }
        };
        if should_panic {
            panic!("simulated undeclared failure in {op}");
        }

        match self.faults.lock().remove(&op) {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

/// Simulated solid-state amplifier.
pub struct SimulatedAmplifier {
    hooks: Arc<Hooks>,
    on: AtomicBool,
    calibrated: AtomicBool,
    drive_max: f64,
}

impl SimulatedAmplifier {
    /// Whether the amplifier is enabled.
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    /// Whether a calibration has completed.
    pub fn is_calibrated(&self) -> bool {
        self.calibrated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Amplifier for SimulatedAmplifier {
    async fn turn_on(&self) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::AmplifierOn).await?;
        self.on.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn turn_off(&self) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::AmplifierOff).await?;
        self.on.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::AmplifierReset).await
    }

    async fn calibrate(&self, drive_max: f64) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::AmplifierCalibrate).await?;
        if !self.is_on() {
            return Err(SetupFault::AmplifierCalibration(format!(
                "amplifier off, cannot calibrate at drive {drive_max}"
            )));
        }
        self.calibrated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn drive_max(&self) -> f64 {
        self.drive_max
    }
}

/// Simulated stepper tuner.
pub struct SimulatedTuner {
    abort: AbortToken,
}

impl SimulatedTuner {
    /// The tuner's abort token.
    pub fn abort_token(&self) -> &AbortToken {
        &self.abort
    }
}

impl Tuner for SimulatedTuner {
    fn request_abort(&self) -> Result<(), SetupFault> {
        self.abort.request_abort()
    }

    fn clear_abort(&self) -> Result<(), SetupFault> {
        self.abort.clear()
    }
}

/// Simulated cavity.
pub struct SimulatedCavity {
    name: String,
    hooks: Arc<Hooks>,
    amplifier: SimulatedAmplifier,
    tuner: SimulatedTuner,
    setpoint: Arc<dyn ControlPoint>,
    readback: Arc<dyn ControlPoint>,
    rf_mode: Arc<dyn ControlPoint>,
    interlock: Arc<dyn ControlPoint>,
    rf_on: AtomicBool,
    characterized: AtomicBool,
}

impl fmt::Debug for SimulatedCavity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedCavity")
            .field("name", &self.name)
            .field("rf_on", &self.rf_on.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SimulatedCavity {
    /// Bind a simulated cavity to the control points under `prefix`.
    pub fn new(transport: &dyn Transport, prefix: &str) -> Result<Self, SetupFault> {
        let bind = |suffix: &str| -> Result<Arc<dyn ControlPoint>, SetupFault> {
            let point = transport.channel(&format!("{prefix}{suffix}"));
            point.connect()?;
            Ok(point)
        };
        let tuner_abort = transport.channel(&format!(
            "{}ABORT_REQ",
            naming::tuner_prefix(prefix)
        ));
        tuner_abort.connect()?;

        let hooks = Arc::new(Hooks::default());
        Ok(Self {
            name: prefix.trim_end_matches(':').to_string(),
            amplifier: SimulatedAmplifier {
                hooks: Arc::clone(&hooks),
                on: AtomicBool::new(false),
                calibrated: AtomicBool::new(false),
                drive_max: DEFAULT_DRIVE_MAX,
            },
            tuner: SimulatedTuner {
                abort: AbortToken::new(tuner_abort),
            },
            hooks,
            setpoint: bind(naming::AMPLITUDE_SETPOINT)?,
            readback: bind(naming::AMPLITUDE_READBACK)?,
            rf_mode: bind(naming::RF_MODE)?,
            interlock: bind(naming::INTERLOCK_RESET)?,
            rf_on: AtomicBool::new(false),
            characterized: AtomicBool::new(false),
        })
    }

    /// Set simulated latency for every call.
    pub fn with_latency(self, ms: u64) -> Self {
        self.hooks.latency_ms.store(ms, Ordering::Relaxed);
        self
    }

    /// Fail the next call to `op` with `fault`.
    pub fn fail_on(&self, op: DriverOp, fault: SetupFault) {
        self.hooks.faults.lock().insert(op, fault);
    }

    /// Raise `token` while the next call to `op` is in progress.
    pub fn abort_on(&self, op: DriverOp, token: AbortToken) {
        self.hooks.aborts.lock().insert(op, token);
    }

    /// Park the next call to `op` until the returned gate is notified.
    pub fn hold_on(&self, op: DriverOp) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.hooks.holds.lock().insert(op, Arc::clone(&gate));
        gate
    }

    /// Panic inside the next call to `op`.
    pub fn panic_on(&self, op: DriverOp) {
        self.hooks.panics.lock().push(op);
    }

    /// Operations called so far, in order.
    pub fn calls(&self) -> Vec<DriverOp> {
        self.hooks.calls.lock().clone()
    }

    /// Whether `op` has been called.
    pub fn was_called(&self, op: DriverOp) -> bool {
        self.hooks.calls.lock().contains(&op)
    }

    /// Clear the call log.
    pub fn clear_calls(&self) {
        self.hooks.calls.lock().clear();
    }

    /// Simulated amplifier.
    pub fn simulated_amplifier(&self) -> &SimulatedAmplifier {
        &self.amplifier
    }

    /// Simulated tuner.
    pub fn simulated_tuner(&self) -> &SimulatedTuner {
        &self.tuner
    }

    /// Whether a characterization has completed.
    pub fn is_characterized(&self) -> bool {
        self.characterized.load(Ordering::SeqCst)
    }

    /// Put the cavity in a given RF state, bypassing hooks.
    pub fn force_rf(&self, on: bool, mode: RfMode, amplitude: f64) -> Result<(), SetupFault> {
        self.rf_on.store(on, Ordering::SeqCst);
        self.rf_mode.put(PvValue::Int(mode.code()))?;
        self.setpoint.put(PvValue::Float(amplitude))?;
        self.sync_readback()
    }

    fn current_setpoint(&self) -> Result<f64, SetupFault> {
        Ok(self.setpoint.get()?.as_f64().unwrap_or(0.0))
    }

    fn sync_readback(&self) -> Result<(), SetupFault> {
        let amplitude = if self.rf_on.load(Ordering::SeqCst) {
            self.current_setpoint()?
        } else {
            0.0
        };
        self.readback.put(PvValue::Float(amplitude))
    }

    fn write_setpoint(&self, amplitude: f64) -> Result<(), SetupFault> {
        self.setpoint.put(PvValue::Float(amplitude))?;
        self.sync_readback()
    }
}

#[async_trait]
impl CavityDriver for SimulatedCavity {
    fn amplifier(&self) -> &dyn Amplifier {
        &self.amplifier
    }

    fn tuner(&self) -> &dyn Tuner {
        &self.tuner
    }

    async fn turn_rf_off(&self) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::RfOff).await?;
        self.rf_on.store(false, Ordering::SeqCst);
        self.sync_readback()
    }

    async fn turn_rf_on(&self) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::RfOn).await?;
        if !self.amplifier.is_on() {
            return Err(SetupFault::AmplifierHardware(format!(
                "{} amplifier off, cannot enable RF",
                self.name
            )));
        }
        self.rf_on.store(true, Ordering::SeqCst);
        self.sync_readback()
    }

    async fn reset_interlocks(&self) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::ResetInterlocks).await?;
        self.interlock.put(PvValue::Int(1))
    }

    async fn move_to_resonance(&self, _closed_loop: bool) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::MoveToResonance).await?;
        // The stepper checks its own flag at the end of every move
        self.tuner
            .abort
            .check_abort(&format!("{} stepper", self.name))
    }

    async fn characterize(&self) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::Characterize).await?;
        self.characterized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn acknowledge_probe_q(&self) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::AcknowledgeProbeQ).await
    }

    async fn enable_piezo_feedback(&self) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::EnablePiezoFeedback).await
    }

    async fn set_open_loop_mode(&self) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::SetOpenLoopMode).await?;
        self.rf_mode.put(PvValue::Int(RfMode::Sela.code()))
    }

    async fn set_closed_loop_mode(&self) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::SetClosedLoopMode).await?;
        self.rf_mode.put(PvValue::Int(RfMode::Selap.code()))
    }

    async fn set_amplitude(&self, amplitude: f64) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::SetAmplitude).await?;
        self.write_setpoint(amplitude)
    }

    async fn ramp_amplitude(&self, target: f64, step: f64) -> Result<(), SetupFault> {
        self.hooks.enter(DriverOp::RampAmplitude).await?;
        let step = step.abs();
        if step == 0.0 {
            return self.write_setpoint(target);
        }
        let mut current = self.current_setpoint()?;
        while (target - current).abs() > step {
            current += step.copysign(target - current);
            self.write_setpoint(current)?;
            tokio::task::yield_now().await;
        }
        self.write_setpoint(target)
    }

    async fn is_on(&self) -> Result<bool, SetupFault> {
        Ok(self.rf_on.load(Ordering::SeqCst))
    }

    async fn rf_mode(&self) -> Result<RfMode, SetupFault> {
        let code = self
            .rf_mode
            .get_i64()
            .map_err(|_| SetupFault::HardwareMode(format!("{} RF mode unreadable", self.name)))?;
        RfMode::from_code(code)
            .ok_or_else(|| SetupFault::HardwareMode(format!("{} unknown RF mode {code}", self.name)))
    }
}
