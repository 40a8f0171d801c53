//! Per-cavity setup state machine.
//!
//! A [`SetupCavity`] owns a cavity's control-point bindings, its abort token,
//! its status reporter and its driver, and executes one setup or shutdown
//! sequence at a time.
//!
//! # Lifecycle
//!
//! ```text
//! READY/ERROR --begin()--> RUNNING --execute()--> READY   (success)
//!                                             \--> ERROR   (declared fault or abort)
//! ```
//!
//! `begin` is the only way into RUNNING and refuses a device that is already
//! RUNNING; the caller treats that as "already running" rather than queueing.
//!
//! # Setup stages
//!
//! | Stage                 | Gate                  | Progress          |
//! |-----------------------|-----------------------|-------------------|
//! | Amplifier on          | always                | 10                |
//! | Interlock reset       | always                | 15                |
//! | Amplifier calibration | `calibrate_amplifier` | 20                |
//! | Auto-tune             | `auto_tune`           | 50                |
//! | Characterization      | `characterize`        | 60, 70            |
//! | RF ramp               | `ramp_rf`             | 80, 85, 90, 95    |
//!
//! Abort checkpoints sit after the calibration, auto-tune and characterization
//! slots and inside the ramp once RF is on. A disabled stage is skipped without
//! touching progress or the message. A zero target amplitude replaces the whole
//! pipeline with the shutdown path.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::abort::AbortToken;
use crate::control_point::{ControlPoint, ControlPointExt, PvValue, Transport};
use crate::driver::CavityDriver;
use crate::error::{AppResult, SetupFault};
use crate::naming;
use crate::status::{SetupStatus, StatusReporter};

/// Which optional stages a setup run executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlags {
    /// Run the amplifier calibration
    pub calibrate_amplifier: bool,
    /// Tune the mechanical resonator to resonance
    pub auto_tune: bool,
    /// Run cavity characterization
    pub characterize: bool,
    /// Ramp RF to the target amplitude
    pub ramp_rf: bool,
}

impl Default for StageFlags {
    fn default() -> Self {
        Self::all()
    }
}

impl StageFlags {
    /// Every optional stage enabled.
    pub fn all() -> Self {
        Self {
            calibrate_amplifier: true,
            auto_tune: true,
            characterize: true,
            ramp_rf: true,
        }
    }

    /// Every optional stage disabled.
    pub fn none() -> Self {
        Self {
            calibrate_amplifier: false,
            auto_tune: false,
            characterize: false,
            ramp_rf: false,
        }
    }
}

/// One run's parameters, built fresh for every launch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RunKind {
    /// Staged setup toward `amplitude`
    Setup {
        /// Stage gates
        flags: StageFlags,
        /// Target amplitude in MV
        amplitude: f64,
    },
    /// RF off, then amplifier off
    Shutdown,
}

/// Cavity identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CavityId {
    /// Linac index used in control-point names
    pub linac_index: u8,
    /// Cryomodule name, e.g. "02" or "H1"
    pub cryomodule: String,
    /// Cavity number, 1-8
    pub number: u8,
}

impl CavityId {
    /// Control-point prefix for this cavity.
    pub fn prefix(&self) -> String {
        naming::cavity_prefix(self.linac_index, &self.cryomodule, self.number)
    }
}

impl fmt::Display for CavityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CM{} Cavity {}", self.cryomodule, self.number)
    }
}

/// Pipeline constants taken from configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineSettings {
    /// Amplitude increment for the ramp (MV)
    pub ramp_step: f64,
    /// Setpoint cap before enabling RF from off or open loop (MV)
    pub initial_amplitude_cap: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            ramp_step: 0.1,
            initial_amplitude_cap: 5.0,
        }
    }
}

/// Request and RF control points owned by a cavity.
pub struct CavityBindings {
    /// Start request
    pub start_request: Arc<dyn ControlPoint>,
    /// Shutoff request
    pub off_request: Arc<dyn ControlPoint>,
    /// Amplifier calibration enable request
    pub calibration_request: Arc<dyn ControlPoint>,
    /// Auto-tune enable request
    pub tune_request: Arc<dyn ControlPoint>,
    /// Characterization enable request
    pub characterization_request: Arc<dyn ControlPoint>,
    /// RF ramp enable request
    pub ramp_request: Arc<dyn ControlPoint>,
    /// Amplitude setpoint
    pub setpoint: Arc<dyn ControlPoint>,
    /// Amplitude readback
    pub readback: Arc<dyn ControlPoint>,
    /// Amplitude maximum
    pub amplitude_max: Arc<dyn ControlPoint>,
    /// RF mode control
    pub rf_mode: Arc<dyn ControlPoint>,
    /// Interlock reset control
    pub interlock: Arc<dyn ControlPoint>,
}

/// The staged setup machine for one cavity.
pub struct SetupCavity {
    id: CavityId,
    name: String,
    bindings: CavityBindings,
    abort: AbortToken,
    reporter: StatusReporter,
    driver: Arc<dyn CavityDriver>,
    settings: PipelineSettings,
}

impl fmt::Debug for SetupCavity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupCavity")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SetupCavity {
    /// Construct and connect every control point the cavity uses.
    pub fn bind(
        id: CavityId,
        transport: &dyn Transport,
        driver: Arc<dyn CavityDriver>,
        settings: PipelineSettings,
    ) -> Result<Self, SetupFault> {
        let prefix = id.prefix();
        let bind = |suffix: &str| -> Result<Arc<dyn ControlPoint>, SetupFault> {
            let point = transport.channel(&format!("{prefix}{suffix}"));
            point.connect()?;
            Ok(point)
        };

        let bindings = CavityBindings {
            start_request: bind(naming::SETUP_START)?,
            off_request: bind(naming::OFF_START)?,
            calibration_request: bind(naming::CALIBRATION_REQUEST)?,
            tune_request: bind(naming::TUNE_REQUEST)?,
            characterization_request: bind(naming::CHARACTERIZATION_REQUEST)?,
            ramp_request: bind(naming::RAMP_REQUEST)?,
            setpoint: bind(naming::AMPLITUDE_SETPOINT)?,
            readback: bind(naming::AMPLITUDE_READBACK)?,
            amplitude_max: bind(naming::AMPLITUDE_MAX)?,
            rf_mode: bind(naming::RF_MODE)?,
            interlock: bind(naming::INTERLOCK_RESET)?,
        };

        let name = id.to_string();
        let reporter = StatusReporter::new(
            name.clone(),
            bind(naming::STATUS)?,
            bind(naming::PROGRESS)?,
            bind(naming::MESSAGE)?,
        );
        let abort = AbortToken::new(bind(naming::SETUP_STOP)?);

        Ok(Self {
            id,
            name,
            bindings,
            abort,
            reporter,
            driver,
            settings,
        })
    }

    /// Display name, e.g. "CM02 Cavity 3".
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity.
    pub fn id(&self) -> &CavityId {
        &self.id
    }

    /// Control-point bindings.
    pub fn bindings(&self) -> &CavityBindings {
        &self.bindings
    }

    /// Status reporter; subscribe here for (progress, status, message) updates.
    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    /// The cavity-level abort token.
    pub fn abort_token(&self) -> &AbortToken {
        &self.abort
    }

    /// The driver.
    pub fn driver(&self) -> &Arc<dyn CavityDriver> {
        &self.driver
    }

    /// Current lifecycle status.
    pub fn status(&self) -> Result<SetupStatus, SetupFault> {
        self.reporter.status()
    }

    /// Current amplitude readback (MV).
    pub fn readback(&self) -> AppResult<f64> {
        self.bindings.readback.get_f64()
    }

    /// Current amplitude setpoint (MV).
    pub fn setpoint(&self) -> AppResult<f64> {
        self.bindings.setpoint.get_f64()
    }

    /// Amplitude ceiling (MV).
    pub fn amplitude_max(&self) -> AppResult<f64> {
        self.bindings.amplitude_max.get_f64()
    }

    /// Stage-enable requests as currently published.
    pub fn requested_flags(&self) -> AppResult<StageFlags> {
        Ok(StageFlags {
            calibrate_amplifier: self.bindings.calibration_request.get_bool()?,
            auto_tune: self.bindings.tune_request.get_bool()?,
            characterize: self.bindings.characterization_request.get_bool()?,
            ramp_rf: self.bindings.ramp_request.get_bool()?,
        })
    }

    /// Publish stage-enable requests.
    pub fn set_requested_flags(&self, flags: StageFlags) -> Result<(), SetupFault> {
        self.bindings
            .calibration_request
            .put(PvValue::Bool(flags.calibrate_amplifier))?;
        self.bindings.tune_request.put(PvValue::Bool(flags.auto_tune))?;
        self.bindings
            .characterization_request
            .put(PvValue::Bool(flags.characterize))?;
        self.bindings.ramp_request.put(PvValue::Bool(flags.ramp_rf))
    }

    /// Ask whoever listens on the start request point to run setup.
    pub fn trigger_setup(&self) -> Result<(), SetupFault> {
        self.bindings.start_request.put(PvValue::Bool(true))
    }

    /// Ask whoever listens on the shutoff request point to run shutdown.
    pub fn trigger_shut_down(&self) -> Result<(), SetupFault> {
        self.bindings.off_request.put(PvValue::Bool(true))
    }

    /// Raise the cavity and tuner abort flags and report the request.
    pub fn request_abort(&self) -> Result<(), SetupFault> {
        if self.reporter.is_running()? {
            self.reporter
                .set_message(format!("Requesting stop for {}", self.name))?;
        } else {
            self.reporter.set_message(format!(
                "{} script not running, no abort needed",
                self.name
            ))?;
        }
        self.abort.request_abort()?;
        self.driver.tuner().request_abort()
    }

    /// Enter RUNNING.
    ///
    /// Returns `Ok(false)` without touching progress when a sequence is already
    /// in flight. An abort left raised while the device was idle is dropped
    /// here so it cannot cancel the new run. A failure after RUNNING is
    /// published leaves the device in ERROR and is returned.
    pub fn begin(&self) -> Result<bool, SetupFault> {
        if self.reporter.is_running()? {
            self.reporter
                .set_message(format!("{} script already running", self.name))?;
            return Ok(false);
        }

        self.reporter.set_status(SetupStatus::Running)?;
        let prepared = self
            .abort
            .clear()
            .and_then(|_| self.driver.tuner().clear_abort())
            .and_then(|_| self.reporter.set_progress(0.0))
            .and_then(|_| self.reporter.set_message(format!("Starting {}", self.name)));

        // RUNNING is already published; no task will run to leave it
        if let Err(fault) = prepared {
            tracing::warn!(device = %self.name, kind = fault.kind(), error = %fault, "setup could not start");
            self.enter_error(fault.to_string());
            return Err(fault);
        }
        Ok(true)
    }

    /// Run a sequence that has been admitted by [`begin`](Self::begin) and
    /// publish its outcome.
    pub async fn execute(&self, kind: RunKind) -> Result<(), SetupFault> {
        let result = self.run(kind).await;
        self.finish(&result);
        result
    }

    /// The sequence itself, without outcome handling.
    pub async fn run(&self, kind: RunKind) -> Result<(), SetupFault> {
        match kind {
            RunKind::Setup { amplitude, .. } if amplitude == 0.0 => self.run_shutdown().await,
            RunKind::Setup { flags, amplitude } => self.run_setup(flags, amplitude).await,
            RunKind::Shutdown => self.run_shutdown().await,
        }
    }

    /// Publish the outcome of a run.
    ///
    /// Success ends at progress 100 and READY. A fault or abort ends in ERROR
    /// with both abort flags lowered; progress stays where the run stopped.
    /// If success cannot be published the device goes to ERROR instead.
    pub fn finish(&self, result: &Result<(), SetupFault>) {
        match result {
            Ok(()) => {
                let published = self
                    .reporter
                    .set_progress(100.0)
                    .and_then(|_| self.reporter.set_status(SetupStatus::Ready));
                if let Err(e) = published {
                    tracing::warn!(device = %self.name, error = %e, "failed to publish setup completion");
                    self.enter_error(e.to_string());
                }
            }
            Err(fault) => {
                let message = if fault.is_abort() {
                    tracing::info!(device = %self.name, "setup aborted by operator");
                    format!("{} successfully aborted", self.name)
                } else {
                    tracing::warn!(device = %self.name, kind = fault.kind(), error = %fault, "setup failed");
                    fault.to_string()
                };
                self.enter_error(message);
            }
        }
    }

    /// Move to ERROR after an undeclared failure.
    pub fn fail_unexpected(&self, detail: &str) {
        tracing::error!(device = %self.name, detail, "undeclared failure during setup");
        self.enter_error(format!("{} unexpected failure: {detail}", self.name));
    }

    /// Every step is attempted even when an earlier one fails.
    fn enter_error(&self, message: String) {
        let steps = [
            ("status", self.reporter.set_status(SetupStatus::Error)),
            ("abort flag", self.abort.clear()),
            ("tuner abort flag", self.driver.tuner().clear_abort()),
            ("message", self.reporter.set_message(message)),
        ];
        for (step, result) in steps {
            if let Err(e) = result {
                tracing::error!(device = %self.name, step, error = %e, "failed to publish setup outcome");
            }
        }
    }

    fn checkpoint(&self) -> Result<(), SetupFault> {
        self.abort.check_abort(&self.name)
    }

    /// Shutdown path: RF off, then amplifier off.
    pub async fn run_shutdown(&self) -> Result<(), SetupFault> {
        self.reporter
            .set_message(format!("Turning {} RF off", self.name))?;
        self.driver.turn_rf_off().await?;
        self.reporter.set_progress(50.0)?;

        self.reporter
            .set_message(format!("Turning {} SSA off", self.name))?;
        self.driver.amplifier().turn_off().await
    }

    /// Staged setup toward `amplitude`.
    pub async fn run_setup(&self, flags: StageFlags, amplitude: f64) -> Result<(), SetupFault> {
        let name = &self.name;
        let amplifier = self.driver.amplifier();

        self.reporter.set_message(format!(
            "Resetting and turning on {name} SSA if not on already"
        ))?;
        amplifier.reset().await?;
        amplifier.turn_on().await?;
        self.reporter.set_progress(10.0)?;

        self.reporter
            .set_message(format!("Resetting {name} interlocks"))?;
        self.driver.reset_interlocks().await?;
        self.reporter.set_progress(15.0)?;

        if flags.calibrate_amplifier {
            self.reporter
                .set_message(format!("Running {name} SSA Calibration"))?;
            self.driver.turn_rf_off().await?;
            self.reporter.set_progress(20.0)?;
            amplifier.calibrate(amplifier.drive_max()).await?;
            self.reporter.set_message(format!("{name} SSA Calibrated"))?;
        }
        self.checkpoint()?;

        if flags.auto_tune {
            self.reporter
                .set_message(format!("Tuning {name} to Resonance"))?;
            self.driver.move_to_resonance(false).await?;
            self.reporter.set_progress(50.0)?;
            self.reporter
                .set_message(format!("{name} Tuned to Resonance"))?;
        }
        self.checkpoint()?;

        if flags.characterize {
            self.reporter
                .set_message(format!("Running {name} Cavity Characterization"))?;
            self.driver.characterize().await?;
            self.reporter.set_progress(60.0)?;
            self.driver.acknowledge_probe_q().await?;
            self.reporter.set_progress(70.0)?;
            self.reporter.set_message(format!("{name} Characterized"))?;
        }
        self.checkpoint()?;

        if flags.ramp_rf {
            self.ramp(amplitude).await?;
        }

        Ok(())
    }

    async fn ramp(&self, amplitude: f64) -> Result<(), SetupFault> {
        let name = &self.name;
        self.reporter
            .set_message(format!("Ramping {name} to {amplitude}"))?;
        self.driver.enable_piezo_feedback().await?;
        self.reporter.set_progress(80.0)?;

        let closed_loop_on =
            self.driver.is_on().await? && self.driver.rf_mode().await?.is_closed_loop();
        if !closed_loop_on {
            self.driver
                .set_amplitude(amplitude.min(self.settings.initial_amplitude_cap))
                .await?;
        }

        self.driver.turn_rf_on().await?;
        self.reporter.set_progress(85.0)?;

        self.checkpoint()?;

        self.driver.set_open_loop_mode().await?;
        self.driver
            .ramp_amplitude(amplitude, self.settings.ramp_step)
            .await?;
        self.reporter.set_progress(90.0)?;

        self.reporter
            .set_message(format!("Centering {name} piezo"))?;
        self.driver.move_to_resonance(true).await?;
        self.reporter.set_progress(95.0)?;

        self.driver.set_closed_loop_mode().await?;
        self.reporter
            .set_message(format!("{name} Ramped Up to {amplitude} MV"))
    }
}
