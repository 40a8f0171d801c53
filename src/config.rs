//! Configuration for the setup engine using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults ([`SetupConfig::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `SRF_SETUP_`
//!
//! Nested keys use a double underscore, so `launch_stagger_ms` is overridden
//! with `SRF_SETUP_LAUNCH_STAGGER_MS=250`.
//!
//! # Example
//!
//! ```no_run
//! use srf_setup::config::SetupConfig;
//!
//! let config = SetupConfig::load_from("config/srf_setup.toml")?;
//! println!("Ramp step: {} MV", config.ramp_step);
//! # Ok::<(), srf_setup::config::ConfigError>(())
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::{deployed_linacs, LinacLayout};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SRF_SETUP_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Number of setup runs that may execute at once
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Delay between consecutive launches in a group fan-out
    #[serde(default = "default_launch_stagger_ms")]
    pub launch_stagger_ms: u64,
    /// Amplitude increment used when walking a cavity to its target (MV)
    #[serde(default = "default_ramp_step")]
    pub ramp_step: f64,
    /// Setpoint cap applied before turning RF on from an off or open-loop state (MV)
    #[serde(default = "default_initial_amplitude_cap")]
    pub initial_amplitude_cap: f64,
    /// Tolerance used when comparing amplitude sums
    #[serde(default = "default_amplitude_tolerance")]
    pub amplitude_tolerance: f64,
    /// Ceiling seeded into each cavity's `ADES_MAX` point at startup (MV)
    #[serde(default = "default_cavity_amplitude_max")]
    pub cavity_amplitude_max: f64,
    /// Machine layout; defaults to the deployed linac
    #[serde(default = "deployed_linacs")]
    pub linacs: Vec<LinacLayout>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_threads() -> usize {
    16
}

fn default_launch_stagger_ms() -> u64 {
    100
}

fn default_ramp_step() -> f64 {
    0.1
}

fn default_initial_amplitude_cap() -> f64 {
    5.0
}

fn default_amplitude_tolerance() -> f64 {
    1e-6
}

fn default_cavity_amplitude_max() -> f64 {
    21.0
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            worker_threads: default_worker_threads(),
            launch_stagger_ms: default_launch_stagger_ms(),
            ramp_step: default_ramp_step(),
            initial_amplitude_cap: default_initial_amplitude_cap(),
            amplitude_tolerance: default_amplitude_tolerance(),
            cavity_amplitude_max: default_cavity_amplitude_max(),
            linacs: deployed_linacs(),
        }
    }
}

impl SetupConfig {
    /// Load defaults overlaid with environment variables only.
    pub fn load() -> Result<Self, ConfigError> {
        Self::extract(Self::base_figment())
    }

    /// Load defaults, then the TOML file at `path`, then environment variables.
    ///
    /// A missing file is not an error; Figment treats it as an empty layer.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(SetupConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    fn base_figment() -> Figment {
        Figment::from(Serialized::defaults(SetupConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Inter-launch delay as a `Duration`.
    pub fn launch_stagger(&self) -> Duration {
        Duration::from_millis(self.launch_stagger_ms)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - The worker pool has at least one slot
    /// - Ramp step is a positive finite number
    /// - Amplitude cap, tolerance and ceiling are non-negative
    /// - Cryomodule names are unique across the machine
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.worker_threads == 0 {
            return Err(ConfigError::ValidationError(
                "worker_threads must be at least 1".to_string(),
            ));
        }

        if !self.ramp_step.is_finite() || self.ramp_step <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid ramp_step {}. Must be greater than zero",
                self.ramp_step
            )));
        }

        for (field, value) in [
            ("initial_amplitude_cap", self.initial_amplitude_cap),
            ("amplitude_tolerance", self.amplitude_tolerance),
            ("cavity_amplitude_max", self.cavity_amplitude_max),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid {field} {value}. Must be non-negative"
                )));
            }
        }

        let mut names = HashSet::new();
        for linac in &self.linacs {
            for cm in &linac.cryomodules {
                if !names.insert(cm.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "Duplicate cryomodule '{}' in linac '{}'",
                        cm, linac.name
                    )));
                }
            }
        }

        Ok(())
    }
}
