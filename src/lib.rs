//! Setup orchestration engine for superconducting RF cavities.
//!
//! The engine drives each cavity through a staged startup (amplifier on,
//! interlock reset, amplifier calibration, auto-tune, characterization, RF
//! ramp) with cooperative, checkpointed abort, and fans commands out across the
//! machine hierarchy: cavity → cryomodule → linac → machine.
//!
//! # Layout
//!
//! - [`control_point`]: named, subscribable command/telemetry variables
//! - [`abort`], [`status`]: per-device abort flag and status reporting
//! - [`driver`]: hardware interface consumed by the pipeline, plus a simulator
//! - [`cavity`]: the per-cavity state machine
//! - [`orchestrator`]: device and group orchestration
//! - [`allocator`]: target amplitude distribution
//! - [`topology`]: machine layout and tree construction
//! - [`listener`]: control-point request listeners
//!
//! # Example
//!
//! ```no_run
//! use srf_setup::cavity::StageFlags;
//! use srf_setup::config::SetupConfig;
//! use srf_setup::control_point::LocalTransport;
//! use srf_setup::orchestrator::SetupNode;
//! use srf_setup::topology::Topology;
//!
//! # async fn run() -> srf_setup::error::AppResult<()> {
//! let config = SetupConfig::load()?;
//! let transport = LocalTransport::new();
//! let topology = Topology::simulated(&config, &transport)?;
//!
//! let cm = topology.cryomodule("02")?;
//! cm.start(StageFlags::all(), 96.0).await?;
//! cm.join().await;
//! # Ok(())
//! # }
//! ```

pub mod abort;
pub mod allocator;
pub mod cavity;
pub mod config;
pub mod control_point;
pub mod driver;
pub mod error;
pub mod listener;
pub mod logging;
pub mod naming;
pub mod orchestrator;
pub mod pool;
pub mod status;
pub mod topology;

pub use error::{AppResult, SetupError, SetupFault};
