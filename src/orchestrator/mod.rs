//! Device and group orchestration.
//!
//! The machine is a fixed tree: cavity → cryomodule → linac → machine. Leaves
//! are [`DeviceOrchestrator`]s, every inner node is a [`GroupOrchestrator`]
//! over the level below. All levels implement [`SetupNode`], so a group is
//! written once and composed three times.
//!
//! Launching is fire-and-forget: a start returns once every run it covers has
//! been queued on the worker pool, not when the runs complete. Use
//! [`SetupNode::join`] to wait for completion.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cavity::StageFlags;
use crate::control_point::ControlPoint;
use crate::error::AppResult;

pub mod device;
pub mod group;

pub use device::DeviceOrchestrator;
pub use group::{Cryomodule, GroupOrchestrator, Linac, Machine};

/// What a launch did for each device it reached.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchReport {
    /// Devices whose run was queued
    pub scheduled: Vec<String>,
    /// Devices already running, left untouched
    pub already_running: Vec<String>,
    /// Devices that could not be launched, with the reason
    pub failed: Vec<(String, String)>,
}

impl LaunchReport {
    /// Report for a single scheduled device.
    pub fn scheduled(device: impl Into<String>) -> Self {
        Self {
            scheduled: vec![device.into()],
            ..Self::default()
        }
    }

    /// Report for a single device that was already running.
    pub fn already_running(device: impl Into<String>) -> Self {
        Self {
            already_running: vec![device.into()],
            ..Self::default()
        }
    }

    /// Report for a single device that failed to launch.
    pub fn failed(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            failed: vec![(device.into(), reason.into())],
            ..Self::default()
        }
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: LaunchReport) {
        self.scheduled.extend(other.scheduled);
        self.already_running.extend(other.already_running);
        self.failed.extend(other.failed);
    }

    /// Total devices reached.
    pub fn len(&self) -> usize {
        self.scheduled.len() + self.already_running.len() + self.failed.len()
    }

    /// True if no device was reached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Common surface of every level of the orchestration tree.
#[async_trait]
pub trait SetupNode: Send + Sync {
    /// Display name.
    fn name(&self) -> &str;

    /// Launch setup toward `amplitude` with the given stage gates.
    async fn start(&self, flags: StageFlags, amplitude: f64) -> AppResult<LaunchReport>;

    /// Launch the shutdown path.
    async fn turn_off(&self) -> AppResult<LaunchReport>;

    /// Raise the abort flags of every device under this node.
    async fn kill(&self) -> AppResult<()>;

    /// Wait until every run launched under this node has ended.
    async fn join(&self);

    /// Sum of current amplitude setpoints (MV).
    fn setpoint(&self) -> AppResult<f64>;

    /// Sum of current amplitude readbacks (MV).
    fn readback(&self) -> AppResult<f64>;

    /// Amplitude ceiling (MV).
    fn amplitude_max(&self) -> AppResult<f64>;

    /// Leaf readback points under this node, for change subscriptions.
    fn readback_points(&self) -> Vec<Arc<dyn ControlPoint>>;
}
