//! Fan-out over a level of the machine tree.
//!
//! A [`GroupOrchestrator`] splits its target amplitude across its children with
//! the [`AmplitudeAllocator`], then launches each child in order with a fixed
//! delay between launches so the driver layer is not hit by a whole linac at
//! once. Turn-off fans out the same way; kill reaches every child at once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use crate::allocator::{AmplitudeAllocator, ChildAmplitude};
use crate::cavity::StageFlags;
use crate::control_point::{ControlPoint, ControlPointExt, PvValue, Transport};
use crate::error::{AppResult, SetupError};
use crate::naming;
use crate::orchestrator::{DeviceOrchestrator, LaunchReport, SetupNode};

/// Eight cavities.
pub type Cryomodule = GroupOrchestrator<DeviceOrchestrator>;
/// Cryomodules of one linac section.
pub type Linac = GroupOrchestrator<Cryomodule>;
/// Every linac section.
pub type Machine = GroupOrchestrator<Linac>;

/// Inner node of the orchestration tree.
pub struct GroupOrchestrator<C> {
    name: String,
    children: Vec<Arc<C>>,
    target: Arc<dyn ControlPoint>,
    readback: Arc<dyn ControlPoint>,
    ceiling: Arc<dyn ControlPoint>,
    allocator: AmplitudeAllocator,
    stagger: Duration,
}

impl<C> std::fmt::Debug for GroupOrchestrator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupOrchestrator")
            .field("name", &self.name)
            .field("children", &self.children.len())
            .field("stagger", &self.stagger)
            .finish_non_exhaustive()
    }
}

impl<C: SetupNode + 'static> GroupOrchestrator<C> {
    /// Bind a group's target, readback and ceiling points under `prefix`.
    pub fn bind(
        name: impl Into<String>,
        prefix: &str,
        transport: &dyn Transport,
        children: Vec<Arc<C>>,
        allocator: AmplitudeAllocator,
        stagger: Duration,
    ) -> AppResult<Self> {
        let target = transport.channel(&format!("{prefix}{}", naming::GROUP_TARGET));
        target.connect()?;
        let readback = transport.channel(&format!("{prefix}{}", naming::GROUP_READBACK));
        readback.connect()?;
        let ceiling = transport.channel(&format!("{prefix}{}", naming::AMPLITUDE_MAX));
        ceiling.connect()?;

        Ok(Self {
            name: name.into(),
            children,
            target,
            readback,
            ceiling,
            allocator,
            stagger,
        })
    }

    /// Children in launch order.
    pub fn children(&self) -> &[Arc<C>] {
        &self.children
    }

    /// Look up a child by name.
    pub fn child(&self, name: &str) -> Option<&Arc<C>> {
        self.children.iter().find(|c| c.name() == name)
    }

    /// Group target amplitude as published.
    pub fn target(&self) -> AppResult<f64> {
        self.target.get_f64()
    }

    /// Publish a new group target without launching anything.
    pub fn set_target(&self, amplitude: f64) -> AppResult<()> {
        Ok(self.target.put(PvValue::Float(amplitude))?)
    }

    /// Launch every child toward the published group target.
    pub async fn start_all(&self, flags: StageFlags) -> AppResult<LaunchReport> {
        let target = self.target()?;
        self.launch(flags, target).await
    }

    /// Shut every child down.
    pub async fn turn_off_all(&self) -> AppResult<LaunchReport> {
        let mut report = LaunchReport::default();
        for (i, child) in self.children.iter().enumerate() {
            self.pause_between(i).await;
            match child.turn_off().await {
                Ok(r) => report.merge(r),
                Err(e) => {
                    tracing::warn!(group = %self.name, child = %child.name(), error = %e, "turn-off failed");
                    report.merge(LaunchReport::failed(child.name(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Abort every child exactly once, without the launch stagger.
    ///
    /// Every child is reached even if an earlier one fails; the first error is
    /// returned afterwards.
    pub async fn kill_all(&self) -> AppResult<()> {
        let mut first_error: Option<SetupError> = None;
        for child in &self.children {
            if let Err(e) = child.kill().await {
                tracing::warn!(group = %self.name, child = %child.name(), error = %e, "abort request failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Recompute the readback sum and publish it.
    pub fn publish_readback(&self) -> AppResult<f64> {
        let sum = SetupNode::readback(self)?;
        self.readback.put(PvValue::Float(sum))?;
        Ok(sum)
    }

    /// Recompute the ceiling from the children and publish it.
    pub fn publish_ceiling(&self) -> AppResult<f64> {
        let max = SetupNode::amplitude_max(self)?;
        self.ceiling.put(PvValue::Float(max))?;
        Ok(max)
    }

    /// Keep the group's readback sum current.
    ///
    /// Publishes the ceiling once, then subscribes to every leaf readback under
    /// the group and republishes the sum on each change. Runs until the
    /// returned task is aborted.
    pub fn watch_readback(self: &Arc<Self>) -> JoinHandle<()> {
        let group = Arc::clone(self);
        tokio::spawn(async move {
            let streams = group
                .readback_points()
                .into_iter()
                .map(|point| WatchStream::from_changes(point.subscribe()));
            let mut changes = futures::stream::select_all(streams);

            if let Err(e) = group.publish_ceiling() {
                tracing::warn!(group = %group.name, error = %e, "ceiling aggregation failed");
            }
            if let Err(e) = group.publish_readback() {
                tracing::warn!(group = %group.name, error = %e, "readback aggregation failed");
            }
            while changes.next().await.is_some() {
                if let Err(e) = group.publish_readback() {
                    tracing::warn!(group = %group.name, error = %e, "readback aggregation failed");
                }
            }
        })
    }

    async fn launch(&self, flags: StageFlags, amplitude: f64) -> AppResult<LaunchReport> {
        self.set_target(amplitude)?;

        let inputs = self
            .children
            .iter()
            .map(|child| {
                Ok(ChildAmplitude {
                    setpoint: child.setpoint()?,
                    max: child.amplitude_max()?,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;
        let allocation = self.allocator.allocate(amplitude, &inputs);
        let shares = allocation.shares(&inputs);
        tracing::info!(group = %self.name, target = amplitude, ?shares, "launching group");

        let mut report = LaunchReport::default();
        for (i, (child, share)) in self.children.iter().zip(shares).enumerate() {
            self.pause_between(i).await;
            match child.start(flags, share).await {
                Ok(r) => report.merge(r),
                Err(e) => {
                    tracing::warn!(group = %self.name, child = %child.name(), error = %e, "launch failed");
                    report.merge(LaunchReport::failed(child.name(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    async fn pause_between(&self, index: usize) {
        if index > 0 && !self.stagger.is_zero() {
            tokio::time::sleep(self.stagger).await;
        }
    }
}

#[async_trait]
impl<C: SetupNode + 'static> SetupNode for GroupOrchestrator<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, flags: StageFlags, amplitude: f64) -> AppResult<LaunchReport> {
        self.launch(flags, amplitude).await
    }

    async fn turn_off(&self) -> AppResult<LaunchReport> {
        self.turn_off_all().await
    }

    async fn kill(&self) -> AppResult<()> {
        self.kill_all().await
    }

    async fn join(&self) {
        for child in &self.children {
            child.join().await;
        }
    }

    fn setpoint(&self) -> AppResult<f64> {
        self.children.iter().map(|c| c.setpoint()).sum()
    }

    fn readback(&self) -> AppResult<f64> {
        self.children.iter().map(|c| c.readback()).sum()
    }

    fn amplitude_max(&self) -> AppResult<f64> {
        self.children.iter().map(|c| c.amplitude_max()).sum()
    }

    fn readback_points(&self) -> Vec<Arc<dyn ControlPoint>> {
        self.children
            .iter()
            .flat_map(|c| c.readback_points())
            .collect()
    }
}
