//! Launching and cancelling runs on one cavity.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::cavity::{RunKind, SetupCavity, StageFlags};
use crate::control_point::ControlPoint;
use crate::error::AppResult;
use crate::orchestrator::{LaunchReport, SetupNode};
use crate::pool::WorkerPool;

/// Leaf of the orchestration tree.
pub struct DeviceOrchestrator {
    cavity: Arc<SetupCavity>,
    pool: WorkerPool,
    task: Mutex<Option<JoinHandle<Option<()>>>>,
}

impl std::fmt::Debug for DeviceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceOrchestrator")
            .field("cavity", &self.cavity.name())
            .finish_non_exhaustive()
    }
}

impl DeviceOrchestrator {
    /// Wrap a cavity; runs are queued on `pool`.
    pub fn new(cavity: Arc<SetupCavity>, pool: WorkerPool) -> Self {
        Self {
            cavity,
            pool,
            task: Mutex::new(None),
        }
    }

    /// The cavity this orchestrator drives.
    pub fn cavity(&self) -> &Arc<SetupCavity> {
        &self.cavity
    }

    /// Whether a run is in flight, as published by the cavity.
    pub fn is_running(&self) -> AppResult<bool> {
        Ok(self.cavity.reporter().is_running()?)
    }

    /// Queue a setup run unless one is already in flight.
    pub fn launch_setup(&self, flags: StageFlags, amplitude: f64) -> AppResult<LaunchReport> {
        self.schedule(RunKind::Setup { flags, amplitude })
    }

    /// Queue a shutdown run unless one is already in flight.
    pub fn launch_shutdown(&self) -> AppResult<LaunchReport> {
        self.schedule(RunKind::Shutdown)
    }

    /// Raise the cavity and tuner abort flags.
    ///
    /// Raised even when nothing is running; the next run drops a stale flag
    /// when it begins.
    pub fn request_abort(&self) -> AppResult<()> {
        Ok(self.cavity.request_abort()?)
    }

    fn schedule(&self, kind: RunKind) -> AppResult<LaunchReport> {
        let name = self.cavity.name().to_string();
        if self.pool.is_closed() {
            return Ok(LaunchReport::failed(name, "worker pool closed"));
        }

        // Admission happens here, before the task exists, so two launches in
        // quick succession cannot both see READY.
        if !self.cavity.begin()? {
            tracing::debug!(device = %name, "launch ignored, already running");
            return Ok(LaunchReport::already_running(name));
        }

        let cavity = Arc::clone(&self.cavity);
        let pending = PendingRun(Some(Arc::clone(&self.cavity)));
        let handle = self.pool.spawn(name.clone(), async move {
            pending.settle();
            let work = AssertUnwindSafe(cavity.execute(kind));
            if let Err(payload) = work.catch_unwind().await {
                cavity.fail_unexpected(&panic_detail(payload.as_ref()));
                std::panic::resume_unwind(payload);
            }
        });

        *self.task.lock() = Some(handle);
        Ok(LaunchReport::scheduled(name))
    }
}

/// Admitted run that the pool has not started yet.
///
/// Dropped unsettled when the pool discards the run, which would otherwise
/// leave the cavity RUNNING with nothing to finish it.
struct PendingRun(Option<Arc<SetupCavity>>);

impl PendingRun {
    fn settle(mut self) {
        self.0 = None;
    }
}

impl Drop for PendingRun {
    fn drop(&mut self) {
        if let Some(cavity) = self.0.take() {
            cavity.fail_unexpected("run discarded before it started");
        }
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl SetupNode for DeviceOrchestrator {
    fn name(&self) -> &str {
        self.cavity.name()
    }

    async fn start(&self, flags: StageFlags, amplitude: f64) -> AppResult<LaunchReport> {
        self.launch_setup(flags, amplitude)
    }

    async fn turn_off(&self) -> AppResult<LaunchReport> {
        self.launch_shutdown()
    }

    async fn kill(&self) -> AppResult<()> {
        self.request_abort()
    }

    async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(Some(())) => {}
                Ok(None) => {
                    tracing::warn!(device = %self.cavity.name(), "setup run was discarded by the pool");
                }
                Err(e) => {
                    tracing::error!(device = %self.cavity.name(), error = %e, "setup task ended abnormally");
                }
            }
        }
    }

    fn setpoint(&self) -> AppResult<f64> {
        self.cavity.setpoint()
    }

    fn readback(&self) -> AppResult<f64> {
        self.cavity.readback()
    }

    fn amplitude_max(&self) -> AppResult<f64> {
        self.cavity.amplitude_max()
    }

    fn readback_points(&self) -> Vec<Arc<dyn ControlPoint>> {
        vec![Arc::clone(&self.cavity.bindings().readback)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cavity::{CavityId, PipelineSettings};
    use crate::control_point::LocalTransport;
    use crate::driver::sim::{DriverOp, SimulatedCavity};
    use crate::driver::CavityDriver;
    use crate::status::SetupStatus;

    fn device(transport: &LocalTransport) -> (Arc<SimulatedCavity>, DeviceOrchestrator) {
        device_on(transport, 5, WorkerPool::new(4))
    }

    fn device_on(
        transport: &LocalTransport,
        number: u8,
        pool: WorkerPool,
    ) -> (Arc<SimulatedCavity>, DeviceOrchestrator) {
        let id = CavityId {
            linac_index: 2,
            cryomodule: "04".into(),
            number,
        };
        let sim = Arc::new(SimulatedCavity::new(transport, &id.prefix()).unwrap());
        let cavity = SetupCavity::bind(
            id,
            transport,
            sim.clone() as Arc<dyn CavityDriver>,
            PipelineSettings::default(),
        )
        .unwrap();
        (sim, DeviceOrchestrator::new(Arc::new(cavity), pool))
    }

    #[tokio::test]
    async fn test_second_start_is_ignored_while_running() {
        let transport = LocalTransport::new();
        let (sim, device) = device(&transport);
        let gate = sim.hold_on(DriverOp::AmplifierReset);

        let first = device.start(StageFlags::all(), 6.0).await.unwrap();
        assert_eq!(first.scheduled, vec!["CM04 Cavity 5".to_string()]);

        let second = device.start(StageFlags::all(), 6.0).await.unwrap();
        assert_eq!(second.already_running, vec!["CM04 Cavity 5".to_string()]);

        gate.notify_one();
        device.join().await;
        assert_eq!(
            device.cavity().status().unwrap(),
            SetupStatus::Ready
        );
        let resets = sim
            .calls()
            .into_iter()
            .filter(|op| *op == DriverOp::AmplifierReset)
            .count();
        assert_eq!(resets, 1);
    }

    #[tokio::test]
    async fn test_panic_moves_device_to_error() {
        let transport = LocalTransport::new();
        let (sim, device) = device(&transport);
        sim.panic_on(DriverOp::Characterize);

        device.start(StageFlags::all(), 6.0).await.unwrap();
        device.join().await;

        assert_eq!(device.cavity().status().unwrap(), SetupStatus::Error);
        assert!(device
            .cavity()
            .reporter()
            .message()
            .unwrap()
            .contains("unexpected failure"));
        assert!(!device.cavity().abort_token().is_requested().unwrap());
    }

    #[tokio::test]
    async fn test_kill_aborts_in_flight_run() {
        let transport = LocalTransport::new();
        let (sim, device) = device(&transport);
        let gate = sim.hold_on(DriverOp::Characterize);

        device.start(StageFlags::all(), 6.0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        device.kill().await.unwrap();
        gate.notify_one();
        device.join().await;

        let cavity = device.cavity();
        assert_eq!(cavity.status().unwrap(), SetupStatus::Error);
        assert_eq!(
            cavity.reporter().message().unwrap(),
            "CM04 Cavity 5 successfully aborted"
        );
        assert!(!sim.was_called(DriverOp::EnablePiezoFeedback));
        assert!(!cavity.abort_token().is_requested().unwrap());
    }

    #[tokio::test]
    async fn test_zero_amplitude_runs_shutdown() {
        let transport = LocalTransport::new();
        let (sim, device) = device(&transport);
        device.start(StageFlags::all(), 0.0).await.unwrap();
        device.join().await;
        assert_eq!(sim.calls(), vec![DriverOp::RfOff, DriverOp::AmplifierOff]);
    }

    #[tokio::test]
    async fn test_start_on_closed_pool_is_refused() {
        let transport = LocalTransport::new();
        let (sim, device) = device(&transport);
        device.pool.close();

        let report = device.start(StageFlags::all(), 6.0).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.scheduled.is_empty());
        assert_eq!(device.cavity().status().unwrap(), SetupStatus::Ready);
        assert!(sim.calls().is_empty());
    }

    #[tokio::test]
    async fn test_queued_run_discarded_by_pool_ends_in_error() {
        let transport = LocalTransport::new();
        let pool = WorkerPool::new(1);
        let (first_sim, first) = device_on(&transport, 1, pool.clone());
        let (second_sim, second) = device_on(&transport, 2, pool.clone());
        let gate = first_sim.hold_on(DriverOp::AmplifierReset);

        first.start(StageFlags::none(), 3.0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let report = second.start(StageFlags::none(), 3.0).await.unwrap();
        assert_eq!(report.scheduled.len(), 1);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        pool.close();
        second.join().await;
        let cavity = second.cavity();
        assert_eq!(cavity.status().unwrap(), SetupStatus::Error);
        assert_eq!(
            cavity.reporter().message().unwrap(),
            "CM04 Cavity 2 unexpected failure: run discarded before it started"
        );
        assert!(second_sim.calls().is_empty());

        // The run already holding a slot is unaffected
        gate.notify_one();
        first.join().await;
        assert_eq!(first.cavity().status().unwrap(), SetupStatus::Ready);
    }
}
