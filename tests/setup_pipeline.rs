//! End-to-end tests of the per-cavity setup pipeline on simulated hardware.

use std::sync::Arc;
use std::time::Duration;

use srf_setup::cavity::{CavityId, PipelineSettings, SetupCavity, StageFlags};
use srf_setup::control_point::{ControlPoint, LocalTransport, PvValue};
use srf_setup::driver::sim::{DriverOp, SimulatedCavity};
use srf_setup::driver::{CavityDriver, Tuner};
use srf_setup::orchestrator::{DeviceOrchestrator, SetupNode};
use srf_setup::pool::WorkerPool;
use srf_setup::status::SetupStatus;
use srf_setup::SetupFault;

struct Fixture {
    transport: LocalTransport,
    sim: Arc<SimulatedCavity>,
    device: DeviceOrchestrator,
}

impl Fixture {
    fn new() -> Self {
        let transport = LocalTransport::new();
        let id = CavityId {
            linac_index: 1,
            cryomodule: "03".into(),
            number: 2,
        };
        let sim = Arc::new(
            SimulatedCavity::new(&transport, &id.prefix()).expect("Failed to bind simulator"),
        );
        let cavity = SetupCavity::bind(
            id,
            &transport,
            sim.clone() as Arc<dyn CavityDriver>,
            PipelineSettings::default(),
        )
        .expect("Failed to bind cavity");
        let device = DeviceOrchestrator::new(Arc::new(cavity), WorkerPool::new(2));
        Self {
            transport,
            sim,
            device,
        }
    }

    fn cavity(&self) -> &SetupCavity {
        self.device.cavity()
    }

    async fn run(&self, flags: StageFlags, amplitude: f64) {
        self.device
            .start(flags, amplitude)
            .await
            .expect("Failed to launch");
        tokio::time::timeout(Duration::from_secs(5), self.device.join())
            .await
            .expect("Run did not finish");
    }
}

#[tokio::test]
async fn test_progress_is_monotonic_and_ends_at_100() {
    let fx = Fixture::new();
    let mut updates = fx.cavity().reporter().subscribe();

    fx.run(StageFlags::all(), 12.0).await;

    let mut progress = Vec::new();
    while let Ok(update) = updates.try_recv() {
        progress.push(update.progress);
    }
    assert!(!progress.is_empty());
    assert!(
        progress.windows(2).all(|w| w[0] <= w[1]),
        "progress went backwards: {progress:?}"
    );
    assert_eq!(progress.last().copied(), Some(100.0));
    assert_eq!(fx.cavity().status().unwrap(), SetupStatus::Ready);
    assert_eq!(
        fx.transport.peek("ACCL:L1B:0320:AACTMEAN"),
        Some(PvValue::Float(12.0))
    );
}

#[tokio::test]
async fn test_stages_run_in_declared_order() {
    let fx = Fixture::new();
    fx.run(StageFlags::all(), 7.0).await;

    assert_eq!(
        fx.sim.calls(),
        vec![
            DriverOp::AmplifierReset,
            DriverOp::AmplifierOn,
            DriverOp::ResetInterlocks,
            DriverOp::RfOff,
            DriverOp::AmplifierCalibrate,
            DriverOp::MoveToResonance,
            DriverOp::Characterize,
            DriverOp::AcknowledgeProbeQ,
            DriverOp::EnablePiezoFeedback,
            DriverOp::SetAmplitude,
            DriverOp::RfOn,
            DriverOp::SetOpenLoopMode,
            DriverOp::RampAmplitude,
            DriverOp::MoveToResonance,
            DriverOp::SetClosedLoopMode,
        ]
    );
}

#[tokio::test]
async fn test_disabled_stages_leave_progress_alone() {
    let fx = Fixture::new();
    let mut updates = fx.cavity().reporter().subscribe();

    fx.run(StageFlags::none(), 7.0).await;

    let mut progress = Vec::new();
    while let Ok(update) = updates.try_recv() {
        if progress.last() != Some(&update.progress) {
            progress.push(update.progress);
        }
    }
    assert_eq!(progress, vec![0.0, 10.0, 15.0, 100.0]);
    assert!(!fx.sim.was_called(DriverOp::AmplifierCalibrate));
    assert!(!fx.sim.was_called(DriverOp::RampAmplitude));
}

#[tokio::test]
async fn test_abort_at_each_checkpoint() {
    // (operation during which the operator aborts, progress the run stops at,
    //  first operation that must not run)
    let cases = [
        (DriverOp::AmplifierCalibrate, 20.0, DriverOp::MoveToResonance),
        (DriverOp::MoveToResonance, 50.0, DriverOp::Characterize),
        (DriverOp::AcknowledgeProbeQ, 70.0, DriverOp::EnablePiezoFeedback),
        (DriverOp::RfOn, 85.0, DriverOp::RampAmplitude),
    ];

    for (during, stopped_at, never) in cases {
        let fx = Fixture::new();
        let token = fx.cavity().abort_token().clone();
        fx.sim.abort_on(during, token);

        fx.run(StageFlags::all(), 10.0).await;

        let cavity = fx.cavity();
        assert_eq!(cavity.status().unwrap(), SetupStatus::Error, "abort during {during}");
        assert_eq!(
            cavity.reporter().message().unwrap(),
            "CM03 Cavity 2 successfully aborted",
            "abort during {during}"
        );
        assert_eq!(cavity.reporter().progress().unwrap(), stopped_at, "abort during {during}");
        assert!(!cavity.abort_token().is_requested().unwrap());
        assert!(!fx.sim.was_called(never), "{never} ran after abort during {during}");
    }
}

#[tokio::test]
async fn test_abort_is_checked_when_calibration_is_disabled() {
    let fx = Fixture::new();
    fx.sim
        .abort_on(DriverOp::ResetInterlocks, fx.cavity().abort_token().clone());

    fx.run(
        StageFlags {
            calibrate_amplifier: false,
            ..StageFlags::all()
        },
        10.0,
    )
    .await;

    assert_eq!(fx.cavity().status().unwrap(), SetupStatus::Error);
    assert_eq!(fx.cavity().reporter().progress().unwrap(), 15.0);
    assert!(!fx.sim.was_called(DriverOp::MoveToResonance));
}

#[tokio::test]
async fn test_tuner_abort_reaches_the_stepper() {
    let fx = Fixture::new();
    let gate = fx.sim.hold_on(DriverOp::MoveToResonance);

    fx.device
        .start(StageFlags::all(), 10.0)
        .await
        .expect("Failed to launch");
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Only the tuner is told to stop; the cavity checkpoint has not run yet
    fx.sim.tuner().request_abort().unwrap();
    gate.notify_one();
    fx.device.join().await;

    let cavity = fx.cavity();
    assert_eq!(cavity.status().unwrap(), SetupStatus::Error);
    assert_eq!(
        cavity.reporter().message().unwrap(),
        "CM03 Cavity 2 successfully aborted"
    );
    assert!(!fx.sim.was_called(DriverOp::Characterize));
}

#[tokio::test]
async fn test_zero_target_skips_every_stage() {
    let fx = Fixture::new();
    let mut updates = fx.cavity().reporter().subscribe();

    fx.run(StageFlags::all(), 0.0).await;

    assert_eq!(fx.sim.calls(), vec![DriverOp::RfOff, DriverOp::AmplifierOff]);
    let mut progress = Vec::new();
    while let Ok(update) = updates.try_recv() {
        if progress.last() != Some(&update.progress) {
            progress.push(update.progress);
        }
    }
    assert_eq!(progress, vec![0.0, 50.0, 100.0]);
    assert_eq!(
        fx.cavity().reporter().message().unwrap(),
        "Turning CM03 Cavity 2 SSA off"
    );
}

#[tokio::test]
async fn test_characterization_fault_skips_ramp() {
    let fx = Fixture::new();
    fx.sim.fail_on(
        DriverOp::Characterize,
        SetupFault::LoadedQ("loaded Q 1.2e9 outside limits".into()),
    );

    fx.run(StageFlags::all(), 10.0).await;

    let cavity = fx.cavity();
    assert_eq!(cavity.status().unwrap(), SetupStatus::Error);
    assert_eq!(cavity.reporter().progress().unwrap(), 50.0);
    assert_eq!(
        cavity.reporter().message().unwrap(),
        "Loaded Q calibration fault: loaded Q 1.2e9 outside limits"
    );
    assert!(!fx.sim.was_called(DriverOp::EnablePiezoFeedback));
    assert!(!fx.sim.was_called(DriverOp::RampAmplitude));
}

#[tokio::test]
async fn test_fault_clears_armed_abort() {
    let fx = Fixture::new();
    let gate = fx.sim.hold_on(DriverOp::Characterize);
    fx.sim.fail_on(
        DriverOp::Characterize,
        SetupFault::ScaleFactor("scale factor diverged".into()),
    );

    fx.device
        .start(StageFlags::all(), 10.0)
        .await
        .expect("Failed to launch");
    tokio::time::sleep(Duration::from_millis(10)).await;
    fx.device.kill().await.unwrap();
    gate.notify_one();
    fx.device.join().await;

    // The fault wins over the pending abort, and the abort is not left armed
    assert_eq!(
        fx.cavity().reporter().message().unwrap(),
        "Scale factor calibration fault: scale factor diverged"
    );
    assert!(!fx.cavity().abort_token().is_requested().unwrap());
    assert!(!fx
        .sim
        .simulated_tuner()
        .abort_token()
        .is_requested()
        .unwrap());
}

#[tokio::test]
async fn test_run_after_error_starts_clean() {
    let fx = Fixture::new();
    fx.sim
        .fail_on(DriverOp::AmplifierOn, SetupFault::AmplifierHardware("SSA faulted".into()));
    fx.run(StageFlags::all(), 6.0).await;
    assert_eq!(fx.cavity().status().unwrap(), SetupStatus::Error);

    fx.sim.clear_calls();
    fx.run(StageFlags::all(), 6.0).await;
    assert_eq!(fx.cavity().status().unwrap(), SetupStatus::Ready);
    assert_eq!(fx.cavity().readback().unwrap(), 6.0);
}

#[tokio::test]
async fn test_disconnected_point_fails_run() {
    let fx = Fixture::new();
    fx.transport.point("ACCL:L1B:0320:INTLK_RESET_ALL").disconnect();

    fx.run(StageFlags::all(), 6.0).await;

    assert_eq!(fx.cavity().status().unwrap(), SetupStatus::Error);
    assert_eq!(
        fx.cavity().reporter().message().unwrap(),
        "Control point ACCL:L1B:0320:INTLK_RESET_ALL unavailable"
    );
}

#[tokio::test]
async fn test_message_loss_at_start_does_not_wedge_device() {
    let fx = Fixture::new();
    fx.cavity().request_abort().unwrap();
    fx.transport.point("ACCL:L1B:0320:AUTO:MSG").disconnect();

    let err = fx.device.start(StageFlags::all(), 5.0).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Control point ACCL:L1B:0320:AUTO:MSG unavailable"
    );
    assert_eq!(fx.cavity().status().unwrap(), SetupStatus::Error);
    assert!(!fx.cavity().abort_token().is_requested().unwrap());
    assert!(!fx
        .sim
        .simulated_tuner()
        .abort_token()
        .is_requested()
        .unwrap());
    assert!(fx.sim.calls().is_empty());

    fx.transport
        .point("ACCL:L1B:0320:AUTO:MSG")
        .connect()
        .unwrap();
    fx.run(StageFlags::all(), 5.0).await;
    assert_eq!(fx.cavity().status().unwrap(), SetupStatus::Ready);
}

#[tokio::test]
async fn test_progress_loss_at_start_reports_fault() {
    let fx = Fixture::new();
    fx.transport.point("ACCL:L1B:0320:AUTO:PROG").disconnect();

    assert!(fx.device.start(StageFlags::all(), 5.0).await.is_err());

    assert_eq!(fx.cavity().status().unwrap(), SetupStatus::Error);
    assert_eq!(
        fx.cavity().reporter().message().unwrap(),
        "Control point ACCL:L1B:0320:AUTO:PROG unavailable"
    );
}

#[tokio::test]
async fn test_abort_point_loss_still_clears_tuner_and_reports() {
    let fx = Fixture::new();
    let gate = fx.sim.hold_on(DriverOp::AmplifierCalibrate);

    fx.device
        .start(StageFlags::all(), 10.0)
        .await
        .expect("Failed to launch");
    tokio::time::sleep(Duration::from_millis(10)).await;
    fx.sim.tuner().request_abort().unwrap();
    fx.transport.point("ACCL:L1B:0320:AUTO:SETUPSTOP").disconnect();
    gate.notify_one();
    fx.device.join().await;

    let cavity = fx.cavity();
    assert_eq!(cavity.status().unwrap(), SetupStatus::Error);
    assert_eq!(
        cavity.reporter().message().unwrap(),
        "Control point ACCL:L1B:0320:AUTO:SETUPSTOP unavailable"
    );
    assert!(!fx
        .sim
        .simulated_tuner()
        .abort_token()
        .is_requested()
        .unwrap());
    assert!(!fx.sim.was_called(DriverOp::MoveToResonance));
}

#[tokio::test]
async fn test_unpublishable_completion_ends_in_error() {
    let fx = Fixture::new();
    let gate = fx.sim.hold_on(DriverOp::SetClosedLoopMode);

    fx.device
        .start(StageFlags::all(), 6.0)
        .await
        .expect("Failed to launch");
    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.transport.point("ACCL:L1B:0320:AUTO:PROG").disconnect();
    gate.notify_one();
    fx.device.join().await;

    assert_eq!(fx.cavity().status().unwrap(), SetupStatus::Error);
    assert_eq!(
        fx.cavity().reporter().message().unwrap(),
        "Control point ACCL:L1B:0320:AUTO:PROG unavailable"
    );
    assert_eq!(
        fx.transport.peek("ACCL:L1B:0320:AUTO:PROG"),
        Some(PvValue::Float(95.0))
    );
}
