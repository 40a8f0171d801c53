//! Control-point request listeners.
//!
//! Operators and scripts request a run by writing `1` to a cavity's
//! `AUTO:SETUPSTRT` or `AUTO:OFFSTRT` point. A listener task per cavity watches
//! both points, lowers the request, and launches the run through the cavity's
//! [`DeviceOrchestrator`]. The setup target is the cavity's current `ADES`
//! setpoint and the stage gates come from the `AUTO:SETUP_*REQ` points.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::control_point::{ControlPoint, PvValue};
use crate::error::AppResult;
use crate::orchestrator::{DeviceOrchestrator, LaunchReport};
use crate::topology::Topology;

/// Which request point fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    /// `AUTO:SETUPSTRT`
    Setup,
    /// `AUTO:OFFSTRT`
    Shutdown,
}

/// Running listener tasks; aborted on drop.
#[derive(Debug, Default)]
pub struct RequestListeners {
    handles: Vec<JoinHandle<()>>,
}

impl RequestListeners {
    /// Start one listener per cavity in `topology`.
    pub fn spawn_all(topology: &Topology) -> Self {
        let handles: Vec<_> = topology
            .devices()
            .map(|device| spawn_listener(Arc::clone(device)))
            .collect();
        tracing::info!(listeners = handles.len(), "request listeners started");
        Self { handles }
    }

    /// Number of listener tasks.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True if no listeners are running.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every listener.
    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for RequestListeners {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Watch one cavity's request points until the task is aborted.
///
/// Subscriptions are taken before the task is spawned, so a request written
/// right after this returns is not lost. A request raised earlier is not
/// replayed.
pub fn spawn_listener(device: Arc<DeviceOrchestrator>) -> JoinHandle<()> {
    let bindings = device.cavity().bindings();
    let mut setup_rx = bindings.start_request.subscribe();
    let mut off_rx = bindings.off_request.subscribe();

    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                changed = setup_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let raised = setup_rx.borrow_and_update().as_bool().unwrap_or(false);
                    raised.then_some(Request::Setup)
                }
                changed = off_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let raised = off_rx.borrow_and_update().as_bool().unwrap_or(false);
                    raised.then_some(Request::Shutdown)
                }
            };

            if let Some(request) = request {
                if let Err(e) = handle_request(&device, request) {
                    tracing::warn!(device = %device.cavity().name(), ?request, error = %e, "request rejected");
                }
            }
        }
        tracing::debug!(device = %device.cavity().name(), "request listener stopped");
    })
}

/// Lower the request point and launch the requested run.
pub fn handle_request(device: &DeviceOrchestrator, request: Request) -> AppResult<LaunchReport> {
    let cavity = device.cavity();
    match request {
        Request::Setup => {
            cavity.bindings().start_request.put(PvValue::Bool(false))?;
            let flags = cavity.requested_flags()?;
            let amplitude = cavity.setpoint()?;
            device.launch_setup(flags, amplitude)
        }
        Request::Shutdown => {
            cavity.bindings().off_request.put(PvValue::Bool(false))?;
            device.launch_shutdown()
        }
    }
}
