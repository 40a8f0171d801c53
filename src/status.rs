//! Lifecycle status, progress and message reporting.
//!
//! Each device publishes three externally observable values: a numeric status
//! code, a progress percentage and a free-text message. They are mirrored to
//! control points so that any consumer (GUI, scripts) can read them, and every
//! change is also broadcast as a [`StatusUpdate`] on an in-process channel so a
//! presentation layer can attach without an event loop of its own.
//!
//! ```text
//! SetupCavity --set_*--> StatusReporter --put--> AUTO:STATUS / AUTO:PROG / AUTO:MSG
//!                                      \--send--> broadcast::Sender<StatusUpdate>
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::control_point::{ControlPoint, PvValue};
use crate::error::SetupFault;

/// Capacity of the per-device update channel.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Device lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupStatus {
    /// Idle, ready to accept a start request
    Ready,
    /// A setup or shutdown sequence is in flight
    Running,
    /// The last sequence ended with a fault or an abort
    Error,
}

impl SetupStatus {
    /// Wire code published to the status control point.
    pub fn code(self) -> i64 {
        match self {
            SetupStatus::Ready => 0,
            SetupStatus::Running => 1,
            SetupStatus::Error => 2,
        }
    }

    /// Decode a wire code. Unknown codes map to `None`.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(SetupStatus::Ready),
            1 => Some(SetupStatus::Running),
            2 => Some(SetupStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for SetupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SetupStatus::Ready => "READY",
            SetupStatus::Running => "RUNNING",
            SetupStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One (progress, status, message) snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Device display name
    pub device: String,
    /// Lifecycle status at the time of the update
    pub status: SetupStatus,
    /// Progress in [0, 100]
    pub progress: f64,
    /// Last status message
    pub message: String,
    /// UTC time the update was published
    pub timestamp: DateTime<Utc>,
}

/// Publishes a device's status, progress and message.
pub struct StatusReporter {
    device: String,
    status: Arc<dyn ControlPoint>,
    progress: Arc<dyn ControlPoint>,
    message: Arc<dyn ControlPoint>,
    updates: broadcast::Sender<StatusUpdate>,
}

impl fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusReporter")
            .field("device", &self.device)
            .field("status", &self.status.name())
            .finish_non_exhaustive()
    }
}

impl StatusReporter {
    /// Bind a reporter to its three control points.
    pub fn new(
        device: impl Into<String>,
        status: Arc<dyn ControlPoint>,
        progress: Arc<dyn ControlPoint>,
        message: Arc<dyn ControlPoint>,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            device: device.into(),
            status,
            progress,
            message,
            updates,
        }
    }

    /// Subscribe to status updates.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    /// Current status as published.
    ///
    /// An unknown code is reported as `Error` so that a start request is not
    /// blocked forever by a corrupt value.
    pub fn status(&self) -> Result<SetupStatus, SetupFault> {
        let code = self.status.get()?.as_i64().unwrap_or(SetupStatus::Error.code());
        Ok(SetupStatus::from_code(code).unwrap_or(SetupStatus::Error))
    }

    /// Current progress as published.
    pub fn progress(&self) -> Result<f64, SetupFault> {
        Ok(self.progress.get()?.as_f64().unwrap_or(0.0))
    }

    /// Current message as published.
    pub fn message(&self) -> Result<String, SetupFault> {
        Ok(match self.message.get()? {
            PvValue::Text(s) => s,
            other => other.to_string(),
        })
    }

    /// Whether a sequence is in flight.
    pub fn is_running(&self) -> Result<bool, SetupFault> {
        Ok(self.status()? == SetupStatus::Running)
    }

    /// Publish a new status.
    pub fn set_status(&self, status: SetupStatus) -> Result<(), SetupFault> {
        self.status.put(PvValue::Int(status.code()))?;
        tracing::debug!(device = %self.device, %status, "status changed");
        self.broadcast();
        Ok(())
    }

    /// Publish a new progress value.
    pub fn set_progress(&self, progress: f64) -> Result<(), SetupFault> {
        self.progress.put(PvValue::Float(progress.clamp(0.0, 100.0)))?;
        self.broadcast();
        Ok(())
    }

    /// Publish a new status message; also logged.
    pub fn set_message(&self, message: impl Into<String>) -> Result<(), SetupFault> {
        let message = message.into();
        tracing::info!(device = %self.device, "{}", message);
        self.message.put(PvValue::Text(message))?;
        self.broadcast();
        Ok(())
    }

    fn broadcast(&self) {
        if self.updates.receiver_count() == 0 {
            return;
        }
        let update = StatusUpdate {
            device: self.device.clone(),
            status: self.status().unwrap_or(SetupStatus::Error),
            progress: self.progress().unwrap_or(0.0),
            message: self.message().unwrap_or_default(),
            timestamp: Utc::now(),
        };
        // Lagging receivers drop old updates; the control points keep the latest
        let _ = self.updates.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_point::{LocalTransport, Transport};

    fn reporter(transport: &LocalTransport) -> StatusReporter {
        let bind = |name: &str| {
            let point = transport.channel(name);
            point.connect().unwrap();
            point
        };
        StatusReporter::new(
            "CM02 Cavity 1",
            bind("ACCL:L1B:0210:AUTO:STATUS"),
            bind("ACCL:L1B:0210:AUTO:PROG"),
            bind("ACCL:L1B:0210:AUTO:MSG"),
        )
    }

    #[test]
    fn test_status_codes_round_trip_through_wire() {
        assert_eq!(SetupStatus::Ready.code(), 0);
        assert_eq!(SetupStatus::Running.code(), 1);
        assert_eq!(SetupStatus::Error.code(), 2);
        assert_eq!(SetupStatus::from_code(7), None);
    }

    #[test]
    fn test_publishes_to_control_points() {
        let transport = LocalTransport::new();
        let reporter = reporter(&transport);
        reporter.set_status(SetupStatus::Running).unwrap();
        reporter.set_progress(15.0).unwrap();
        reporter.set_message("Resetting interlocks").unwrap();

        assert_eq!(
            transport.peek("ACCL:L1B:0210:AUTO:STATUS"),
            Some(PvValue::Int(1))
        );
        assert_eq!(
            transport.peek("ACCL:L1B:0210:AUTO:PROG"),
            Some(PvValue::Float(15.0))
        );
        assert!(reporter.is_running().unwrap());
        assert_eq!(reporter.message().unwrap(), "Resetting interlocks");
    }

    #[test]
    fn test_unknown_code_reads_as_error() {
        let transport = LocalTransport::new();
        transport.seed("ACCL:L1B:0210:AUTO:STATUS", PvValue::Int(9));
        let reporter = reporter(&transport);
        assert_eq!(reporter.status().unwrap(), SetupStatus::Error);
    }

    #[tokio::test]
    async fn test_updates_are_broadcast() {
        let transport = LocalTransport::new();
        let reporter = reporter(&transport);
        let mut rx = reporter.subscribe();

        reporter.set_status(SetupStatus::Running).unwrap();
        reporter.set_progress(10.0).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, SetupStatus::Running);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.progress, 10.0);
        assert_eq!(second.device, "CM02 Cavity 1");
    }
}
