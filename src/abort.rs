//! Cooperative cancellation backed by a control point.
//!
//! An [`AbortToken`] is raised by an operator (or a script) and observed by a
//! running pipeline only at its checkpoints. Cancellation is never preemptive:
//! a hardware operation that has already started runs to completion, and the
//! next checkpoint after it returns catches the request.
//!
//! Whoever observes a raised token clears it before raising
//! [`SetupFault::AbortedByOperator`], so an abort is consumed exactly once and
//! cannot be replayed against a later run.

use std::sync::Arc;

use crate::control_point::{ControlPoint, PvValue};
use crate::error::SetupFault;

/// Per-device abort flag.
#[derive(Clone)]
pub struct AbortToken {
    point: Arc<dyn ControlPoint>,
}

impl std::fmt::Debug for AbortToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortToken")
            .field("point", &self.point.name())
            .finish()
    }
}

impl AbortToken {
    /// Wrap the control point that stores the flag.
    pub fn new(point: Arc<dyn ControlPoint>) -> Self {
        Self { point }
    }

    /// Name of the backing control point.
    pub fn name(&self) -> &str {
        self.point.name()
    }

    /// Raise the flag.
    pub fn request_abort(&self) -> Result<(), SetupFault> {
        self.point.put(PvValue::Bool(true))
    }

    /// Whether the flag is currently raised.
    pub fn is_requested(&self) -> Result<bool, SetupFault> {
        Ok(self.point.get()?.as_bool().unwrap_or(false))
    }

    /// Lower the flag.
    pub fn clear(&self) -> Result<(), SetupFault> {
        self.point.put(PvValue::Bool(false))
    }

    /// Checkpoint: consume a pending abort for `device`.
    ///
    /// No-op when the flag is down. When raised, the flag is cleared first and
    /// then [`SetupFault::AbortedByOperator`] is returned.
    pub fn check_abort(&self, device: &str) -> Result<(), SetupFault> {
        if self.is_requested()? {
            self.clear()?;
            return Err(SetupFault::AbortedByOperator(format!(
                "Abort requested for {device}"
            )));
        }
        Ok(())
    }
}
