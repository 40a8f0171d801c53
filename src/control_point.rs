//! Control points: named, remotely addressable variables.
//!
//! The transport that carries control points is an external collaborator; the
//! engine only depends on the [`ControlPoint`] and [`Transport`] traits. Handles
//! are constructed explicitly when a device or group is built and must be
//! [`connect`](ControlPoint::connect)ed before first use.
//!
//! [`LocalTransport`] is an in-process implementation backed by
//! `tokio::sync::watch`, used by the simulator, the CLI and the tests.
//!
//! # Example
//!
//! ```rust
//! use srf_setup::control_point::{LocalTransport, PvValue, Transport};
//!
//! let transport = LocalTransport::new();
//! let ades = transport.channel("ACCL:L1B:0210:ADES");
//! ades.connect().unwrap();
//! ades.put(PvValue::Float(16.0)).unwrap();
//! assert_eq!(ades.get().unwrap().as_f64(), Some(16.0));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{AppResult, SetupError, SetupFault};

/// Value carried by a control point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PvValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl PvValue {
    /// Truthiness; numeric zero is false.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PvValue::Bool(b) => Some(*b),
            PvValue::Int(i) => Some(*i != 0),
            PvValue::Float(f) => Some(*f != 0.0),
            PvValue::Text(_) => None,
        }
    }

    /// Numeric value as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            PvValue::Int(i) => Some(*i as f64),
            PvValue::Float(f) => Some(*f),
            PvValue::Text(_) => None,
        }
    }

    /// Numeric value as i64; floats are truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PvValue::Bool(b) => Some(i64::from(*b)),
            PvValue::Int(i) => Some(*i),
            PvValue::Float(f) => Some(*f as i64),
            PvValue::Text(_) => None,
        }
    }

    /// Text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PvValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            PvValue::Bool(_) => "bool",
            PvValue::Int(_) => "int",
            PvValue::Float(_) => "float",
            PvValue::Text(_) => "text",
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Bool(b) => write!(f, "{b}"),
            PvValue::Int(i) => write!(f, "{i}"),
            PvValue::Float(v) => write!(f, "{v}"),
            PvValue::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for PvValue {
    fn from(value: bool) -> Self {
        PvValue::Bool(value)
    }
}

impl From<i64> for PvValue {
    fn from(value: i64) -> Self {
        PvValue::Int(value)
    }
}

impl From<f64> for PvValue {
    fn from(value: f64) -> Self {
        PvValue::Float(value)
    }
}

impl From<String> for PvValue {
    fn from(value: String) -> Self {
        PvValue::Text(value)
    }
}

impl From<&str> for PvValue {
    fn from(value: &str) -> Self {
        PvValue::Text(value.to_string())
    }
}

/// A named variable with get/put/subscribe semantics.
///
/// `get` and `put` never block; the transport delivers puts eventually. Both
/// fail with [`SetupFault::ControlPointUnavailable`] while disconnected.
pub trait ControlPoint: Send + Sync {
    /// Fully qualified name.
    fn name(&self) -> &str;

    /// Establish the connection. Idempotent.
    fn connect(&self) -> Result<(), SetupFault>;

    /// Whether the point is currently reachable.
    fn is_connected(&self) -> bool;

    /// Read the current value.
    fn get(&self) -> Result<PvValue, SetupFault>;

    /// Write a new value.
    fn put(&self, value: PvValue) -> Result<(), SetupFault>;

    /// Subscribe to value changes.
    fn subscribe(&self) -> watch::Receiver<PvValue>;
}

/// Typed helpers over [`ControlPoint`].
pub trait ControlPointExt: ControlPoint {
    /// Read as a boolean flag.
    fn get_bool(&self) -> AppResult<bool> {
        let value = self.get()?;
        value.as_bool().ok_or_else(|| self.type_error("bool", &value))
    }

    /// Read as a float.
    fn get_f64(&self) -> AppResult<f64> {
        let value = self.get()?;
        value.as_f64().ok_or_else(|| self.type_error("float", &value))
    }

    /// Read as an integer.
    fn get_i64(&self) -> AppResult<i64> {
        let value = self.get()?;
        value.as_i64().ok_or_else(|| self.type_error("int", &value))
    }

    /// Read as text.
    fn get_text(&self) -> AppResult<String> {
        let value = self.get()?;
        match value {
            PvValue::Text(s) => Ok(s),
            other => Err(self.type_error("text", &other)),
        }
    }

    #[doc(hidden)]
    fn type_error(&self, expected: &'static str, found: &PvValue) -> SetupError {
        SetupError::ControlPointType {
            name: self.name().to_string(),
            expected,
            found: found.type_name().to_string(),
        }
    }
}

impl<T: ControlPoint + ?Sized> ControlPointExt for T {}

/// Factory for control-point handles.
pub trait Transport: Send + Sync {
    /// Construct a handle for `name`. The handle starts disconnected.
    fn channel(&self, name: &str) -> Arc<dyn ControlPoint>;
}

/// In-process control point backed by a watch channel.
pub struct LocalControlPoint {
    name: String,
    sender: watch::Sender<PvValue>,
    connected: AtomicBool,
}

impl fmt::Debug for LocalControlPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalControlPoint")
            .field("name", &self.name)
            .field("value", &*self.sender.borrow())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl LocalControlPoint {
    /// Create a disconnected point holding `initial`.
    pub fn new(name: impl Into<String>, initial: PvValue) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            name: name.into(),
            sender,
            connected: AtomicBool::new(false),
        }
    }

    /// Simulate a momentary loss of connection.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> Result<(), SetupFault> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SetupFault::ControlPointUnavailable(self.name.clone()))
        }
    }
}

impl ControlPoint for LocalControlPoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<(), SetupFault> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn get(&self) -> Result<PvValue, SetupFault> {
        self.ensure_connected()?;
        Ok(self.sender.borrow().clone())
    }

    fn put(&self, value: PvValue) -> Result<(), SetupFault> {
        self.ensure_connected()?;
        self.sender.send_replace(value);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<PvValue> {
        self.sender.subscribe()
    }
}

/// In-process transport.
///
/// Handles are shared by name, so two bindings of the same name observe the
/// same value, as they would on a real network transport.
#[derive(Clone, Default)]
pub struct LocalTransport {
    points: Arc<Mutex<HashMap<String, Arc<LocalControlPoint>>>>,
}

impl LocalTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handle for `name`, created on demand with value `0`.
    pub fn point(&self, name: &str) -> Arc<LocalControlPoint> {
        let mut points = self.points.lock();
        points
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LocalControlPoint::new(name, PvValue::Int(0))))
            .clone()
    }

    /// Seed a value without requiring a connection, as an IOC would at boot.
    pub fn seed(&self, name: &str, value: impl Into<PvValue>) {
        self.point(name).sender.send_replace(value.into());
    }

    /// Read a value without requiring a connection.
    pub fn peek(&self, name: &str) -> Option<PvValue> {
        self.points
            .lock()
            .get(name)
            .map(|point| point.sender.borrow().clone())
    }

    /// Number of distinct points created so far.
    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    /// True if no points have been created.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transport for LocalTransport {
    fn channel(&self, name: &str) -> Arc<dyn ControlPoint> {
        self.point(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_point_is_unavailable() {
        let point = LocalControlPoint::new("ACCL:L1B:0210:ADES", PvValue::Float(0.0));
        assert!(!point.is_connected());
        assert_eq!(
            point.get(),
            Err(SetupFault::ControlPointUnavailable(
                "ACCL:L1B:0210:ADES".to_string()
            ))
        );
        point.connect().unwrap();
        assert_eq!(point.get().unwrap(), PvValue::Float(0.0));
        point.disconnect();
        assert!(point.put(PvValue::Float(1.0)).is_err());
    }

    #[test]
    fn test_transport_shares_points_by_name() {
        let transport = LocalTransport::new();
        let a = transport.channel("X:STATUS");
        let b = transport.channel("X:STATUS");
        a.connect().unwrap();
        b.connect().unwrap();
        a.put(PvValue::Int(2)).unwrap();
        assert_eq!(b.get_i64().unwrap(), 2);
        assert_eq!(transport.len(), 1);
    }

    #[test]
    fn test_numeric_flags_coerce_to_bool() {
        assert_eq!(PvValue::Int(1).as_bool(), Some(true));
        assert_eq!(PvValue::Float(0.0).as_bool(), Some(false));
        assert_eq!(PvValue::Text("yes".into()).as_bool(), None);
    }

    #[test]
    fn test_typed_read_reports_mismatch() {
        let transport = LocalTransport::new();
        transport.seed("X:MSG", "hello");
        let point = transport.channel("X:MSG");
        point.connect().unwrap();
        assert_eq!(point.get_text().unwrap(), "hello");
        let err = point.get_f64().unwrap_err();
        assert!(err.to_string().contains("expected float"));
    }

    #[tokio::test]
    async fn test_subscribe_sees_puts() {
        let transport = LocalTransport::new();
        let point = transport.channel("X:PROG");
        point.connect().unwrap();
        let mut rx = point.subscribe();
        point.put(PvValue::Float(50.0)).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), PvValue::Float(50.0));
    }
}
