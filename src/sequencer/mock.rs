//! Simulated devices for tests and dry runs.
//!
//! - `MockPositioner`: moves with `tokio::time::sleep`, never blocking the
//!   runtime
//! - `RecordingController`: records pause / resume / seek requests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::error::{ScanError, ScanResult};
use crate::points::position::{Position, Scalar};
use crate::sequencer::{
    Controller, ControllerState, ListenerId, ListenerRegistry, Positioner, ScanListener,
};
use crate::watchdog::WatchdogModel;

// =============================================================================
// MockPositioner - Simulated Positioner
// =============================================================================

/// Mock positioner with configurable timing.
///
/// Records every position it reaches. A fault can be armed on an axis value
/// so that moving there fails, and [`Positioner::abort`] makes every later
/// move fail until [`MockPositioner::reset`].
///
/// # Example
///
/// ```rust,ignore
/// let positioner = MockPositioner::new("stage")
///     .with_timing(Duration::from_millis(5), Duration::from_millis(1));
/// positioner.set_position(&Position::single("x", 1.0)).await?;
/// assert_eq!(positioner.move_count(), 1);
/// ```
#[derive(Debug)]
pub struct MockPositioner {
    name: String,
    move_time: Duration,
    settle_time: Duration,
    fault: Option<(String, Scalar)>,
    aborted: AtomicBool,
    moves: AtomicUsize,
    visited: Mutex<Vec<Position>>,
}

impl MockPositioner {
    /// Positioner that moves instantly.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            move_time: Duration::ZERO,
            settle_time: Duration::ZERO,
            fault: None,
            aborted: AtomicBool::new(false),
            moves: AtomicUsize::new(0),
            visited: Mutex::new(Vec::new()),
        }
    }

    /// Simulated time per move and settling time after each move.
    pub fn with_timing(mut self, move_time: Duration, settle_time: Duration) -> Self {
        self.move_time = move_time;
        self.settle_time = settle_time;
        self
    }

    /// Fail any move to a position whose `axis` equals `value`.
    pub fn with_fault(mut self, axis: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.fault = Some((axis.into(), value.into()));
        self
    }

    /// Number of completed moves.
    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    /// Positions reached so far, in order.
    pub fn visited(&self) -> Vec<Position> {
        self.visited.lock().clone()
    }

    /// Whether an abort is in effect.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Clear the abort flag.
    pub fn reset(&self) {
        self.aborted.store(false, Ordering::SeqCst);
    }

    fn check_aborted(&self) -> ScanResult<()> {
        if self.is_aborted() {
            return Err(ScanError::Positioner(format!(
                "{}: move aborted",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Positioner for MockPositioner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_position(&self, position: &Position) -> ScanResult<()> {
        self.check_aborted()?;

        if let Some((axis, value)) = &self.fault {
            if position.get(axis) == Some(value) {
                warn!("{}: fault triggered by {}={}", self.name, axis, value);
                return Err(ScanError::Positioner(format!(
                    "{}: cannot move to {}={}",
                    self.name, axis, value
                )));
            }
        }

        debug!("{}: moving to {}", self.name, position);
        sleep(self.move_time).await;
        self.check_aborted()?;
        sleep(self.settle_time).await;

        self.moves.fetch_add(1, Ordering::SeqCst);
        self.visited.lock().push(position.clone());
        Ok(())
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// RecordingController - Controller double
// =============================================================================

/// A control request received by [`RecordingController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    Pause(String),
    Resume(String),
    Seek(String, usize),
}

/// Controller double that records every request.
///
/// Follows the owner-scoped pause rules of [`Controller`] without driving any
/// trajectory. Starts in the running state.
#[derive(Debug)]
pub struct RecordingController {
    name: String,
    state: Mutex<(ControllerState, Option<String>)>,
    calls: Mutex<Vec<ControlCall>>,
    listeners: ListenerRegistry,
    reject: AtomicBool,
}

impl RecordingController {
    /// Running controller with no recorded calls.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new((ControllerState::Running, None)),
            calls: Mutex::new(Vec::new()),
            listeners: ListenerRegistry::new(),
            reject: AtomicBool::new(false),
        }
    }

    /// Make every later request fail with [`ScanError::Control`].
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Every request so far, in order.
    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().clone()
    }

    /// Number of pause requests.
    pub fn pause_count(&self) -> usize {
        self.count(|c| matches!(c, ControlCall::Pause(_)))
    }

    /// Number of resume requests.
    pub fn resume_count(&self) -> usize {
        self.count(|c| matches!(c, ControlCall::Resume(_)))
    }

    /// Number of seek requests.
    pub fn seek_count(&self) -> usize {
        self.count(|c| matches!(c, ControlCall::Seek(..)))
    }

    /// Owner of the current pause.
    pub fn paused_by(&self) -> Option<String> {
        self.state.lock().1.clone()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Report a completed point to registered listeners.
    pub async fn complete_point(&self, position: &Position) {
        self.listeners.notify_point(position).await;
    }

    /// Report a monitored value to registered listeners.
    pub async fn report_value(&self, source: &str, value: &Scalar) {
        self.listeners.notify_value(source, value).await;
    }

    fn count(&self, predicate: impl Fn(&ControlCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: ControlCall) -> ScanResult<()> {
        let rejected = self.reject.load(Ordering::SeqCst);
        let text = format!("{:?}", call);
        self.calls.lock().push(call);
        if rejected {
            return Err(ScanError::Control(format!("{}: rejected {}", self.name, text)));
        }
        Ok(())
    }
}

#[async_trait]
impl Controller for RecordingController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pause(&self, owner: &str, _model: &WatchdogModel) -> ScanResult<bool> {
        self.record(ControlCall::Pause(owner.to_string()))?;
        let mut state = self.state.lock();
        if state.0 == ControllerState::Paused {
            return Ok(false);
        }
        *state = (ControllerState::Paused, Some(owner.to_string()));
        Ok(true)
    }

    async fn resume(&self, owner: &str) -> ScanResult<bool> {
        self.record(ControlCall::Resume(owner.to_string()))?;
        let mut state = self.state.lock();
        if state.0 == ControllerState::Paused && state.1.as_deref() == Some(owner) {
            *state = (ControllerState::Running, None);
            return Ok(true);
        }
        Ok(false)
    }

    async fn seek(&self, owner: &str, step_index: usize) -> ScanResult<()> {
        self.record(ControlCall::Seek(owner.to_string(), step_index))
    }

    fn state(&self) -> ControllerState {
        self.state.lock().0
    }

    fn add_listener(&self, listener: Arc<dyn ScanListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}
