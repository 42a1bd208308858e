//! Scan execution boundary.
//!
//! The watchdog never drives hardware itself. It talks to a [`Controller`],
//! which owns the trajectory, decides whether it is paused and notifies
//! registered [`ScanListener`]s as points complete.
//!
//! - [`ScanRunner`]: in-process controller driving a [`Positioner`]
//! - [`MockPositioner`]: simulated positioner with tokio timing
//! - [`RecordingController`]: controller double recording control requests
//! - [`PositionerCache`]: bounded LRU of positioners keyed by request id
//! - [`ListenerRegistry`]: handle-based listener registration

pub mod cache;
pub mod listeners;
pub mod mock;
pub mod runner;

pub use cache::PositionerCache;
pub use listeners::{ListenerId, ListenerRegistry};
pub use mock::{ControlCall, MockPositioner, RecordingController};
pub use runner::{RunSummary, ScanRunner};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::ScanResult;
use crate::points::position::{Position, Scalar};
use crate::watchdog::WatchdogModel;

/// Execution state reported by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Running,
    Paused,
    Finished,
    Aborted,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ControllerState::Idle => "idle",
            ControllerState::Running => "running",
            ControllerState::Paused => "paused",
            ControllerState::Finished => "finished",
            ControllerState::Aborted => "aborted",
        };
        f.write_str(text)
    }
}

/// Notifications emitted by a controller while a scan runs.
#[async_trait]
pub trait ScanListener: Send + Sync {
    /// A position has been reached and its point is complete.
    async fn point_completed(&self, _position: &Position) {}

    /// A monitored value reported by the controller changed.
    async fn value_changed(&self, _source: &str, _value: &Scalar) {}
}

/// Executor accepting pause / resume / seek requests from interlocks.
///
/// Pause and resume are owner-scoped: a controller remembers who paused it
/// and only that owner may resume.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Controller name used in logs.
    fn name(&self) -> &str;

    /// Pause on behalf of `owner`.
    ///
    /// Returns `true` if this call paused the controller and `false` if it
    /// was already paused (a no-op, progress is untouched).
    async fn pause(&self, owner: &str, model: &WatchdogModel) -> ScanResult<bool>;

    /// Resume if paused by `owner`.
    ///
    /// Returns `false` without changing anything when not paused or when
    /// paused by someone else.
    async fn resume(&self, owner: &str) -> ScanResult<bool>;

    /// Rewind or advance emission so that the next point emitted is the one
    /// at `step_index`.
    async fn seek(&self, owner: &str, step_index: usize) -> ScanResult<()>;

    /// Current execution state.
    fn state(&self) -> ControllerState;

    /// Register a listener.
    fn add_listener(&self, listener: Arc<dyn ScanListener>) -> ListenerId;

    /// Unregister a listener. Returns whether it was registered.
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Moves hardware to a position.
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Positioner name used in logs.
    fn name(&self) -> &str;

    /// Move to `position` and wait until settled.
    async fn set_position(&self, position: &Position) -> ScanResult<()>;

    /// Request that any in-flight and future moves stop.
    fn abort(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(ControllerState::Paused.to_string(), "paused");
        let json = serde_json::to_value(ControllerState::Aborted).unwrap();
        assert_eq!(json, serde_json::json!("aborted"));
    }
}
