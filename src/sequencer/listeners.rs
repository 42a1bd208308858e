//! Handle-based listener registry.
//!
//! Dispatch iterates over a snapshot taken under the lock, so a listener may
//! add or remove listeners (itself included) from inside a callback. A
//! listener removed during dispatch still receives the event being
//! dispatched, and nothing after it.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::points::position::{Position, Scalar};
use crate::sequencer::ScanListener;

/// Registration handle returned by [`ListenerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered set of registered listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ScanListener>)>>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

impl ListenerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener and return its handle.
    pub fn add(&self, listener: Arc<dyn ScanListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Unregister by handle. Returns whether the handle was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn ScanListener>> {
        self.listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Deliver a point completion to every listener, in registration order.
    pub async fn notify_point(&self, position: &Position) {
        for listener in self.snapshot() {
            listener.point_completed(position).await;
        }
    }

    /// Deliver a value change to every listener, in registration order.
    pub async fn notify_value(&self, source: &str, value: &Scalar) {
        for listener in self.snapshot() {
            listener.value_changed(source, value).await;
        }
    }
}
