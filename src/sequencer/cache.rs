//! Bounded cache of positioners keyed by request id.
//!
//! Clients address positioners by the id of the request that created them.
//! The cache holds at most `capacity` of them and evicts the least recently
//! used one when full.

use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ScanError, ScanResult};
use crate::sequencer::Positioner;

/// LRU cache of positioners.
pub struct PositionerCache {
    entries: Mutex<LruCache<String, Arc<dyn Positioner>>>,
}

impl fmt::Debug for PositionerCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("PositionerCache")
            .field("len", &entries.len())
            .field("capacity", &entries.cap())
            .finish()
    }
}

impl PositionerCache {
    /// Cache holding at most `capacity` positioners.
    pub fn new(capacity: usize) -> ScanResult<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            ScanError::validation("positioner_capacity", "capacity must be at least 1")
        })?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Cached positioner for `request_id`, marking it most recently used.
    pub fn get(&self, request_id: &str) -> Option<Arc<dyn Positioner>> {
        self.entries.lock().get(request_id).cloned()
    }

    /// Cached positioner for `request_id`, creating it on a miss.
    ///
    /// A failed `create` leaves the cache unchanged.
    pub fn get_or_create<F>(&self, request_id: &str, create: F) -> ScanResult<Arc<dyn Positioner>>
    where
        F: FnOnce() -> ScanResult<Arc<dyn Positioner>>,
    {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(request_id) {
            return Ok(Arc::clone(existing));
        }
        let positioner = create()?;
        if let Some((evicted, _)) = entries.push(request_id.to_string(), Arc::clone(&positioner))
        {
            if evicted != request_id {
                debug!("Evicted positioner for request '{}'", evicted);
            }
        }
        Ok(positioner)
    }

    /// Drop the positioner for `request_id`.
    pub fn remove(&self, request_id: &str) -> Option<Arc<dyn Positioner>> {
        self.entries.lock().pop(request_id)
    }

    /// Number of cached positioners.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of cached positioners.
    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}
