//! Identity-keyed listener registry with subscription handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned when a listener is registered; pass it back to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Ordered set of listeners keyed by `Arc` identity.
///
/// Registering the same `Arc` twice returns the id of the first registration.
/// Fan-out works on a snapshot so no lock is held while listeners run.
pub struct ListenerSet<L: ?Sized> {
    entries: Mutex<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> ListenerSet<L> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener, returning its subscription handle.
    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let mut entries = lock(&self.entries);
        let key = Arc::as_ptr(&listener).cast::<()>();
        if let Some((id, _)) = entries
            .iter()
            .find(|(_, existing)| Arc::as_ptr(existing).cast::<()>() == key)
        {
            return *id;
        }

        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        entries.push((id, listener));
        id
    }

    /// Remove a listener. Returns false if the id was not registered here.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Listeners in registration order.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        lock(&self.entries)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything.
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> fmt::Debug for ListenerSet<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet").field("len", &self.len()).finish()
    }
}
