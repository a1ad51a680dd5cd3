//! Bounded fire-and-forget delivery of listener callbacks.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::trace;

/// Spawns listener invocations as independent tasks, at most `limit` at once.
///
/// When every permit is taken `dispatch` waits, which stalls the caller's
/// receive loop instead of growing the task count without bound.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl Dispatcher {
    /// Create a dispatcher allowing `limit` deliveries in flight.
    pub fn new(limit: usize) -> Self {
        let limit = limit.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Run `delivery` on its own task once a permit is free.
    pub async fn dispatch<F>(&self, delivery: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            trace!("dispatcher closed, dropping delivery");
            return;
        };
        tokio::spawn(async move {
            delivery.await;
            drop(permit);
        });
    }

    /// Deliveries currently running.
    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }
}
