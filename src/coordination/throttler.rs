//! Bounded concurrency for image processing.
//!
//! A thin wrapper over a weighted semaphore. Only engine passes go
//! through the throttler; cache and storage lookups are never gated.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Semaphore gating concurrent engine passes.
#[derive(Clone)]
pub struct Throttler {
    semaphore: Arc<Semaphore>,
}

impl Throttler {
    /// Throttler allowing `limit` concurrent permits.
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Wait for a permit until `deadline`.
    ///
    /// Returns `None` when the deadline elapses first. The permit returns
    /// to the pool on drop.
    pub async fn take(&self, deadline: Instant) -> Option<ThrottlePermit> {
        let acquire = self.semaphore.clone().acquire_owned();
        match tokio::time::timeout_at(deadline, acquire).await {
            Ok(Ok(permit)) => Some(ThrottlePermit { _permit: permit }),
            // Elapsed, or the semaphore was closed (never done here).
            _ => None,
        }
    }

    /// Permits currently available, for tests and diagnostics.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// RAII permit for one engine pass.
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
}
