//! Per-key request collapsing with result broadcast.
//!
//! The first caller to [`SingleFlight::acquire`] a key becomes the owner
//! and computes the response; later callers become waiters and receive a
//! copy of whatever the owner publishes. An owner that goes away without
//! publishing closes the waiters' channels, and each waiter falls back to
//! its own computation. There is no fairness guarantee among waiters.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::response::Response;

struct FlightEntry {
    next_waiter_id: u64,
    waiters: HashMap<u64, mpsc::Sender<Response>>,
}

type FlightTable = Arc<Mutex<HashMap<String, FlightEntry>>>;

/// Keyed single-flight lock.
///
/// At most one owner exists per key at any instant. All table mutations
/// happen under one mutex; broadcasting happens after the entry has been
/// detached from the table.
#[derive(Clone, Default)]
pub struct SingleFlight {
    table: FlightTable,
}

/// Outcome of [`SingleFlight::acquire`].
pub enum Acquired {
    /// This caller computes the result and must publish or release.
    Owner(OwnerGuard),
    /// Another caller owns the key; follow its broadcast.
    Waiter(WaiterTicket),
}

impl SingleFlight {
    /// Empty flight table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register intent for `key`.
    ///
    /// The first caller becomes the owner; everyone else gets a waiter
    /// ticket subscribed to the owner's broadcast.
    pub fn acquire(&self, key: &str) -> Acquired {
        let mut table = self.table.lock();
        match table.get_mut(key) {
            None => {
                table.insert(
                    key.to_string(),
                    FlightEntry {
                        next_waiter_id: 0,
                        waiters: HashMap::new(),
                    },
                );
                Acquired::Owner(OwnerGuard {
                    key: key.to_string(),
                    table: self.table.clone(),
                    finished: false,
                })
            }
            Some(entry) => {
                // Capacity 1: the single broadcast either lands or the
                // waiter has already gone away.
                let (tx, rx) = mpsc::channel(1);
                let id = entry.next_waiter_id;
                entry.next_waiter_id += 1;
                entry.waiters.insert(id, tx);
                Acquired::Waiter(WaiterTicket {
                    key: key.to_string(),
                    id,
                    rx,
                    table: self.table.clone(),
                })
            }
        }
    }

    /// Number of keys currently in flight, for tests and diagnostics.
    pub fn in_flight(&self) -> usize {
        self.table.lock().len()
    }
}

/// Owner side of a single-flight key.
///
/// Dropping the guard without publishing releases the key and closes all
/// waiter channels, so a failed owner cannot wedge its waiters.
pub struct OwnerGuard {
    key: String,
    table: FlightTable,
    finished: bool,
}

impl OwnerGuard {
    /// Broadcast `response` to all current waiters and release the key.
    ///
    /// Each waiter receives its own copy; waiters whose buffer is full or
    /// who have cancelled are skipped. When the response cannot be copied
    /// the waiters see a closed channel and recompute independently.
    pub fn publish(mut self, response: &Response) {
        let entry = self.table.lock().remove(&self.key);
        self.finished = true;
        let Some(entry) = entry else {
            return;
        };
        let waiters = entry.waiters.len();
        if waiters > 0 {
            debug!(key = %self.key, waiters, "broadcasting result to waiters");
        }
        for (_, tx) in entry.waiters {
            if let Ok(copy) = response.try_copy() {
                let _ = tx.try_send(copy);
            }
        }
    }

    /// Release the key without a result. Waiters observe a closed channel.
    pub fn release(mut self) {
        self.table.lock().remove(&self.key);
        self.finished = true;
    }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.table.lock().remove(&self.key);
        }
    }
}

/// Waiter side of a single-flight key.
///
/// Dropping the ticket withdraws it from the broadcast set.
pub struct WaiterTicket {
    key: String,
    id: u64,
    rx: mpsc::Receiver<Response>,
    table: FlightTable,
}

impl WaiterTicket {
    /// Wait for the owner's broadcast.
    ///
    /// `None` means the owner released without publishing; the caller
    /// must fall back to its own computation.
    pub async fn recv(&mut self) -> Option<Response> {
        self.rx.recv().await
    }

    /// Unsubscribe from the broadcast.
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for WaiterTicket {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(&self.key) {
            entry.waiters.remove(&self.id);
        }
    }
}
