//! Stampede protection
//!
//! At most one computation per normalized key runs at a time in this
//! process. The first caller becomes the leader; everyone arriving while it
//! runs subscribes to its outcome and never starts a computation of its own.
//!
//! ```text
//!   caller 1 ──join──▶ Leader ──compute──▶ complete(Ok|Err) ──┐
//!   caller 2 ──join──▶ Follower ─────────────── wait ◀────────┤
//!   caller 3 ──join──▶ Follower ─────────────── wait ◀────────┘
//! ```
//!
//! The outcome is the serialized envelope, so followers decode the same bytes
//! the leader stored. A leader dropped before completing publishes a
//! cancellation so followers never hang.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::error::{CacheError, Result};

type Outcome = Option<Result<Bytes>>;
type FlightMap = DashMap<String, Arc<watch::Sender<Outcome>>>;

/// Role assigned to a caller for one key
pub enum Flight {
    /// Run the computation and report through the guard
    Leader(FlightGuard),
    /// Await the leader's outcome
    Follower(FlightWaiter),
}

/// Per-key in-flight coordinator
#[derive(Default)]
pub struct StampedeCoordinator {
    in_flight: Arc<FlightMap>,
    coalesced: AtomicU64,
}

impl StampedeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become leader for `key`, or follow the computation already running
    pub fn join(&self, key: &str) -> Flight {
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                Flight::Follower(FlightWaiter {
                    receiver: existing.get().subscribe(),
                })
            }
            Entry::Vacant(slot) => {
                let (sender, _) = watch::channel(None);
                let sender = Arc::new(sender);
                slot.insert(sender.clone());
                Flight::Leader(FlightGuard {
                    key: key.to_string(),
                    sender,
                    in_flight: self.in_flight.clone(),
                    completed: false,
                })
            }
        }
    }

    /// Lead `key` only if nobody else is computing it
    pub fn try_lead(&self, key: &str) -> Option<FlightGuard> {
        match self.join(key) {
            Flight::Leader(guard) => Some(guard),
            Flight::Follower(_) => {
                self.coalesced.fetch_sub(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Callers that joined an existing computation instead of starting one
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

/// Leader handle. Dropping it without [`complete`](Self::complete) reports a
/// cancellation to every follower.
pub struct FlightGuard {
    key: String,
    sender: Arc<watch::Sender<Outcome>>,
    in_flight: Arc<FlightMap>,
    completed: bool,
}

impl FlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish the outcome to followers and release the key
    pub fn complete(mut self, outcome: Result<Bytes>) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Result<Bytes>) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.sender.send_replace(Some(outcome));
        let sender = &self.sender;
        self.in_flight
            .remove_if(&self.key, |_, current| Arc::ptr_eq(current, sender));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.finish(Err(CacheError::cancelled(
                "computation abandoned by its leader",
            )));
        }
    }
}

/// Follower handle
pub struct FlightWaiter {
    receiver: watch::Receiver<Outcome>,
}

impl FlightWaiter {
    /// Wait for the leader's outcome
    pub async fn wait(mut self) -> Result<Bytes> {
        match self.receiver.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => match outcome.as_ref() {
                Some(result) => result.clone(),
                None => Err(CacheError::cancelled("computation produced no outcome")),
            },
            Err(_) => Err(CacheError::cancelled("computation abandoned by its leader")),
        }
    }
}
