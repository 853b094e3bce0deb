//! In-flight request coalescing.
//!
//! The first request for a fingerprint becomes the leader and executes;
//! identical requests arriving while it runs become followers and receive
//! the leader's result over a broadcast channel. A leader dropped without
//! completing (cancelled) closes the channel, and its followers fall back to
//! executing on their own.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::request::RoutedResponse;
use crate::RouterError;

/// Result shared from a leader to its followers.
pub type FlightResult = Result<RoutedResponse, RouterError>;

type FlightMap = DashMap<String, (u64, broadcast::Sender<FlightResult>)>;

/// Outcome of joining a flight.
#[derive(Debug)]
pub enum Flight {
    /// No identical request is running; the caller must execute and call
    /// [`FlightGuard::complete`].
    Leader(FlightGuard),
    /// An identical request is running; await its result.
    Follower(broadcast::Receiver<FlightResult>),
}

/// Registry of running requests by fingerprint.
///
/// Clone is cheap and all clones share state.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    flights: Arc<FlightMap>,
    next_id: Arc<AtomicU64>,
}

impl InFlight {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the leader for `key`, or subscribe to the running leader.
    pub fn join(&self, key: &str) -> Flight {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(slot) => {
                debug!(key, "joining in-flight request");
                Flight::Follower(slot.get().1.subscribe())
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, _) = broadcast::channel(1);
                slot.insert((id, tx.clone()));
                Flight::Leader(FlightGuard {
                    key: key.to_string(),
                    id,
                    tx,
                    flights: Arc::clone(&self.flights),
                    done: false,
                })
            }
        }
    }

    /// Number of running flights.
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    /// Return `true` if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

/// Leadership of one flight. Dropping it without completing releases the
/// key and closes the channel.
#[derive(Debug)]
pub struct FlightGuard {
    key: String,
    id: u64,
    tx: broadcast::Sender<FlightResult>,
    flights: Arc<FlightMap>,
    done: bool,
}

impl FlightGuard {
    /// Publish the leader's result to every follower and release the key.
    pub fn complete(mut self, result: FlightResult) {
        self.release();
        let waiting = self.tx.send(result).unwrap_or(0);
        debug!(key = %self.key, followers = waiting, "in-flight request completed");
        self.done = true;
    }

    fn release(&self) {
        let id = self.id;
        self.flights.remove_if(&self.key, |_, (owner, _)| *owner == id);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.done {
            self.release();
            debug!(key = %self.key, "in-flight leader abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TokenUsage;
    use std::time::Duration;

    fn response(content: &str) -> RoutedResponse {
        RoutedResponse {
            content: content.to_string(),
            backend_used: "a".to_string(),
            actual_cost: 0.01,
            latency: Duration::from_millis(5),
            quality_estimate: 0.9,
            cached: false,
            backends_attempted: vec!["a".to_string()],
            fallbacks_used: 0,
            usage: TokenUsage::default(),
        }
    }

    #[tokio::test]
    async fn test_first_joiner_leads_second_follows() {
        let inflight = InFlight::new();
        let Flight::Leader(guard) = inflight.join("k") else {
            std::panic::panic_any("first join must lead");
        };
        let Flight::Follower(mut rx) = inflight.join("k") else {
            std::panic::panic_any("second join must follow");
        };
        assert_eq!(inflight.len(), 1);

        guard.complete(Ok(response("done")));
        let got = rx.recv().await.unwrap().unwrap();
        assert_eq!(got.content, "done");
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let inflight = InFlight::new();
        let Flight::Leader(guard) = inflight.join("k") else {
            std::panic::panic_any("first join must lead");
        };
        let Flight::Follower(mut rx) = inflight.join("k") else {
            std::panic::panic_any("second join must follow");
        };
        guard.complete(Err(RouterError::Other("boom".into())));
        assert_eq!(rx.recv().await.unwrap(), Err(RouterError::Other("boom".into())));
    }

    #[tokio::test]
    async fn test_dropped_leader_closes_channel_and_frees_key() {
        let inflight = InFlight::new();
        let guard = inflight.join("k");
        let Flight::Follower(mut rx) = inflight.join("k") else {
            std::panic::panic_any("second join must follow");
        };
        drop(guard);
        assert!(rx.recv().await.is_err());
        assert!(matches!(inflight.join("k"), Flight::Leader(_)));
    }

    #[test]
    fn test_distinct_keys_lead_independently() {
        let inflight = InFlight::new();
        let a = inflight.join("a");
        let b = inflight.join("b");
        assert!(matches!(a, Flight::Leader(_)));
        assert!(matches!(b, Flight::Leader(_)));
    }
}
