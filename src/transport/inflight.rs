//! Chained-query suppression
//!
//! When a lookup for `(server, qname, qtype)` is already on the wire,
//! issuing a second one buys nothing but load and a bigger spoofing
//! surface. Instead the second requester *chains*: it subscribes to the
//! first flight's broadcast channel and receives a copy of whatever reply
//! (or failure) the owner publishes.
//!
//! The first caller of [`InflightTable::begin`] becomes the owner and must
//! publish exactly once; dropping the guard without publishing closes the
//! channel, which waiters treat as a failure and recover from by retrying
//! on their own. Chained waiters never register flights of their own, so
//! chains stay one level deep.

use std::net::SocketAddr;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::transport::Exchange;

/// How many chained waiters one flight can hold before the oldest lags out
const CHAIN_CAPACITY: usize = 64;

/// Identity of an in-flight lookup, transaction id deliberately excluded
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlightKey {
    /// The server being asked
    pub server: SocketAddr,
    /// Canonical question name
    pub qname: String,
    /// Question type
    pub qtype: u16,
}

/// What a chained waiter receives
#[derive(Debug, Clone)]
pub enum ChainedReply {
    /// A copy of the owner's successful exchange
    Answer(Box<Exchange>),
    /// The owner's attempt failed
    Failed(String),
}

/// Outcome of [`InflightTable::begin`]
pub enum FlightOutcome {
    /// No identical flight exists; the caller does the network work
    Owner(FlightGuard),
    /// An identical flight exists; await its result here
    Chained(broadcast::Receiver<ChainedReply>),
}

/// Registry of in-flight lookups
#[derive(Debug, Default)]
pub struct InflightTable {
    flights: DashMap<FlightKey, broadcast::Sender<ChainedReply>>,
}

impl InflightTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flights currently registered
    #[must_use]
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    /// Whether no flight is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    /// Join or start the flight for `key`
    pub fn begin(table: &std::sync::Arc<Self>, key: FlightKey) -> FlightOutcome {
        use dashmap::mapref::entry::Entry;
        match table.flights.entry(key.clone()) {
            Entry::Occupied(existing) => FlightOutcome::Chained(existing.get().subscribe()),
            Entry::Vacant(slot) => {
                let (sender, _) = broadcast::channel(CHAIN_CAPACITY);
                slot.insert(sender.clone());
                FlightOutcome::Owner(FlightGuard {
                    table: std::sync::Arc::clone(table),
                    key,
                    sender,
                    published: false,
                })
            }
        }
    }
}

/// Owner's handle on a registered flight
pub struct FlightGuard {
    table: std::sync::Arc<InflightTable>,
    key: FlightKey,
    sender: broadcast::Sender<ChainedReply>,
    published: bool,
}

impl FlightGuard {
    /// Number of chained waiters right now
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish the flight's outcome to every waiter and deregister
    ///
    /// Returns the number of waiters that were resumed.
    pub fn publish(mut self, reply: ChainedReply) -> usize {
        self.published = true;
        self.table.flights.remove(&self.key);
        // send fails only when nobody chained, which is fine
        self.sender.send(reply).unwrap_or(0)
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.published {
            // Deregister so nobody chains onto a dead flight; the channel
            // closing is what tells existing waiters to fend for themselves.
            self.table.flights.remove(&self.key);
        }
    }
}

impl std::fmt::Debug for FlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightGuard")
            .field("key", &self.key)
            .field("waiters", &self.waiters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(qname: &str) -> FlightKey {
        FlightKey {
            server: "192.0.2.1:53".parse().unwrap(),
            qname: qname.to_string(),
            qtype: 1,
        }
    }

    #[tokio::test]
    async fn test_first_caller_owns() {
        let table = Arc::new(InflightTable::new());
        match InflightTable::begin(&table, key("www.example.com.")) {
            FlightOutcome::Owner(guard) => {
                assert_eq!(guard.waiters(), 0);
                assert_eq!(table.len(), 1);
            }
            FlightOutcome::Chained(_) => panic!("first caller must own"),
        }
    }

    #[tokio::test]
    async fn test_second_caller_chains_and_receives_copy() {
        let table = Arc::new(InflightTable::new());
        let FlightOutcome::Owner(guard) = InflightTable::begin(&table, key("www.example.com.")) else {
            panic!("first caller must own");
        };
        let FlightOutcome::Chained(mut rx) = InflightTable::begin(&table, key("www.example.com.")) else {
            panic!("second caller must chain");
        };

        let exchange = Exchange {
            rcode: 0,
            ..Exchange::default()
        };
        let resumed = guard.publish(ChainedReply::Answer(Box::new(exchange)));
        assert_eq!(resumed, 1);

        match rx.recv().await.unwrap() {
            ChainedReply::Answer(answer) => assert_eq!(answer.rcode, 0),
            ChainedReply::Failed(_) => panic!("expected an answer"),
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_chain() {
        let table = Arc::new(InflightTable::new());
        let _a = InflightTable::begin(&table, key("a.example.com."));
        match InflightTable::begin(&table, key("b.example.com.")) {
            FlightOutcome::Owner(_) => {}
            FlightOutcome::Chained(_) => panic!("different question must not chain"),
        }
    }

    #[tokio::test]
    async fn test_owner_drop_closes_channel() {
        let table = Arc::new(InflightTable::new());
        let FlightOutcome::Owner(guard) = InflightTable::begin(&table, key("www.example.com.")) else {
            panic!();
        };
        let FlightOutcome::Chained(mut rx) = InflightTable::begin(&table, key("www.example.com.")) else {
            panic!();
        };

        drop(guard);
        assert!(rx.recv().await.is_err());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_broadcast() {
        let table = Arc::new(InflightTable::new());
        let FlightOutcome::Owner(guard) = InflightTable::begin(&table, key("www.example.com.")) else {
            panic!();
        };
        let FlightOutcome::Chained(mut rx) = InflightTable::begin(&table, key("www.example.com.")) else {
            panic!();
        };

        guard.publish(ChainedReply::Failed("timeout".to_string()));
        match rx.recv().await.unwrap() {
            ChainedReply::Failed(reason) => assert_eq!(reason, "timeout"),
            ChainedReply::Answer(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_flight_reusable_after_publish() {
        let table = Arc::new(InflightTable::new());
        let FlightOutcome::Owner(guard) = InflightTable::begin(&table, key("www.example.com.")) else {
            panic!();
        };
        guard.publish(ChainedReply::Failed("gone".to_string()));

        // the key is free again
        match InflightTable::begin(&table, key("www.example.com.")) {
            FlightOutcome::Owner(_) => {}
            FlightOutcome::Chained(_) => panic!("stale flight left behind"),
        }
    }
}
