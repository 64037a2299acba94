//! Local causal clock.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ids::{ClientId, Timestamp};

/// Issues distinct ticks for one client.
///
/// Every [`tick`](Self::tick) returns a counter strictly greater than any
/// previously returned, so a (client, counter) pair is never reused.
#[derive(Debug)]
pub struct ClockEnvironment {
    client: ClientId,
    counter: AtomicU64,
}

impl ClockEnvironment {
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            counter: AtomicU64::new(0),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client
    }

    /// Issue a fresh timestamp.
    pub fn tick(&self) -> Timestamp {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Timestamp {
            counter,
            client: self.client,
        }
    }

    /// Last issued timestamp, without advancing (counter 0 before any tick).
    pub fn now(&self) -> Timestamp {
        Timestamp {
            counter: self.counter.load(Ordering::SeqCst),
            client: self.client,
        }
    }
}
