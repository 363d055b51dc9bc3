//! Per-key in-flight registry for coalescing concurrent cache misses.
//!
//! The first caller to miss on a key becomes the leader and runs the
//! producer. Callers that miss while it runs join as followers and wait for
//! the leader to publish the encoded value, which they decode without touching
//! the store. If the leader fails or is cancelled it publishes nothing, and
//! the followers are released together to produce on their own.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::watch;
use tracing::warn;

/// Encoded value shared from a leader to its followers.
pub(crate) type Shared = Arc<[u8]>;

type Slot = Arc<watch::Sender<Option<Shared>>>;

#[derive(Debug, Default)]
pub(crate) struct FlightRegistry {
    flights: Mutex<HashMap<String, Slot>>,
}

/// What a caller became when it joined a key's flight.
pub(crate) enum Flight<'a> {
    Leader(FlightLeader<'a>),
    Follower(watch::Receiver<Option<Shared>>),
}

impl FlightRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock_map(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        match self.flights.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(cache = "flight", lock_kind = "mutex.lock", "recovered from poisoned flight registry");
                poisoned.into_inner()
            }
        }
    }

    /// Leads `key`'s flight if none is running, otherwise follows it.
    pub(crate) fn join(&self, key: &str) -> Flight<'_> {
        let mut flights = self.lock_map();
        if let Some(slot) = flights.get(key) {
            return Flight::Follower(slot.subscribe());
        }
        let (sender, _) = watch::channel(None);
        let slot = Arc::new(sender);
        flights.insert(key.to_owned(), Arc::clone(&slot));
        Flight::Leader(FlightLeader {
            registry: self,
            key: key.to_owned(),
            slot,
        })
    }

    /// Number of keys with a leader running.
    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.lock_map().len()
    }
}

/// Waits for the leader's value; `None` if it finished without one.
pub(crate) async fn follow(mut receiver: watch::Receiver<Option<Shared>>) -> Option<Shared> {
    match receiver.wait_for(Option::is_some).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    }
}

/// The leader's hold on a key; ends the flight on drop.
pub(crate) struct FlightLeader<'a> {
    registry: &'a FlightRegistry,
    key: String,
    slot: Slot,
}

impl FlightLeader<'_> {
    /// Hands the encoded value to every current follower.
    pub(crate) fn publish(&self, value: Shared) {
        self.slot.send_replace(Some(value));
    }
}

impl Drop for FlightLeader<'_> {
    fn drop(&mut self) {
        let mut flights = self.registry.lock_map();
        if flights
            .get(&self.key)
            .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot))
        {
            flights.remove(&self.key);
        }
        // Followers still waiting see the channel close once `slot` drops.
    }
}
