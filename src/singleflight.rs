//! Singleflight: one loader invocation per key per flight.
//!
//! Concurrent `fetch` calls for the same missing key coalesce onto a single
//! flight record. The first caller to insert the record is the leader and
//! runs the loader; everyone else is a follower and waits on the record's
//! latch. The leader publishes the result (value or error), removes the
//! record, and signals the latch — on every exit path, including a loader
//! panic, which a drop guard converts into an error for the followers while
//! the panic itself keeps unwinding the leader's thread.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use parking_lot::{Condvar, Mutex};

use crate::error::FetchError;
use crate::hash::WyHashBuilder;

/// One in-progress load: a result slot plus a completion latch.
pub(crate) struct Flight<V> {
    result: Mutex<Option<Result<V, FetchError>>>,
    done: Condvar,
}

impl<V: Clone> Flight<V> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    /// Block until the leader publishes, then clone the outcome.
    pub fn wait(&self) -> Result<V, FetchError> {
        let mut guard = self.result.lock();
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut guard);
        }
    }

    /// Publish the outcome and wake every waiter. The first publication
    /// wins; later calls are no-ops so the panic guard cannot clobber a
    /// real result.
    fn complete(&self, outcome: Result<V, FetchError>) {
        {
            let mut guard = self.result.lock();
            if guard.is_none() {
                *guard = Some(outcome);
            }
        }
        self.done.notify_all();
    }
}

/// Concurrent map of in-progress flights, keyed like the cache.
pub(crate) struct FlightMap<K, V> {
    flights: DashMap<K, Arc<Flight<V>>, WyHashBuilder>,
}

impl<K, V> FlightMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            flights: DashMap::with_hasher(WyHashBuilder),
        }
    }

    /// Join the flight for `key`, creating it if absent.
    ///
    /// Returns the flight and whether the caller created it (is the leader).
    pub fn join(&self, key: K) -> (Arc<Flight<V>>, bool) {
        match self.flights.entry(key) {
            MapEntry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
            MapEntry::Vacant(vacant) => {
                let flight = Arc::new(Flight::new());
                vacant.insert(Arc::clone(&flight));
                (flight, true)
            }
        }
    }

    fn forget(&self, key: &K) {
        self.flights.remove(key);
    }

    /// Arm a leader-side guard that guarantees record removal and latch
    /// signalling on every exit path.
    pub fn guard<'a>(&'a self, key: K, flight: Arc<Flight<V>>) -> FlightGuard<'a, K, V> {
        FlightGuard {
            map: self,
            key,
            flight,
            completed: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

/// Leader-side cleanup guard.
///
/// [`FlightGuard::complete`] publishes a real outcome; if the guard is
/// dropped without one — the loader panicked — followers receive
/// [`FetchError::LoaderPanicked`] and the record is removed either way.
pub(crate) struct FlightGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    map: &'a FlightMap<K, V>,
    key: K,
    flight: Arc<Flight<V>>,
    completed: bool,
}

impl<K, V> FlightGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Publish the flight's outcome, remove the record, signal the latch.
    pub fn complete(mut self, outcome: Result<V, FetchError>) {
        self.flight.complete(outcome);
        self.map.forget(&self.key);
        self.completed = true;
    }
}

impl<K, V> Drop for FlightGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if !self.completed {
            self.flight.complete(Err(FetchError::LoaderPanicked));
            self.map.forget(&self.key);
        }
    }
}
