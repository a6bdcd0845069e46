//! Two-tier cache: the memory engine backed by a persistent store.
//!
//! The memory layer is authoritative and always updated first; store
//! failures are surfaced to the caller but never roll back the in-memory
//! change. Reads fall through to the store on a memory miss and warm the
//! memory layer with whatever the store returns.

use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::cache::FifoCache;
use crate::store::{Store, StoreError};

fn system_time_to_nanos(expiry: Option<SystemTime>) -> u64 {
    match expiry {
        Some(expiry) => expiry
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0),
        None => 0,
    }
}

fn nanos_to_system_time(nanos: u64) -> Option<SystemTime> {
    (nanos != 0).then(|| SystemTime::UNIX_EPOCH + Duration::from_nanos(nanos))
}

/// A cache with an in-memory layer backed by persistent storage.
///
/// Core operations touch memory first; the store provides durability and
/// read-through on memory misses. Memory-only operations (`len`) never do
/// I/O.
pub struct TieredCache<K, V, S> {
    memory: FifoCache<K, V>,
    store: Arc<S>,
}

impl<K, V, S> TieredCache<K, V, S>
where
    K: Eq + Hash + Clone,
    V: Clone,
    S: Store<K, V>,
{
    /// Layer `memory` over `store`.
    pub fn new(memory: FifoCache<K, V>, store: S) -> Self {
        Self {
            memory,
            store: Arc::new(store),
        }
    }

    /// Read a key: memory first, then the store.
    ///
    /// A store hit warms the memory layer under the store's expiry.
    pub fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        if let Some(value) = self.memory.get(key) {
            return Ok(Some(value));
        }

        // Keys the store cannot hold were never persisted.
        self.store.validate_key(key)?;

        match self.store.get(key)? {
            Some((value, expiry)) => {
                self.memory
                    .set_at(key.clone(), value.clone(), system_time_to_nanos(expiry));
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Write a key to memory, then to the store.
    ///
    /// The value is in memory even when this returns a store error.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.store.validate_key(&key)?;

        let expiry = self.memory.expiry_nanos_for(ttl);
        self.memory.set_at(key.clone(), value.clone(), expiry);

        self.store.set(&key, &value, nanos_to_system_time(expiry))
    }

    /// Delete a key from memory, then from the store.
    pub fn delete(&self, key: &K) -> Result<(), StoreError> {
        self.memory.delete(key);
        self.store.validate_key(key)?;
        self.store.delete(key)
    }

    /// Remove every entry from memory and the store.
    ///
    /// On a store error the memory layer is already empty.
    pub fn flush(&self) -> Result<usize, StoreError> {
        let removed = self.memory.flush();
        Ok(removed + self.store.flush()?)
    }

    /// Entries in the memory layer. For the store-side count use
    /// [`TieredCache::store`] and [`Store::len`].
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    /// The memory engine.
    pub fn memory(&self) -> &FifoCache<K, V> {
        &self.memory
    }

    /// The persistence backend, for store-specific operations
    /// (`cleanup`, `len`, ...).
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Release store resources. The memory layer needs no teardown.
    pub fn close(&self) -> Result<(), StoreError> {
        self.store.close()
    }
}

impl<K, V, S> TieredCache<K, V, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Store<K, V> + 'static,
{
    /// Write a key to memory synchronously and to the store in the
    /// background.
    ///
    /// Key validation and the memory update happen on the caller's thread;
    /// store failures are logged, not returned.
    pub fn set_async(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.store.validate_key(&key)?;

        let expiry = self.memory.expiry_nanos_for(ttl);
        self.memory.set_at(key.clone(), value.clone(), expiry);

        let store = Arc::clone(&self.store);
        std::thread::spawn(move || {
            if let Err(err) = store.set(&key, &value, nanos_to_system_time(expiry)) {
                tracing::error!(error = %err, "async store write failed");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NullStore;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory backend for read-through tests.
    #[derive(Default)]
    struct MapStore {
        map: Mutex<HashMap<u64, (u64, Option<SystemTime>)>>,
    }

    impl Store<u64, u64> for MapStore {
        fn validate_key(&self, _key: &u64) -> Result<(), StoreError> {
            Ok(())
        }

        fn get(&self, key: &u64) -> Result<Option<(u64, Option<SystemTime>)>, StoreError> {
            Ok(self.map.lock().get(key).copied())
        }

        fn set(&self, key: &u64, value: &u64, expiry: Option<SystemTime>) -> Result<(), StoreError> {
            self.map.lock().insert(*key, (*value, expiry));
            Ok(())
        }

        fn delete(&self, key: &u64) -> Result<(), StoreError> {
            self.map.lock().remove(key);
            Ok(())
        }

        fn cleanup(&self, _max_age: Duration) -> Result<usize, StoreError> {
            Ok(0)
        }

        fn flush(&self) -> Result<usize, StoreError> {
            let mut map = self.map.lock();
            let removed = map.len();
            map.clear();
            Ok(removed)
        }

        fn len(&self) -> Result<usize, StoreError> {
            Ok(self.map.lock().len())
        }

        fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// Backend that fails every operation after key validation.
    struct FailingStore;

    impl Store<u64, u64> for FailingStore {
        fn validate_key(&self, _key: &u64) -> Result<(), StoreError> {
            Ok(())
        }

        fn get(&self, _key: &u64) -> Result<Option<(u64, Option<SystemTime>)>, StoreError> {
            Err(StoreError::Timeout)
        }

        fn set(&self, _key: &u64, _value: &u64, _expiry: Option<SystemTime>) -> Result<(), StoreError> {
            Err(StoreError::Timeout)
        }

        fn delete(&self, _key: &u64) -> Result<(), StoreError> {
            Err(StoreError::Timeout)
        }

        fn cleanup(&self, _max_age: Duration) -> Result<usize, StoreError> {
            Err(StoreError::Timeout)
        }

        fn flush(&self) -> Result<usize, StoreError> {
            Err(StoreError::Timeout)
        }

        fn len(&self) -> Result<usize, StoreError> {
            Err(StoreError::Timeout)
        }

        fn close(&self) -> Result<(), StoreError> {
            Err(StoreError::Backend("close failed".to_string()))
        }
    }

    fn memory() -> FifoCache<u64, u64> {
        FifoCache::new(100, None)
    }

    #[test]
    fn test_memory_only_roundtrip() {
        let cache = TieredCache::new(memory(), NullStore);

        cache.set(1, 10, None).unwrap();
        assert_eq!(cache.get(&1).unwrap(), Some(10));
        assert_eq!(cache.len(), 1);

        cache.delete(&1).unwrap();
        assert_eq!(cache.get(&1).unwrap(), None);
    }

    #[test]
    fn test_read_through_warms_memory() {
        let store = MapStore::default();
        store.set(&1, &10, None).unwrap();
        let cache = TieredCache::new(memory(), store);

        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get(&1).unwrap(), Some(10));
        // Now served from memory.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory().get(&1), Some(10));
    }

    #[test]
    fn test_set_survives_store_failure() {
        let cache = TieredCache::new(memory(), FailingStore);

        let result = cache.set(1, 10, None);
        assert!(matches!(result, Err(StoreError::Timeout)));
        // Memory was updated before the store failed.
        assert_eq!(cache.get(&1).unwrap(), Some(10));
    }

    #[test]
    fn test_delete_clears_memory_despite_store_failure() {
        let cache = TieredCache::new(memory(), FailingStore);

        let _ = cache.set(1, 10, None);
        let result = cache.delete(&1);
        assert!(result.is_err());
        assert_eq!(cache.memory().get(&1), None);
    }

    #[test]
    fn test_get_miss_surfaces_store_error() {
        let cache = TieredCache::new(memory(), FailingStore);

        assert!(matches!(cache.get(&1), Err(StoreError::Timeout)));
    }

    #[test]
    fn test_flush_empties_memory_despite_store_failure() {
        let cache = TieredCache::new(memory(), FailingStore);

        let _ = cache.set(1, 10, None);
        assert!(cache.flush().is_err());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_flush_counts_both_tiers() {
        let store = MapStore::default();
        store.set(&1, &10, None).unwrap();
        store.set(&2, &20, None).unwrap();
        let cache = TieredCache::new(memory(), store);

        cache.set(3, 30, None).unwrap();
        // Memory holds one entry, the store holds three (1, 2, and 3).
        assert_eq!(cache.flush().unwrap(), 4);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.store().len().unwrap(), 0);
    }

    #[test]
    fn test_set_async_updates_memory_synchronously() {
        let cache = TieredCache::new(memory(), MapStore::default());

        cache.set_async(1, 10, None).unwrap();
        assert_eq!(cache.memory().get(&1), Some(10));

        // The background write lands eventually.
        for _ in 0..50 {
            if cache.store().get(&1).unwrap().is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(cache.store().get(&1).unwrap(), Some((10, None)));
    }

    #[test]
    fn test_set_async_store_failure_is_not_returned() {
        let cache = TieredCache::new(memory(), FailingStore);

        cache.set_async(1, 10, None).unwrap();
        assert_eq!(cache.memory().get(&1), Some(10));
    }

    #[test]
    fn test_store_expiry_respected_after_read_through() {
        let store = MapStore::default();
        let past = SystemTime::now() - Duration::from_secs(60);
        store.set(&1, &10, Some(past)).unwrap();
        let cache = TieredCache::new(memory(), store);

        // The store returns the entry; memory caches it already expired,
        // so the memory layer will not serve it.
        assert_eq!(cache.get(&1).unwrap(), Some(10));
        assert_eq!(cache.memory().get(&1), None);
    }

    #[test]
    fn test_close_propagates_store_error() {
        let cache = TieredCache::new(memory(), FailingStore);
        assert!(cache.close().is_err());
    }
}
