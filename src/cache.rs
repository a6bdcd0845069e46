//! Sharded cache engine: routing, capacity accounting, and the public API.
//!
//! The engine owns a power-of-two array of shards and routes every
//! operation by the low bits of the key's hash. A single atomic counter
//! tracks live queued entries across all shards and gates the transition
//! from warmup admission to steady-state eviction. `fetch` layers the
//! singleflight protocol over the same shards.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::entry::unix_nanos;
use crate::error::{BoxedError, FetchError};
use crate::hash::hash_key;
use crate::shard::{EngineShared, Shard};
use crate::singleflight::FlightMap;

/// Hard ceiling on the shard count.
const MAX_SHARDS: usize = 2048;

/// Capacity used when none (or zero) is configured.
const DEFAULT_CAPACITY: usize = 16384;

/// Largest power of two less than or equal to `n`. `n` must be nonzero.
#[inline]
fn floor_pow2(n: usize) -> usize {
    1usize << (usize::BITS - 1 - n.leading_zeros())
}

/// Shard count balancing lock contention against per-shard queue depth:
/// enough shards to spread writers, few enough that each shard's queues
/// stay deep enough for the eviction policy to rank entries.
fn shard_count_for(capacity: usize) -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let n = (parallelism * 16)
        .max(capacity / 256)
        .min((capacity / 1024).max(1))
        .min(MAX_SHARDS);
    floor_pow2(n.max(1))
}

/// Sharded in-process key-value cache with S3-FIFO eviction, optional
/// per-entry expiry, and singleflight loading.
///
/// Reads are lock-free: a hit touches the concurrent map and the entry's
/// atomics only. Writes serialize on the owning shard's writer lock, which
/// also covers admission and eviction. The capacity bound is approximate:
/// `len()` can exceed the configured capacity by at most the death-row
/// allowance (`shard_count × 8`).
///
/// # Example
///
/// ```
/// use fifo_cache::FifoCache;
///
/// let cache: FifoCache<String, u64> = FifoCache::builder().capacity(1024).build();
/// cache.set("answer".to_string(), 42, None);
/// assert_eq!(cache.get(&"answer".to_string()), Some(42));
/// ```
pub struct FifoCache<K, V> {
    shards: Box<[Shard<K, V>]>,
    shard_mask: u64,
    shared: Arc<EngineShared>,
    default_ttl: Option<Duration>,
    flights: FlightMap<K, V>,
}

impl<K, V> FifoCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache with the given capacity and default TTL.
    ///
    /// A zero capacity falls back to the default of 16384. `None` TTL means
    /// entries never expire unless `set` is given one.
    pub fn new(capacity: usize, default_ttl: Option<Duration>) -> Self {
        let mut builder = FifoCacheBuilder::new().capacity(capacity);
        if let Some(ttl) = default_ttl {
            builder = builder.default_ttl(ttl);
        }
        builder.build()
    }

    /// Create a new builder.
    pub fn builder() -> FifoCacheBuilder<K, V> {
        FifoCacheBuilder::new()
    }

    #[inline]
    fn shard_for(&self, hash: u64) -> &Shard<K, V> {
        &self.shards[(hash & self.shard_mask) as usize]
    }

    /// Resolve a per-call TTL against the default and turn it into an
    /// absolute expiry in nanoseconds since epoch (0 = never).
    fn expiry_nanos(&self, ttl: Option<Duration>) -> u64 {
        let ttl = match ttl {
            Some(ttl) if !ttl.is_zero() => Some(ttl),
            _ => self.default_ttl,
        };
        match ttl {
            Some(ttl) if !ttl.is_zero() => {
                let nanos = u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX);
                unix_nanos().saturating_add(nanos)
            }
            _ => 0,
        }
    }

    /// Look up a key, bumping its frequency on a hit.
    ///
    /// Expired entries are misses (and stay until naturally evicted);
    /// pending evictees are resurrected. Never blocks on I/O.
    pub fn get(&self, key: &K) -> Option<V> {
        let hash = hash_key(key);
        self.shard_for(hash).get(key)
    }

    /// Insert or overwrite a key.
    ///
    /// `None` (or zero) TTL means the default TTL; with no default the
    /// entry never expires. Overwriting an existing key keeps its position
    /// in the eviction structures.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let hash = hash_key(&key);
        let expiry = self.expiry_nanos(ttl);
        self.shard_for(hash).set(key, value, expiry, hash);
    }

    /// Insert with a precomputed absolute expiry (nanoseconds since epoch,
    /// 0 = never). Used by the tiered wrapper to honor store expiries.
    pub(crate) fn set_at(&self, key: K, value: V, expiry: u64) {
        let hash = hash_key(&key);
        self.shard_for(hash).set(key, value, expiry, hash);
    }

    /// Resolve a TTL the way [`set`](Self::set) would, exposing the
    /// absolute expiry to the tiered wrapper.
    pub(crate) fn expiry_nanos_for(&self, ttl: Option<Duration>) -> u64 {
        self.expiry_nanos(ttl)
    }

    /// Insert only if the key is absent (or expired).
    ///
    /// Returns the surviving value and `true` when an existing entry
    /// supplied it, or the new value and `false` when this call inserted.
    pub fn set_if_absent(&self, key: K, value: V, ttl: Option<Duration>) -> (V, bool) {
        let hash = hash_key(&key);
        let expiry = self.expiry_nanos(ttl);
        self.shard_for(hash).set_if_absent(key, value, expiry, hash)
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &K) -> bool {
        let hash = hash_key(key);
        self.shard_for(hash).delete(key)
    }

    /// Read through the cache, deduplicating concurrent loads per key.
    ///
    /// On a miss, concurrent callers coalesce onto one loader invocation
    /// run on the leader's thread; every caller receives the same value or
    /// the same error. Successful results are cached under the default TTL;
    /// errors are returned verbatim and never cached.
    pub fn fetch<F>(&self, key: K, loader: F) -> Result<V, FetchError>
    where
        F: FnOnce() -> Result<V, BoxedError>,
    {
        self.fetch_inner(key, None, loader)
    }

    /// [`fetch`](Self::fetch) with an explicit TTL for a loaded value.
    pub fn fetch_with_ttl<F>(&self, key: K, ttl: Duration, loader: F) -> Result<V, FetchError>
    where
        F: FnOnce() -> Result<V, BoxedError>,
    {
        self.fetch_inner(key, Some(ttl), loader)
    }

    fn fetch_inner<F>(&self, key: K, ttl: Option<Duration>, loader: F) -> Result<V, FetchError>
    where
        F: FnOnce() -> Result<V, BoxedError>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let (flight, leader) = self.flights.join(key.clone());
        if !leader {
            return flight.wait();
        }
        let guard = self.flights.guard(key.clone(), flight);

        // Re-check now that the flight record is visible: a set landing
        // between the first read and the join must win, not be lost.
        if let Some(value) = self.get(&key) {
            guard.complete(Ok(value.clone()));
            return Ok(value);
        }

        match loader() {
            Ok(value) => {
                self.set(key, value.clone(), ttl);
                guard.complete(Ok(value.clone()));
                Ok(value)
            }
            Err(err) => {
                let err = FetchError::from_loader(err);
                guard.complete(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Number of reachable entries. An approximate bound: lazily expired
    /// and death-row entries are included until they leave the map.
    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of shards (a power of two in `[1, 2048]`).
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Remove every entry, returning how many were removed.
    pub fn flush(&self) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            removed += shard.flush();
        }
        self.shared.total_entries.store(0, Ordering::Relaxed);
        removed
    }

    /// Iterate key-value pairs of all non-expired entries.
    ///
    /// Order is unspecified; concurrent modifications may or may not be
    /// observed. Values are read atomically with respect to concurrent
    /// `set`s on the same key.
    pub fn iter(&self) -> impl Iterator<Item = (K, V)> + '_ {
        let now = unix_nanos();
        self.shards.iter().flat_map(move |shard| shard.iter_live(now))
    }
}

/// Builder for [`FifoCache`].
pub struct FifoCacheBuilder<K, V> {
    capacity: usize,
    default_ttl: Option<Duration>,
    shards: Option<usize>,
    _marker: std::marker::PhantomData<fn() -> (K, V)>,
}

impl<K, V> Default for FifoCacheBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FifoCacheBuilder<K, V> {
    /// Create a builder with the default capacity (16384), no default TTL,
    /// and an automatically sized shard array.
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            default_ttl: None,
            shards: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Maximum number of entries held across all shards (approximately).
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// TTL applied when `set` receives none. Without one, such entries
    /// never expire.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Override the shard count. Rounded down to a power of two and clamped
    /// to `[1, 2048]`.
    pub fn shards(mut self, count: usize) -> Self {
        self.shards = Some(count);
        self
    }

    /// Build the cache.
    pub fn build(self) -> FifoCache<K, V>
    where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        let capacity = if self.capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            self.capacity
        };

        let shard_count = match self.shards {
            Some(count) => floor_pow2(count.clamp(1, MAX_SHARDS)),
            None => shard_count_for(capacity),
        };
        let shard_capacity = capacity.div_ceil(shard_count);

        let shared = Arc::new(EngineShared {
            total_entries: AtomicI64::new(0),
            capacity,
        });

        let shards: Box<[Shard<K, V>]> = (0..shard_count)
            .map(|_| Shard::new(shard_capacity, Arc::clone(&shared)))
            .collect();

        FifoCache {
            shards,
            shard_mask: (shard_count - 1) as u64,
            shared,
            default_ttl: self.default_ttl,
            flights: FlightMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn small_cache(capacity: usize) -> FifoCache<u64, u64> {
        FifoCache::builder().capacity(capacity).shards(1).build()
    }

    #[test]
    fn test_set_get_delete() {
        let cache: FifoCache<String, u64> = FifoCache::builder().capacity(1000).build();

        cache.set("a".to_string(), 1, None);
        cache.set("b".to_string(), 2, None);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), Some(2));
        assert_eq!(cache.get(&"missing".to_string()), None);
        assert_eq!(cache.len(), 2);

        assert!(cache.delete(&"a".to_string()));
        assert!(!cache.delete(&"a".to_string()));
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_overwrite_returns_latest() {
        let cache = small_cache(100);

        cache.set(1, 10, None);
        cache.set(1, 20, None);
        assert_eq!(cache.get(&1), Some(20));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_zero_capacity_uses_default() {
        let cache: FifoCache<u64, u64> = FifoCache::new(0, None);
        assert_eq!(cache.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn test_shard_count_is_power_of_two_in_range() {
        for capacity in [1, 100, 1000, 16384, 1_000_000, 10_000_000] {
            let cache: FifoCache<u64, u64> = FifoCache::new(capacity, None);
            let count = cache.shard_count();
            assert!(count.is_power_of_two(), "capacity {capacity}: {count}");
            assert!((1..=MAX_SHARDS).contains(&count), "capacity {capacity}: {count}");
        }
    }

    #[test]
    fn test_small_capacity_gets_one_shard() {
        // capacity / 1024 caps the count at one for small caches.
        let cache: FifoCache<u64, u64> = FifoCache::new(1000, None);
        assert_eq!(cache.shard_count(), 1);
    }

    #[test]
    fn test_shards_override_rounds_down() {
        let cache: FifoCache<u64, u64> =
            FifoCache::builder().capacity(1 << 20).shards(3).build();
        assert_eq!(cache.shard_count(), 2);

        let cache: FifoCache<u64, u64> =
            FifoCache::builder().capacity(1 << 20).shards(100_000).build();
        assert_eq!(cache.shard_count(), MAX_SHARDS);
    }

    #[test]
    fn test_capacity_bound_after_overfill() {
        let cache = small_cache(100);

        for key in 0..101 {
            cache.set(key, key, None);
        }
        assert!(cache.len() <= 100 + 8, "len {}", cache.len());
    }

    #[test]
    fn test_default_ttl_expires() {
        let cache: FifoCache<u64, u64> = FifoCache::builder()
            .capacity(100)
            .default_ttl(Duration::from_millis(30))
            .build();

        cache.set(1, 10, None);
        assert_eq!(cache.get(&1), Some(10));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_explicit_ttl_overrides_default() {
        let cache: FifoCache<u64, u64> = FifoCache::builder()
            .capacity(100)
            .default_ttl(Duration::from_secs(3600))
            .build();

        cache.set(1, 10, Some(Duration::from_millis(30)));
        assert_eq!(cache.get(&1), Some(10));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_zero_ttl_means_default() {
        let cache: FifoCache<u64, u64> = FifoCache::new(100, None);

        cache.set(1, 10, Some(Duration::ZERO));
        // No default either: never expires.
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get(&1), Some(10));
    }

    #[test]
    fn test_flush() {
        let cache: FifoCache<u64, u64> = FifoCache::new(1000, None);

        for key in 0..10 {
            cache.set(key, key, None);
        }
        assert_eq!(cache.flush(), 10);
        assert_eq!(cache.len(), 0);
        assert!(cache.is_empty());

        cache.set(1, 1, None);
        assert_eq!(cache.get(&1), Some(1));
    }

    #[test]
    fn test_iter_skips_expired() {
        let cache: FifoCache<u64, u64> = FifoCache::new(100, None);

        cache.set(1, 10, None);
        cache.set(2, 20, Some(Duration::from_nanos(1)));
        std::thread::sleep(Duration::from_millis(5));

        let items: Vec<_> = cache.iter().collect();
        assert_eq!(items, vec![(1, 10)]);
        // The expired entry still occupies the map until evicted.
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_set_if_absent() {
        let cache: FifoCache<u64, u64> = FifoCache::new(100, None);

        assert_eq!(cache.set_if_absent(1, 10, None), (10, false));
        assert_eq!(cache.set_if_absent(1, 20, None), (10, true));
        assert_eq!(cache.get(&1), Some(10));
    }

    #[test]
    fn test_fetch_loads_once_and_caches() {
        let cache: FifoCache<u64, u64> = FifoCache::new(100, None);
        let calls = AtomicUsize::new(0);

        let value = cache
            .fetch(1, || {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(42)
            })
            .unwrap();
        assert_eq!(value, 42);

        let value = cache
            .fetch(1, || {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(99)
            })
            .unwrap();
        assert_eq!(value, 42, "second fetch must hit the cache");
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_fetch_error_not_cached() {
        let cache: FifoCache<u64, u64> = FifoCache::new(100, None);
        let calls = AtomicUsize::new(0);

        let result = cache.fetch(1, || {
            calls.fetch_add(1, Ordering::Relaxed);
            Err("upstream down".into())
        });
        assert!(matches!(result, Err(FetchError::Loader(_))));
        assert_eq!(cache.get(&1), None);

        let value = cache
            .fetch(1, || {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(7)
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_fetch_with_ttl_expires() {
        let cache: FifoCache<u64, u64> = FifoCache::new(100, None);

        let value = cache
            .fetch_with_ttl(1, Duration::from_millis(30), || Ok(42))
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(cache.get(&1), Some(42));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_fetch_panic_cleans_up() {
        let cache: std::sync::Arc<FifoCache<u64, u64>> =
            std::sync::Arc::new(FifoCache::new(100, None));

        let panicking = std::sync::Arc::clone(&cache);
        let result = std::thread::spawn(move || {
            panicking.fetch(1, || panic!("loader exploded"))
        })
        .join();
        assert!(result.is_err(), "panic must propagate on the leader");

        // The flight record is gone: a fresh fetch runs a fresh loader.
        let value = cache.fetch(1, || Ok(5)).unwrap();
        assert_eq!(value, 5);
    }
}
