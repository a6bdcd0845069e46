//! Cache entry: a key-value pair with eviction metadata.
//!
//! The value lives in an atomic snapshot cell ([`ArcSwap`]): a writer
//! publishes a fresh snapshot and readers load whichever snapshot is
//! current, without locks and without ever observing a torn value. The
//! frequency counters and state flags are plain atomics so the read path
//! can bump and inspect them with no shard lock held.
//!
//! Exactly one of `in_small`, in-main (both flags clear), or `on_death_row`
//! describes an entry that is reachable through its shard's map.

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::list::NIL;

/// Frequency counter cap. The published algorithm uses 3; 7 measured better
/// on skewed workloads.
pub(crate) const MAX_FREQ: u32 = 7;

/// Nanoseconds since the Unix epoch.
#[inline]
pub(crate) fn unix_nanos() -> u64 {
    clocksource::precise::UnixInstant::now()
        .duration_since(clocksource::precise::UnixInstant::EPOCH)
        .as_nanos()
}

/// A cached key-value pair with eviction metadata.
pub(crate) struct Entry<K, V> {
    key: K,
    /// Cached key hash; avoids re-hashing on eviction and ghost recording.
    hash: u64,
    value: ArcSwap<V>,
    /// Expiry in nanoseconds since epoch; 0 means no expiry.
    expiry: AtomicU64,
    /// Access count, capped at [`MAX_FREQ`].
    freq: AtomicU32,
    /// Highest frequency ever observed, for ghost restore.
    peak_freq: AtomicU32,
    in_small: AtomicBool,
    /// Pending eviction; resurrectable on access.
    on_death_row: AtomicBool,
    /// Arena slot of this entry's queue node; [`NIL`] while unlinked.
    node: AtomicU32,
}

impl<K, V> Entry<K, V> {
    pub fn new(key: K, hash: u64, value: V, expiry: u64) -> Self {
        Self {
            key,
            hash,
            value: ArcSwap::from_pointee(value),
            expiry: AtomicU64::new(expiry),
            freq: AtomicU32::new(0),
            peak_freq: AtomicU32::new(0),
            in_small: AtomicBool::new(false),
            on_death_row: AtomicBool::new(false),
            node: AtomicU32::new(NIL),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Publish a new value snapshot.
    pub fn store_value(&self, value: V) {
        self.value.store(Arc::new(value));
    }

    pub fn expiry(&self) -> u64 {
        self.expiry.load(Ordering::Relaxed)
    }

    pub fn set_expiry(&self, expiry: u64) {
        self.expiry.store(expiry, Ordering::Relaxed);
    }

    /// Lazy-expiry predicate against a caller-sampled clock.
    pub fn is_expired(&self, now: u64) -> bool {
        let expiry = self.expiry();
        expiry != 0 && now > expiry
    }

    /// Bump the frequency counter, capped at [`MAX_FREQ`], lifting the peak
    /// if the new frequency exceeds it.
    pub fn record_access(&self) {
        let mut freq = self.freq.load(Ordering::Relaxed);
        while freq < MAX_FREQ {
            match self.freq.compare_exchange_weak(
                freq,
                freq + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.peak_freq.fetch_max(freq + 1, Ordering::Relaxed);
                    return;
                }
                Err(current) => freq = current,
            }
        }
    }

    pub fn freq(&self) -> u32 {
        self.freq.load(Ordering::Relaxed)
    }

    pub fn set_freq(&self, freq: u32) {
        self.freq.store(freq, Ordering::Relaxed);
    }

    pub fn peak_freq(&self) -> u32 {
        self.peak_freq.load(Ordering::Relaxed)
    }

    pub fn set_peak_freq(&self, freq: u32) {
        self.peak_freq.store(freq, Ordering::Relaxed);
    }

    pub fn in_small(&self) -> bool {
        self.in_small.load(Ordering::Relaxed)
    }

    pub fn set_in_small(&self, in_small: bool) {
        self.in_small.store(in_small, Ordering::Relaxed);
    }

    pub fn on_death_row(&self) -> bool {
        self.on_death_row.load(Ordering::Acquire)
    }

    pub fn set_on_death_row(&self, on_death_row: bool) {
        self.on_death_row.store(on_death_row, Ordering::Release);
    }

    pub fn node(&self) -> u32 {
        self.node.load(Ordering::Relaxed)
    }

    pub fn set_node(&self, idx: u32) {
        self.node.store(idx, Ordering::Relaxed);
    }
}

impl<K, V: Clone> Entry<K, V> {
    /// Clone the current value snapshot.
    pub fn load_value(&self) -> V {
        (**self.value.load()).clone()
    }
}
