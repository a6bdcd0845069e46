//! Cache shard: one partition of the keyspace with its own eviction state.
//!
//! Each shard owns a concurrent entries map plus a writer-locked eviction
//! state: the node arena, the small and main queues, the rotating ghost
//! bloom pair, the ghost frequency ring, and the death row. Reads go
//! straight to the map and entry atomics without taking the shard lock;
//! admission, eviction, resurrection, delete, and flush serialize on the
//! writer lock.
//!
//! The eviction policy is S3-FIFO with three tuned deviations:
//!
//! - entries leaving the main queue with a hot history (`peak_freq >= 4`)
//!   are demoted back to the small queue instead of evicted;
//! - evictees pass through a small death row and can be resurrected by a
//!   `get` before they are displaced;
//! - ghost-hit readmissions restore the key's recorded peak frequency so a
//!   returning hot key does not restart cold.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::bloom::BloomFilter;
use crate::entry::{Entry, unix_nanos};
use crate::ghost::GhostRing;
use crate::hash::WyHashBuilder;
use crate::list::{IndexList, NIL, NodeArena};

/// Small-queue admission target, per-mille of shard capacity.
pub(crate) const SMALL_QUEUE_PERMILLE: usize = 247;

/// Main-queue occupancy that triggers eviction during promotion, per-mille
/// of shard capacity.
const MAIN_TARGET_PERMILLE: usize = 900;

/// Ghost bloom filter false-positive rate.
const GHOST_FP_RATE: f64 = 0.00001;

/// Number of pending evictions held for resurrection.
pub(crate) const DEATH_ROW_SIZE: usize = 8;

/// Peak frequency at which a cold main-queue head is demoted to the small
/// queue instead of evicted. Deliberately distinct from `MAX_FREQ`.
const HOT_PEAK_THRESHOLD: u32 = 4;

/// Frequency granted to an entry resurrected from the death row, protecting
/// it from immediate re-eviction.
const RESURRECT_FREQ: u32 = 3;

/// State shared by every shard of one engine.
pub(crate) struct EngineShared {
    /// Live entries across all queues of all shards. Paired one-for-one
    /// with admission and eviction edges.
    pub total_entries: AtomicI64,
    /// Configured engine capacity; gates warmup and admission.
    pub capacity: usize,
}

/// Eviction bookkeeping, guarded by the shard writer lock.
struct EvictionState<K, V> {
    arena: NodeArena<Arc<Entry<K, V>>>,
    small: IndexList,
    main: IndexList,
    ghost_active: BloomFilter,
    ghost_aging: BloomFilter,
    ghost_freqs: GhostRing,
    ghost_cap: usize,
    death_row: [Option<Arc<Entry<K, V>>>; DEATH_ROW_SIZE],
    death_row_pos: usize,
    /// Set once the engine first reaches capacity; never cleared.
    warm: bool,
}

/// One partition of the cache.
pub(crate) struct Shard<K, V> {
    entries: DashMap<K, Arc<Entry<K, V>>, WyHashBuilder>,
    state: RwLock<EvictionState<K, V>>,
    shared: Arc<EngineShared>,
    capacity: usize,
    small_target: usize,
}

impl<K, V> Shard<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, shared: Arc<EngineShared>) -> Self {
        Self {
            entries: DashMap::with_capacity_and_hasher(capacity, WyHashBuilder),
            state: RwLock::new(EvictionState {
                arena: NodeArena::with_capacity(capacity),
                small: IndexList::new(),
                main: IndexList::new(),
                ghost_active: BloomFilter::new(capacity, GHOST_FP_RATE),
                ghost_aging: BloomFilter::new(capacity, GHOST_FP_RATE),
                ghost_freqs: GhostRing::new(),
                ghost_cap: capacity,
                death_row: [const { None }; DEATH_ROW_SIZE],
                death_row_pos: 0,
                warm: false,
            }),
            shared,
            capacity,
            small_target: capacity * SMALL_QUEUE_PERMILLE / 1000,
        }
    }

    /// Look up a key without taking the shard lock.
    ///
    /// Death-row hits divert to [`Self::resurrect`]; expired entries are
    /// misses but stay in place until naturally evicted.
    pub fn get(&self, key: &K) -> Option<V> {
        let ent = {
            let guard = self.entries.get(key)?;
            Arc::clone(guard.value())
        };

        if ent.on_death_row() {
            return self.resurrect(key);
        }

        let expiry = ent.expiry();
        if expiry != 0 && unix_nanos() > expiry {
            return None;
        }

        ent.record_access();
        Some(ent.load_value())
    }

    /// Bring a pending-eviction entry back to the main queue.
    ///
    /// Racing callers may find the entry already resurrected (return the
    /// winner's value) or already displaced (miss).
    fn resurrect(&self, key: &K) -> Option<V> {
        let mut state = self.state.write();

        let ent = {
            let guard = self.entries.get(key)?;
            Arc::clone(guard.value())
        };
        if !ent.on_death_row() {
            return Some(ent.load_value());
        }

        let st = &mut *state;
        for slot in st.death_row.iter_mut() {
            if slot.as_ref().is_some_and(|pending| Arc::ptr_eq(pending, &ent)) {
                *slot = None;
                break;
            }
        }

        ent.set_on_death_row(false);
        ent.set_in_small(false);
        ent.set_freq(RESURRECT_FREQ);
        ent.set_peak_freq(RESURRECT_FREQ);

        let idx = st.arena.insert(Arc::clone(&ent));
        ent.set_node(idx);
        st.main.push_back(&mut st.arena, idx);
        self.shared.total_entries.fetch_add(1, Ordering::Relaxed);

        Some(ent.load_value())
    }

    /// Insert or overwrite a key. `expiry` is nanoseconds since epoch, 0
    /// for none; `hash` is the key's cached hash.
    pub fn set(&self, key: K, value: V, expiry: u64, hash: u64) {
        let mut state = self.state.write();

        // Overwrite in place; the entry keeps its queue position.
        if let Some(guard) = self.entries.get(&key) {
            let ent = Arc::clone(guard.value());
            drop(guard);
            ent.store_value(value);
            ent.set_expiry(expiry);
            ent.record_access();
            return;
        }

        let ent = Arc::new(Entry::new(key.clone(), hash, value, expiry));
        self.admit(&mut state, key, ent, hash);
    }

    /// Insert only if the key is absent or expired.
    ///
    /// Returns the surviving value and whether an existing entry supplied it.
    pub fn set_if_absent(&self, key: K, value: V, expiry: u64, hash: u64) -> (V, bool) {
        let mut state = self.state.write();

        if let Some(guard) = self.entries.get(&key) {
            let ent = Arc::clone(guard.value());
            drop(guard);
            if ent.is_expired(unix_nanos()) {
                ent.store_value(value.clone());
                ent.set_expiry(expiry);
                return (value, false);
            }
            ent.record_access();
            return (ent.load_value(), true);
        }

        let ent = Arc::new(Entry::new(key.clone(), hash, value.clone(), expiry));
        self.admit(&mut state, key, ent, hash);
        (value, false)
    }

    /// Admission for a key not currently in the map. Holds the writer lock.
    fn admit(&self, state: &mut EvictionState<K, V>, key: K, ent: Arc<Entry<K, V>>, hash: u64) {
        let full =
            self.shared.total_entries.load(Ordering::Relaxed) >= self.shared.capacity as i64;

        // During warmup admission skips eviction and ghost checks entirely;
        // the first time the engine reaches capacity the shard is
        // permanently warm.
        if !state.warm && !full {
            ent.set_in_small(true);
            let idx = state.arena.insert(Arc::clone(&ent));
            ent.set_node(idx);
            state.small.push_back(&mut state.arena, idx);
            self.entries.insert(key, ent);
            self.shared.total_entries.fetch_add(1, Ordering::Relaxed);
            return;
        }
        state.warm = true;

        if full {
            let ghost_hit =
                state.ghost_active.contains(hash) || state.ghost_aging.contains(hash);
            ent.set_in_small(!ghost_hit);

            // A returning key skips the small queue and resumes at its
            // recorded peak.
            if ghost_hit && let Some(peak) = state.ghost_freqs.lookup(hash) {
                ent.set_freq(peak);
                ent.set_peak_freq(peak);
            }

            if state.main.len() > 0 && state.small.len() <= self.small_target {
                self.evict_from_main(state);
            } else if state.small.len() > 0 {
                self.evict_from_small(state);
            }
        } else {
            ent.set_in_small(true);
        }

        let idx = state.arena.insert(Arc::clone(&ent));
        ent.set_node(idx);
        if ent.in_small() {
            state.small.push_back(&mut state.arena, idx);
        } else {
            state.main.push_back(&mut state.arena, idx);
        }
        self.entries.insert(key, ent);
        self.shared.total_entries.fetch_add(1, Ordering::Relaxed);
    }

    /// One round of small-queue eviction: promote warm heads (`freq >= 2`)
    /// until a cold head is sent to the death row or the queue drains.
    fn evict_from_small(&self, state: &mut EvictionState<K, V>) {
        let main_target = self.capacity * MAIN_TARGET_PERMILLE / 1000;

        while let Some(idx) = state.small.head() {
            let freq = match state.arena.get(idx) {
                Some(head) => head.freq(),
                None => break,
            };

            if freq < 2 {
                state.small.remove(&mut state.arena, idx);
                if let Some(ent) = state.arena.remove(idx) {
                    ent.set_node(NIL);
                    self.send_to_death_row(state, ent);
                }
                return;
            }

            // Promote to main; the frequency is spent but the peak survives
            // for ghost restore and hot demotion.
            state.small.remove(&mut state.arena, idx);
            if let Some(ent) = state.arena.get(idx) {
                ent.set_freq(0);
                ent.set_in_small(false);
            }
            state.main.push_back(&mut state.arena, idx);

            if state.main.len() > main_target {
                self.evict_from_main(state);
            }
        }
    }

    /// One round of main-queue eviction: decay-and-requeue warm heads until
    /// a cold head is demoted or sent to the death row, or the queue drains.
    fn evict_from_main(&self, state: &mut EvictionState<K, V>) {
        while let Some(idx) = state.main.head() {
            let (freq, peak) = match state.arena.get(idx) {
                Some(head) => (head.freq(), head.peak_freq()),
                None => break,
            };

            if freq == 0 {
                state.main.remove(&mut state.arena, idx);

                // Once-hot entries get one more pass through the small
                // queue before final eviction.
                if peak >= HOT_PEAK_THRESHOLD {
                    if let Some(ent) = state.arena.get(idx) {
                        ent.set_freq(1);
                        ent.set_in_small(true);
                    }
                    state.small.push_back(&mut state.arena, idx);
                    return;
                }

                if let Some(ent) = state.arena.remove(idx) {
                    ent.set_node(NIL);
                    self.send_to_death_row(state, ent);
                }
                return;
            }

            // Second chance.
            state.main.remove(&mut state.arena, idx);
            if let Some(ent) = state.arena.get(idx) {
                ent.set_freq(freq - 1);
            }
            state.main.push_back(&mut state.arena, idx);
        }
    }

    /// Park an evictee on the death row. If the target slot is occupied,
    /// its previous occupant is truly evicted: removed from the map and
    /// recorded in the ghost structures.
    fn send_to_death_row(&self, state: &mut EvictionState<K, V>, ent: Arc<Entry<K, V>>) {
        if let Some(old) = state.death_row[state.death_row_pos].take() {
            self.entries.remove(old.key());
            old.set_on_death_row(false);
            self.add_to_ghost(state, old.hash(), old.peak_freq());
        }

        ent.set_on_death_row(true);
        state.death_row[state.death_row_pos] = Some(ent);
        state.death_row_pos = (state.death_row_pos + 1) % DEATH_ROW_SIZE;
        self.shared.total_entries.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a truly evicted key for future admission decisions, rotating
    /// the bloom pair once the active filter fills.
    fn add_to_ghost(&self, state: &mut EvictionState<K, V>, hash: u64, peak_freq: u32) {
        if !state.ghost_active.contains(hash) {
            state.ghost_active.add(hash);
            if peak_freq >= 2 {
                state.ghost_freqs.add(hash, peak_freq);
            }
        }
        if state.ghost_active.entries() >= state.ghost_cap {
            state.ghost_aging.reset();
            std::mem::swap(&mut state.ghost_active, &mut state.ghost_aging);
        }
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &K) -> bool {
        let mut state = self.state.write();

        let Some((_, ent)) = self.entries.remove(key) else {
            return false;
        };

        let st = &mut *state;
        if ent.on_death_row() {
            // Already uncounted when it moved to the row; just vacate the
            // slot so it cannot be resurrected or displaced later.
            for slot in st.death_row.iter_mut() {
                if slot.as_ref().is_some_and(|pending| Arc::ptr_eq(pending, &ent)) {
                    *slot = None;
                    break;
                }
            }
            ent.set_on_death_row(false);
        } else {
            let idx = ent.node();
            if idx != NIL {
                if ent.in_small() {
                    st.small.remove(&mut st.arena, idx);
                } else {
                    st.main.remove(&mut st.arena, idx);
                }
                st.arena.remove(idx);
                ent.set_node(NIL);
            }
            self.shared.total_entries.fetch_sub(1, Ordering::Relaxed);
        }
        true
    }

    /// Drop every entry and reset all eviction structures.
    pub fn flush(&self) -> usize {
        let mut state = self.state.write();

        let removed = self.entries.len();
        self.entries.clear();

        let st = &mut *state;
        st.arena.clear();
        st.small.clear();
        st.main.clear();
        st.ghost_active.reset();
        st.ghost_aging.reset();
        st.ghost_freqs.reset();
        for slot in st.death_row.iter_mut() {
            *slot = None;
        }
        st.death_row_pos = 0;

        removed
    }

    /// Number of entries in this shard's map (queued and death-row alike).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Key-value pairs of all non-expired entries, in no particular order.
    /// `now` is the caller-sampled clock for the expiry check.
    pub fn iter_live(&self, now: u64) -> impl Iterator<Item = (K, V)> + '_ {
        self.entries.iter().filter_map(move |entry| {
            if entry.value().is_expired(now) {
                return None;
            }
            Some((entry.key().clone(), entry.value().load_value()))
        })
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self, key: &K) -> Option<EntrySnapshot> {
        let guard = self.entries.get(key)?;
        let ent = guard.value();
        Some(EntrySnapshot {
            freq: ent.freq(),
            peak_freq: ent.peak_freq(),
            in_small: ent.in_small(),
            on_death_row: ent.on_death_row(),
        })
    }

    /// (small, main, occupied death-row slots) lengths.
    #[cfg(test)]
    pub(crate) fn queue_lens(&self) -> (usize, usize, usize) {
        let state = self.state.read();
        let pending = state.death_row.iter().filter(|slot| slot.is_some()).count();
        (state.small.len(), state.main.len(), pending)
    }
}

/// Point-in-time view of an entry's eviction metadata, for tests.
#[cfg(test)]
pub(crate) struct EntrySnapshot {
    pub freq: u32,
    pub peak_freq: u32,
    pub in_small: bool,
    pub on_death_row: bool,
}
