//! Sharded in-process key-value cache with S3-FIFO eviction.
//!
//! This crate provides a bounded-capacity concurrent cache built around
//! the S3-FIFO eviction policy: a small admission queue filters one-hit
//! wonders, a main queue holds promoted entries under a second-chance rule,
//! and a ghost filter of recently evicted keys routes returning keys
//! straight back to the main queue with their old peak frequency restored.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                         FifoCache                            |
//! |                                                              |
//! |  hash(key) & mask                                            |
//! |        |                                                     |
//! |        v                                                     |
//! |  +----------------------- Shard ------------------------+    |
//! |  |  entries: concurrent map  (lock-free reads)          |    |
//! |  |                                                      |    |
//! |  |  +-------------+    promote     +-------------+      |    |
//! |  |  | Small queue | -------------> | Main queue  |      |    |
//! |  |  | (admission) | <------------- | (2nd chance)|      |    |
//! |  |  +------+------+  hot demotion  +------+------+      |    |
//! |  |         |                              |             |    |
//! |  |         +---------> Death row <--------+             |    |
//! |  |                    (resurrectable)                   |    |
//! |  |                         |                            |    |
//! |  |                         v                            |    |
//! |  |            Ghost blooms + frequency ring             |    |
//! |  +------------------------------------------------------+    |
//! |                                                              |
//! |  Singleflight: one loader per key for concurrent fetches     |
//! +--------------------------------------------------------------+
//! ```
//!
//! Reads are lock-free: a hit touches the concurrent map and the entry's
//! atomic counters only, never a shard lock. Writes take the owning shard's
//! writer lock, which also serializes admission, eviction, death-row
//! resurrection, and flush. The capacity bound is approximate to within a
//! small per-shard constant (the death-row allowance).
//!
//! # Example
//!
//! ```
//! use fifo_cache::FifoCache;
//! use std::time::Duration;
//!
//! let cache: FifoCache<String, String> = FifoCache::builder()
//!     .capacity(10_000)
//!     .default_ttl(Duration::from_secs(3600))
//!     .build();
//!
//! cache.set("user:1".to_string(), "alice".to_string(), None);
//! assert_eq!(cache.get(&"user:1".to_string()), Some("alice".to_string()));
//!
//! // Concurrent fetches for the same missing key run the loader once.
//! let profile = cache.fetch("user:2".to_string(), || Ok("bob".to_string()));
//! assert_eq!(profile.unwrap(), "bob");
//! ```
//!
//! For durability, layer the engine over any [`Store`] with
//! [`TieredCache`]: memory is updated first and stays authoritative even
//! when the store fails.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod bloom;
mod cache;
mod entry;
mod error;
mod ghost;
mod hash;
mod list;
mod shard;
mod singleflight;
mod store;
mod tiered;

pub use cache::{FifoCache, FifoCacheBuilder};
pub use error::{BoxedError, FetchError};
pub use hash::{WyHashBuilder, WyHasher};
pub use store::{NullStore, Store, StoreError};
pub use tiered::TieredCache;
