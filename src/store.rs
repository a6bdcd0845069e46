//! Persistence backend contract for tiered caches.
//!
//! The engine itself is memory-only; a [`Store`] is the interface a
//! durable backend implements so [`TieredCache`] can layer the engine over
//! it. Backends own their I/O, timeouts, and key constraints; the tiered
//! wrapper guarantees the in-memory state is updated first and never rolled
//! back on store failure.
//!
//! [`TieredCache`]: crate::TieredCache

use std::time::{Duration, SystemTime};

use thiserror::Error;

/// Errors surfaced by persistence backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key cannot be persisted by this backend (length, path safety).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Underlying I/O failure.
    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The backend did not respond in time.
    #[error("store timeout")]
    Timeout,

    /// Backend-specific failure.
    #[error("store backend: {0}")]
    Backend(String),
}

/// A durable backend for a tiered cache.
///
/// All operations are synchronous from the engine's point of view;
/// implementations apply their own timeouts. Cancellation must never leave
/// the backend unable to serve subsequent calls.
pub trait Store<K, V>: Send + Sync {
    /// Reject keys this backend cannot persist. Called before any I/O.
    fn validate_key(&self, key: &K) -> Result<(), StoreError>;

    /// Read a value and its absolute expiry. `Ok(None)` is a clean miss.
    fn get(&self, key: &K) -> Result<Option<(V, Option<SystemTime>)>, StoreError>;

    /// Write a value with an optional absolute expiry.
    fn set(&self, key: &K, value: &V, expiry: Option<SystemTime>) -> Result<(), StoreError>;

    /// Delete a key. Deleting an absent key is not an error.
    fn delete(&self, key: &K) -> Result<(), StoreError>;

    /// Remove entries older than `max_age`, returning how many went.
    /// Runs as a background janitor, uncoordinated with the memory engine.
    fn cleanup(&self, max_age: Duration) -> Result<usize, StoreError>;

    /// Remove everything, returning how many entries went.
    fn flush(&self) -> Result<usize, StoreError>;

    /// Store-side entry count, independent of the memory engine.
    fn len(&self) -> Result<usize, StoreError>;

    /// Release backend resources.
    fn close(&self) -> Result<(), StoreError>;
}

/// A backend that persists nothing.
///
/// Every read misses and every write succeeds; useful for tests and for
/// running tiered call sites memory-only.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullStore;

impl<K, V> Store<K, V> for NullStore {
    fn validate_key(&self, _key: &K) -> Result<(), StoreError> {
        Ok(())
    }

    fn get(&self, _key: &K) -> Result<Option<(V, Option<SystemTime>)>, StoreError> {
        Ok(None)
    }

    fn set(&self, _key: &K, _value: &V, _expiry: Option<SystemTime>) -> Result<(), StoreError> {
        Ok(())
    }

    fn delete(&self, _key: &K) -> Result<(), StoreError> {
        Ok(())
    }

    fn cleanup(&self, _max_age: Duration) -> Result<usize, StoreError> {
        Ok(0)
    }

    fn flush(&self) -> Result<usize, StoreError> {
        Ok(0)
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(0)
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
