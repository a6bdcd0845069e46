//! Error types for cache operations.
//!
//! The in-memory operations are infallible; only [`FifoCache::fetch`] can
//! fail, and only with the loader's own error. Loader errors are delivered
//! to every caller waiting on the same flight and are never cached.
//!
//! [`FifoCache::fetch`]: crate::FifoCache::fetch

use std::fmt;
use std::sync::Arc;

/// Boxed error type accepted from loaders.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by `fetch` and `fetch_with_ttl`.
///
/// Cloneable so one loader failure can be handed to every waiter of the
/// flight that produced it.
#[derive(Clone, Debug)]
pub enum FetchError {
    /// The loader returned an error, carried verbatim.
    Loader(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// The loader panicked before producing a value. Observed by followers
    /// of a flight whose leader unwound; the panic itself propagates on the
    /// leader's thread.
    LoaderPanicked,
}

impl FetchError {
    pub(crate) fn from_loader(err: BoxedError) -> Self {
        Self::Loader(Arc::from(err))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loader(err) => write!(f, "loader failed: {err}"),
            Self::LoaderPanicked => write!(f, "loader panicked"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Loader(err) => Some(err.as_ref()),
            Self::LoaderPanicked => None,
        }
    }
}
