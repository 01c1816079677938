//! Error types for the stashkit library.
//!
//! ## Key Components
//!
//! - [`CacheError`]: Returned by engine and storage operations. Cloneable so
//!   that a single storage failure can be broadcast to every caller that was
//!   coalesced onto the same in-flight load or save (sources are wrapped in
//!   `Arc` for that reason).
//!
//! ## Example Usage
//!
//! ```
//! use stashkit::error::CacheError;
//!
//! let err = CacheError::from(std::io::Error::other("disk gone"));
//! assert!(err.to_string().contains("disk gone"));
//!
//! // Errors clone cheaply for broadcast to coalesced waiters.
//! let broadcast = err.clone();
//! assert_eq!(err.to_string(), broadcast.to_string());
//! ```

use std::sync::Arc;

use thiserror::Error;

/// Error produced by cache engine and storage operations.
///
/// All heavyweight sources (`std::io::Error`, `serde_json::Error`, producer
/// failures) are held behind `Arc`, making the whole enum `Clone`. The engine
/// relies on this: when concurrent `load`/`save` calls are collapsed onto one
/// storage operation, the same failure is handed to every waiter.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CacheError {
    /// Storage I/O failed during a load or save.
    #[error("storage i/o failed: {0}")]
    Io(Arc<std::io::Error>),

    /// A persisted record could not be decoded.
    #[error("record decoding failed at line {line}: {cause}")]
    Decode {
        /// 1-based line number in the backing resource.
        line: usize,
        /// Underlying serde failure.
        cause: Arc<serde_json::Error>,
    },

    /// A record could not be encoded for persistence.
    #[error("record encoding failed: {0}")]
    Encode(Arc<serde_json::Error>),

    /// The producer passed to `compute` failed; nothing was written.
    #[error("value producer failed: {0}")]
    Producer(Arc<dyn std::error::Error + Send + Sync>),

    /// An in-flight load/save was dropped before signalling completion.
    ///
    /// Only observable if the task driving the operation is aborted, which
    /// the engine itself never does.
    #[error("in-flight operation was dropped before completing")]
    Interrupted,
}

impl CacheError {
    /// Wraps an arbitrary error as a [`CacheError::Producer`] failure.
    ///
    /// # Example
    ///
    /// ```
    /// use stashkit::error::CacheError;
    ///
    /// let err = CacheError::producer(std::io::Error::other("db offline"));
    /// assert!(matches!(err, CacheError::Producer(_)));
    /// ```
    pub fn producer<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CacheError::Producer(Arc::new(err))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Arc::new(err))
    }
}
