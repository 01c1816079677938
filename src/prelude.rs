//! Convenience re-exports for typical usage.
//!
//! ```
//! use stashkit::prelude::*;
//! ```

pub use crate::builder::MemoryCacheBuilder;
pub use crate::cache::{CacheConfig, MemoryCache};
pub use crate::error::CacheError;
pub use crate::policy::{NoEviction, TtlExpiry, TtlOptions, TtlPolicy, TtlState};
pub use crate::record::{CacheOptions, Change, ReadOptions, Record, WriteOptions};
pub use crate::store::{FileStorage, MemoryStorage};
pub use crate::traits::{EvictionPolicy, EvictionSink, Storage};
