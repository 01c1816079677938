//! Fluent construction for [`MemoryCache`].
//!
//! Thin sugar over [`MemoryCache::with_config`] so callers can toggle the
//! handful of engine knobs without building a [`CacheConfig`] by hand.
//!
//! ## Example
//!
//! ```
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! use std::time::Duration;
//! use stashkit::builder::MemoryCacheBuilder;
//! use stashkit::policy::TtlPolicy;
//! use stashkit::store::MemoryStorage;
//!
//! let cache = MemoryCacheBuilder::new(
//!     MemoryStorage::new(),
//!     TtlPolicy::new(Duration::from_secs(60)),
//! )
//! .save_on_write_debounce(Duration::from_millis(250))
//! .build();
//!
//! cache.load().await.unwrap();
//! cache.set("k", 1).await;
//! assert_eq!(cache.get("k").await.unwrap(), Some(1));
//! # });
//! ```

use std::marker::PhantomData;
use std::time::Duration;

use crate::cache::{CacheConfig, MemoryCache};
use crate::traits::{EvictionPolicy, Storage};

/// Builder for [`MemoryCache`].
pub struct MemoryCacheBuilder<T, P, S> {
    storage: S,
    policy: P,
    config: CacheConfig,
    _marker: PhantomData<fn() -> T>,
}

impl<T, P, S> MemoryCacheBuilder<T, P, S>
where
    T: Clone + Send + Sync + 'static,
    P: EvictionPolicy<T> + 'static,
    S: Storage<T, P::Expiry, P::State> + 'static,
{
    /// Starts a builder from the two required collaborators.
    pub fn new(storage: S, policy: P) -> Self {
        Self {
            storage,
            policy,
            config: CacheConfig::default(),
            _marker: PhantomData,
        }
    }

    /// Whether reads trigger an implicit `load_if_stale`. Default: `true`.
    pub fn load_on_read(mut self, enabled: bool) -> Self {
        self.config.load_on_read = enabled;
        self
    }

    /// Whether writes trigger a `save_if_dirty`. Default: `true`.
    pub fn save_on_write(mut self, enabled: bool) -> Self {
        self.config.save_on_write = enabled;
        self
    }

    /// Delay between a write and its triggered save. Default: zero,
    /// which saves inline as part of the write.
    pub fn save_on_write_debounce(mut self, delay: Duration) -> Self {
        self.config.save_on_write_debounce = delay;
        self
    }

    /// Forbid synchronous reads and writes from calling into storage
    /// themselves. Default: `false`.
    pub fn disable_internal_sync_io(mut self, disabled: bool) -> Self {
        self.config.disable_internal_sync_io = disabled;
        self
    }

    /// Builds the engine.
    pub fn build(self) -> MemoryCache<T, P, S> {
        MemoryCache::with_config(self.storage, self.policy, self.config)
    }
}
