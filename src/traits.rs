//! # Engine Collaborator Traits
//!
//! This module defines the two seams the cache engine is generic over: the
//! eviction policy (what makes a record valid, when it leaves the table) and
//! the storage backend (where the record table persists).
//!
//! ## Architecture
//!
//! ```text
//!                  ┌───────────────────────────────────────────┐
//!                  │            MemoryCache<T, P, S>           │
//!                  │                                           │
//!                  │   record table ─ change buffer ─ flights  │
//!                  └─────────┬─────────────────────┬───────────┘
//!                            │ hooks               │ snapshots
//!                            ▼                     ▼
//!        ┌────────────────────────────┐  ┌───────────────────────────┐
//!        │     EvictionPolicy<T>      │  │       Storage<T, E, X>    │
//!        │                            │  │                           │
//!        │  type Expiry; type State;  │  │  load()  → Vec<Record>    │
//!        │                            │  │  save(Vec<Record>)        │
//!        │  track / untrack           │  │  load_sync / save_sync    │
//!        │  check(record, override)   │  │  close()                  │
//!        │  retrieved / updated       │  └───────────────────────────┘
//!        │  attach(eviction sink)     │
//!        │  clear / close             │
//!        └────────────────────────────┘
//! ```
//!
//! ## Division of Responsibility
//!
//! | Concern                      | Engine | Policy | Storage |
//! |------------------------------|--------|--------|---------|
//! | key → record table           | ✅     |        |         |
//! | change buffering while frozen| ✅     |        |         |
//! | record validity              |        | ✅     |         |
//! | expiry/state interpretation  |        | ✅     |         |
//! | active eviction scheduling   |        | ✅     |         |
//! | durable representation       |        |        | ✅      |
//!
//! The engine never interprets `Record::expiry` or `Record::state`; it only
//! hands records to the policy at well-defined points and round-trips both
//! fields through storage. That keeps new policies (and their on-disk
//! bookkeeping) additive — no engine changes required.
//!
//! ## Policy Hook Call Map
//!
//! | Engine event                        | Hook(s) invoked                  |
//! |-------------------------------------|----------------------------------|
//! | record enters the table             | `track`                          |
//! | record read (`has`/`get`/enumerate) | `check`, then `retrieved` on hit |
//! | existing record overwritten         | `updated`                        |
//! | record removed (delete or eviction) | `untrack`                        |
//! | table replaced by a load            | `clear`, then `track` per record |
//! | engine closed                       | `close`                          |
//!
//! ## Active Eviction
//!
//! A policy that evicts on its own schedule (rather than lazily on access)
//! receives an [`EvictionSink`] via [`EvictionPolicy::attach`] at engine
//! construction. Invoking the sink with a key asks the engine to re-validate
//! that record and drop it if it is no longer valid; stale schedule entries
//! are therefore harmless. Purely passive policies keep the default no-op
//! `attach`.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::CacheError;
use crate::record::Record;

/// Callback handed to a policy for active eviction.
///
/// Invoking it with a key asks the owning engine to re-validate the record
/// under that key and evict it if invalid. Safe to call from timer contexts;
/// the engine takes its own locks.
pub type EvictionSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Decides which records are valid and when they leave the table.
///
/// Implementations define the meaning of a record's `expiry` (per-record
/// override of the policy default) and own its `state` (mutable bookkeeping,
/// persisted by the engine but never interpreted by it).
///
/// All record-mutating hooks receive `&mut Record` so the policy can
/// initialize or refresh its state in place; the engine persists whatever
/// the policy leaves there.
///
/// # Example
///
/// A policy that never invalidates anything:
///
/// ```
/// use stashkit::record::Record;
/// use stashkit::traits::EvictionPolicy;
///
/// struct KeepForever;
///
/// impl<T> EvictionPolicy<T> for KeepForever {
///     type Expiry = ();
///     type State = ();
///
///     fn track(&mut self, _record: &mut Record<T, (), ()>) {}
///     fn check(&mut self, _record: &mut Record<T, (), ()>, _expiry: Option<&()>) -> bool {
///         true
///     }
///     fn retrieved(&mut self, _record: &mut Record<T, (), ()>) -> bool {
///         false
///     }
///     fn updated(&mut self, _record: &mut Record<T, (), ()>) {}
///     fn untrack(&mut self, _record: &mut Record<T, (), ()>) {}
///     fn clear(&mut self) {}
/// }
/// ```
pub trait EvictionPolicy<T>: Send {
    /// Per-record expiry override type (e.g. a TTL in milliseconds).
    type Expiry: Clone + Send + Sync + 'static;
    /// Policy-owned per-record bookkeeping (e.g. a last-access instant).
    type State: Clone + Send + Sync + 'static;

    /// Receives the engine's eviction callback at construction.
    ///
    /// Default is a no-op for purely passive policies.
    fn attach(&mut self, _evict: EvictionSink) {}

    /// A record entered the table (fresh write or load).
    ///
    /// The policy may initialize `record.state` and schedule the record for
    /// active eviction.
    fn track(&mut self, record: &mut Record<T, Self::Expiry, Self::State>);

    /// Is this record still valid?
    ///
    /// When `read_expiry` is `Some`, validity is judged against that
    /// override instead of the record's stored expiry or the policy
    /// default. The engine removes a record that fails this check, whichever
    /// expiry it was judged under.
    fn check(
        &mut self,
        record: &mut Record<T, Self::Expiry, Self::State>,
        read_expiry: Option<&Self::Expiry>,
    ) -> bool;

    /// A valid record was just read.
    ///
    /// Returns `true` if `record.state` was mutated, so the engine knows the
    /// table diverged from storage.
    fn retrieved(&mut self, record: &mut Record<T, Self::Expiry, Self::State>) -> bool;

    /// An existing record was overwritten in place.
    fn updated(&mut self, record: &mut Record<T, Self::Expiry, Self::State>);

    /// A record left the table (explicit delete or eviction).
    fn untrack(&mut self, record: &mut Record<T, Self::Expiry, Self::State>);

    /// All records left the table at once (table replaced or engine reset).
    fn clear(&mut self);

    /// The engine is shutting down; release timers and scheduling state.
    ///
    /// Default delegates to [`clear`](Self::clear).
    fn close(&mut self) {
        self.clear();
    }
}

/// Durable home for the record table.
///
/// The engine always loads and saves the table wholesale: `load` returns
/// every persisted record, `save` replaces the persisted set with the given
/// snapshot. Backends are free to implement that as a rewrite (file), a
/// swap (memory), or anything else with the same observable behavior.
///
/// Both sync and async variants exist because the engine exposes both
/// surfaces; a backend with no meaningful sync path may implement `*_sync`
/// by blocking, and one with no async I/O may wrap its sync path.
#[async_trait]
pub trait Storage<T, E, X>: Send + Sync {
    /// Reads every persisted record.
    ///
    /// A backend with nothing persisted yet returns an empty vector, not an
    /// error.
    async fn load(&self) -> Result<Vec<Record<T, E, X>>, CacheError>;

    /// Synchronous variant of [`load`](Self::load).
    fn load_sync(&self) -> Result<Vec<Record<T, E, X>>, CacheError>;

    /// Replaces the persisted record set with `records`.
    async fn save(&self, records: Vec<Record<T, E, X>>) -> Result<(), CacheError>;

    /// Synchronous variant of [`save`](Self::save).
    fn save_sync(&self, records: Vec<Record<T, E, X>>) -> Result<(), CacheError>;

    /// Releases backend resources. Default is a no-op.
    fn close(&self) {}
}
