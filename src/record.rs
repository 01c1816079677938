//! Cache records, buffered changes, and per-call option structs.
//!
//! A [`Record`] is the unit the engine stores, the policy annotates, and the
//! storage backend persists. Its `expiry` and `state` fields are opaque to
//! the engine: the eviction policy defines their types, interprets `expiry`,
//! and mutates `state`; the engine only round-trips them through storage.
//!
//! ## Ownership
//!
//! | field    | owner   | notes                                          |
//! |----------|---------|------------------------------------------------|
//! | `key`    | engine  | unique within the record table                 |
//! | `value`  | engine  | opaque payload                                 |
//! | `expiry` | policy  | per-record override of the policy default     |
//! | `state`  | policy  | mutable bookkeeping (e.g. last-access instant) |
//!
//! A [`Change`] is a mutation captured while the engine is frozen (a load or
//! save is in flight): instead of touching the authoritative table, writes
//! and deletes are buffered and replayed once the in-flight operation
//! settles. A later change to the same key supersedes an earlier one.

use serde::{Deserialize, Serialize};

/// A single cache entry: payload plus policy-owned expiry/state bookkeeping.
///
/// Serializes to the flat `{key, expiry, value, state}` shape used by the
/// newline-delimited storage encoding; absent `expiry`/`state` are omitted
/// entirely so policy-opaque data round-trips without noise.
///
/// # Example
///
/// ```
/// use stashkit::record::Record;
///
/// let record: Record<i32, u64, ()> = Record::new("answer".into(), 42);
/// assert_eq!(record.key, "answer");
/// assert!(record.expiry.is_none());
/// assert!(record.state.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T, E, X> {
    /// Unique key within one cache engine.
    pub key: String,
    /// Policy-defined per-record expiry override, if any.
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub expiry: Option<E>,
    /// Opaque payload.
    pub value: T,
    /// Policy-owned mutable bookkeeping, persisted but never interpreted by
    /// the engine.
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub state: Option<X>,
}

impl<T, E, X> Record<T, E, X> {
    /// Creates a record with no expiry override and no policy state.
    pub fn new(key: String, value: T) -> Self {
        Self {
            key,
            expiry: None,
            value,
            state: None,
        }
    }
}

/// A mutation deferred while the engine is frozen.
///
/// Buffered changes are keyed by record key; replay applies them to the
/// authoritative table in the order they were issued.
#[derive(Debug, Clone)]
pub enum Change<T, E, X> {
    /// Insert or replace the record under its key.
    Upsert(Record<T, E, X>),
    /// Remove whatever record holds this key.
    Tombstone(String),
}

impl<T, E, X> Change<T, E, X> {
    /// The key this change applies to.
    pub fn key(&self) -> &str {
        match self {
            Change::Upsert(record) => &record.key,
            Change::Tombstone(key) => key,
        }
    }
}

/// Options accepted by read operations (`has`, `get`, enumeration).
///
/// # Example
///
/// ```
/// use stashkit::record::ReadOptions;
///
/// // Validate against a 500ms TTL for this call only, instead of the
/// // record's stored expiry or the policy default.
/// let opts: ReadOptions<u64> = ReadOptions::default().expiry(500);
/// assert_eq!(opts.read_expiry, Some(500));
/// assert!(opts.read_cache);
/// ```
#[derive(Debug, Clone)]
pub struct ReadOptions<E> {
    /// When false, the read bypasses the cache entirely and resolves to
    /// absent. Default: true.
    pub read_cache: bool,
    /// Per-call expiry override; takes precedence over the record's stored
    /// expiry and the policy default. A record failing the validity check
    /// under the effective expiry is removed as a side effect of the read.
    pub read_expiry: Option<E>,
}

impl<E> Default for ReadOptions<E> {
    fn default() -> Self {
        Self {
            read_cache: true,
            read_expiry: None,
        }
    }
}

impl<E> ReadOptions<E> {
    /// Disables cache reads for this call.
    pub fn skip_cache(mut self) -> Self {
        self.read_cache = false;
        self
    }

    /// Sets a per-call expiry override.
    pub fn expiry(mut self, expiry: E) -> Self {
        self.read_expiry = Some(expiry);
        self
    }
}

/// Options accepted by write operations (`set`).
#[derive(Debug, Clone)]
pub struct WriteOptions<E, X> {
    /// When false, the write is discarded. Default: true.
    pub write_cache: bool,
    /// Replaces the record's stored expiry; otherwise an existing record's
    /// expiry is preserved.
    pub write_expiry: Option<E>,
    /// Replaces the record's policy state; otherwise an existing record's
    /// state is preserved.
    pub write_state: Option<X>,
}

impl<E, X> Default for WriteOptions<E, X> {
    fn default() -> Self {
        Self {
            write_cache: true,
            write_expiry: None,
            write_state: None,
        }
    }
}

impl<E, X> WriteOptions<E, X> {
    /// Disables cache writes for this call.
    pub fn skip_cache(mut self) -> Self {
        self.write_cache = false;
        self
    }

    /// Sets the stored expiry for the written record.
    pub fn expiry(mut self, expiry: E) -> Self {
        self.write_expiry = Some(expiry);
        self
    }

    /// Sets the policy state for the written record.
    pub fn state(mut self, state: X) -> Self {
        self.write_state = Some(state);
        self
    }
}

/// Combined read + write options, accepted by `compute`.
#[derive(Debug, Clone)]
pub struct CacheOptions<E, X> {
    /// Options applied to the initial lookup.
    pub read: ReadOptions<E>,
    /// Options applied when the produced value is stored.
    pub write: WriteOptions<E, X>,
}

impl<E, X> Default for CacheOptions<E, X> {
    fn default() -> Self {
        Self {
            read: ReadOptions::default(),
            write: WriteOptions::default(),
        }
    }
}
