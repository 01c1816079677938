//! Persistence-backed cache engine.
//!
//! [`MemoryCache`] owns the authoritative key → record table and coordinates
//! two collaborators it is generic over: an
//! [`EvictionPolicy`](crate::traits::EvictionPolicy) deciding record
//! validity, and a [`Storage`](crate::traits::Storage) backend the table
//! round-trips through.
//!
//! ## The freeze + change-buffer protocol
//!
//! ```text
//!                 ┌───────────────────────────────────────────────┐
//!                 │               engine state                    │
//!                 │                                               │
//!   get ───────►  │  items: key → Record      (authoritative)     │
//!   set ───────►  │  changes: key → Change    (only while frozen) │
//!   delete ────►  │  dirty / stale flags                          │
//!                 └───────────────┬───────────────────────────────┘
//!                                 │ frozen = load or save in flight
//!                                 ▼
//!        not frozen: writes mutate `items` directly
//!        frozen:     writes buffer into `changes`; reads overlay
//!                    `changes` on top of `items` (tombstone = absent)
//!
//!        when the last in-flight load/save settles (success OR
//!        failure): `changes` is replayed onto `items` in issue order,
//!        exactly once, then cleared — no caller-visible write is ever
//!        lost. While a sibling flight is still pending the engine
//!        stays frozen and replay waits for its settle.
//! ```
//!
//! Freezing preserves the snapshot storage is concurrently reading or about
//! to replace: a save writes exactly the table it captured, a load replaces
//! the table wholesale, and every write that raced either one lands on top
//! afterwards (a later change to a key supersedes an earlier one).
//!
//! ## Load/save coalescing
//!
//! Duplicate concurrent `load` calls collapse onto one storage read via a
//! [`Flight`](crate::ds::Flight); every waiter observes the same outcome.
//! `save` works the same way, and a single-permit semaphore serializes load
//! against save so at most one storage operation is in flight engine-wide.
//!
//! ## Lock discipline
//!
//! The engine state sits behind one mutex that is never held across an
//! await. The frozen flag is only consulted while holding that mutex, and a
//! settling load/save publishes its outcome *before* releasing it — so no
//! writer can observe "not frozen" while buffered changes still await
//! replay.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::Semaphore;

use crate::ds::{Flight, FlightTicket, ReusableTimer};
use crate::error::CacheError;
use crate::record::{CacheOptions, Change, ReadOptions, Record, WriteOptions};
use crate::traits::{EvictionPolicy, EvictionSink, Storage};

type PolicyRecord<T, P> =
    Record<T, <P as EvictionPolicy<T>>::Expiry, <P as EvictionPolicy<T>>::State>;
type PolicyChange<T, P> =
    Change<T, <P as EvictionPolicy<T>>::Expiry, <P as EvictionPolicy<T>>::State>;

/// Engine configuration.
///
/// | Field                      | Default | Meaning                                   |
/// |----------------------------|---------|-------------------------------------------|
/// | `load_on_read`             | `true`  | reads trigger an implicit `load_if_stale` |
/// | `save_on_write`            | `true`  | writes trigger a `save_if_dirty`          |
/// | `save_on_write_debounce`   | `0`     | `0` = save inline with the write          |
/// | `disable_internal_sync_io` | `false` | sync paths never call storage implicitly  |
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Reads perform an implicit `load_if_stale` first.
    pub load_on_read: bool,
    /// Writes trigger a `save_if_dirty`.
    pub save_on_write: bool,
    /// Delay between a write and the triggered save. Zero means the save
    /// runs as part of the write itself. While a nonzero delay is pending,
    /// further writes do not re-arm it, so a burst of writes collapses
    /// into one save.
    pub save_on_write_debounce: Duration,
    /// When `true`, synchronous reads and writes never call into storage
    /// themselves; the caller is responsible for `load_sync`/`save_sync`.
    pub disable_internal_sync_io: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            load_on_read: true,
            save_on_write: true,
            save_on_write_debounce: Duration::ZERO,
            disable_internal_sync_io: false,
        }
    }
}

struct CacheState<T, P>
where
    P: EvictionPolicy<T>,
{
    items: FxHashMap<String, PolicyRecord<T, P>>,
    /// Buffered mutations, non-empty only while frozen. The `u64` is the
    /// issue sequence number; replay applies changes in that order.
    changes: FxHashMap<String, (u64, PolicyChange<T, P>)>,
    seq: u64,
    dirty: bool,
    stale: bool,
    closed: bool,
    policy: P,
}

impl<T, P> CacheState<T, P>
where
    T: Clone,
    P: EvictionPolicy<T>,
{
    fn tombstone(changes: &mut FxHashMap<String, (u64, PolicyChange<T, P>)>, seq: &mut u64, key: &str) {
        *seq += 1;
        changes.insert(key.to_string(), (*seq, Change::Tombstone(key.to_string())));
    }

    /// Frozen-aware lookup + validity check; on a hit, optionally runs the
    /// policy's `retrieved` hook. Records failing the check are removed
    /// (tombstoned while frozen) as a side effect.
    fn read_value(
        &mut self,
        frozen: bool,
        key: &str,
        read_expiry: Option<&P::Expiry>,
        refresh: bool,
    ) -> Option<T> {
        let CacheState {
            items,
            changes,
            seq,
            dirty,
            policy,
            ..
        } = self;

        if frozen && changes.contains_key(key) {
            {
                let record = match changes.get_mut(key) {
                    Some((_, Change::Upsert(record))) => record,
                    _ => return None, // tombstoned: absent even if `items` has the key
                };
                if policy.check(record, read_expiry) {
                    if refresh && policy.retrieved(record) {
                        *dirty = true;
                    }
                    return Some(record.value.clone());
                }
                policy.untrack(record);
            }
            Self::tombstone(changes, seq, key);
            *dirty = true;
            return None;
        }

        let record = items.get_mut(key)?;
        if policy.check(record, read_expiry) {
            if refresh && policy.retrieved(record) {
                *dirty = true;
            }
            return Some(record.value.clone());
        }
        policy.untrack(record);
        if frozen {
            Self::tombstone(changes, seq, key);
        } else {
            items.remove(key);
        }
        *dirty = true;
        None
    }

    /// Insert or overwrite. An existing record keeps its expiry/state
    /// unless the options override them.
    fn write_value(
        &mut self,
        frozen: bool,
        key: &str,
        value: T,
        options: WriteOptions<P::Expiry, P::State>,
    ) {
        let CacheState {
            items,
            changes,
            seq,
            dirty,
            policy,
            ..
        } = self;

        let existing = if frozen && changes.contains_key(key) {
            match changes.get(key) {
                Some((_, Change::Upsert(record))) => Some(record),
                _ => None,
            }
        } else {
            items.get(key)
        };

        let record = match existing {
            Some(existing) => {
                let mut record = existing.clone();
                record.value = value;
                if let Some(expiry) = options.write_expiry {
                    record.expiry = Some(expiry);
                }
                if let Some(state) = options.write_state {
                    record.state = Some(state);
                }
                policy.updated(&mut record);
                record
            }
            None => {
                let mut record = Record {
                    key: key.to_string(),
                    expiry: options.write_expiry,
                    value,
                    state: options.write_state,
                };
                policy.track(&mut record);
                record
            }
        };

        if frozen {
            *seq += 1;
            changes.insert(key.to_string(), (*seq, Change::Upsert(record)));
        } else {
            items.insert(key.to_string(), record);
        }
        *dirty = true;
    }

    /// Returns `true` if the key resolved to a live record.
    fn delete_value(&mut self, frozen: bool, key: &str) -> bool {
        let CacheState {
            items,
            changes,
            seq,
            dirty,
            policy,
            ..
        } = self;

        if frozen && changes.contains_key(key) {
            match changes.get_mut(key) {
                Some((_, Change::Upsert(record))) => policy.untrack(record),
                _ => return false, // already tombstoned
            }
            Self::tombstone(changes, seq, key);
            *dirty = true;
            return true;
        }

        let Some(record) = items.get_mut(key) else {
            return false;
        };
        policy.untrack(record);
        if frozen {
            Self::tombstone(changes, seq, key);
        } else {
            items.remove(key);
        }
        *dirty = true;
        true
    }

    /// Eviction-sink entry point: re-validate and drop only if still
    /// invalid. A record whose threshold moved after it was scheduled is
    /// re-tracked at the new deadline instead of being evicted early.
    fn evict_value(&mut self, frozen: bool, key: &str) -> bool {
        let CacheState {
            items,
            changes,
            seq,
            dirty,
            policy,
            ..
        } = self;

        if frozen && changes.contains_key(key) {
            {
                let record = match changes.get_mut(key) {
                    Some((_, Change::Upsert(record))) => record,
                    _ => return false,
                };
                if policy.check(record, None) {
                    policy.track(record);
                    return false;
                }
                policy.untrack(record);
            }
            Self::tombstone(changes, seq, key);
            *dirty = true;
            return true;
        }

        let Some(record) = items.get_mut(key) else {
            return false;
        };
        if policy.check(record, None) {
            policy.track(record);
            return false;
        }
        policy.untrack(record);
        if frozen {
            Self::tombstone(changes, seq, key);
        } else {
            items.remove(key);
        }
        *dirty = true;
        true
    }

    /// Enumeration snapshot over `items` only; the change buffer is not
    /// consulted, so a frozen window reflects the pre-freeze table.
    fn snapshot_entries(&mut self, frozen: bool) -> Vec<(String, T)> {
        let keys: Vec<String> = self.items.keys().cloned().collect();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let CacheState {
                items,
                changes,
                seq,
                dirty,
                policy,
                ..
            } = self;
            let Some(record) = items.get_mut(&key) else {
                continue;
            };
            if policy.check(record, None) {
                entries.push((key, record.value.clone()));
                continue;
            }
            policy.untrack(record);
            if frozen {
                Self::tombstone(changes, seq, &key);
            } else {
                items.remove(&key);
            }
            *dirty = true;
        }
        entries
    }

    /// Replaces the table with a freshly loaded record set.
    fn install_records(&mut self, records: Vec<PolicyRecord<T, P>>) {
        let CacheState { items, policy, .. } = self;
        policy.clear();
        items.clear();
        for mut record in records {
            policy.track(&mut record);
            items.insert(record.key.clone(), record);
        }
        self.stale = false;
        self.dirty = false;
    }

    /// Drains the change buffer onto `items` in issue order. Pure table
    /// surgery: every change already ran its policy hooks when buffered.
    fn replay_changes(&mut self) {
        if self.changes.is_empty() {
            self.seq = 0;
            return;
        }
        let mut buffered: Vec<(u64, PolicyChange<T, P>)> =
            self.changes.drain().map(|(_, change)| change).collect();
        buffered.sort_by_key(|(seq, _)| *seq);
        for (_, change) in buffered {
            match change {
                Change::Upsert(record) => {
                    self.items.insert(record.key.clone(), record);
                }
                Change::Tombstone(key) => {
                    self.items.remove(&key);
                }
            }
        }
        self.seq = 0;
        self.dirty = true;
    }
}

struct CacheShared<T, P, S>
where
    P: EvictionPolicy<T>,
{
    state: Mutex<CacheState<T, P>>,
    storage: S,
    /// Write-exclusive permit: at most one load-or-save touches storage at
    /// a time.
    io_permit: Semaphore,
    loading: Flight<CacheError>,
    saving: Flight<CacheError>,
    // Set once right after construction; the timer handler needs a Weak
    // back-reference to this struct.
    autosave: OnceLock<ReusableTimer>,
    config: CacheConfig,
}

impl<T, P, S> CacheShared<T, P, S>
where
    T: Clone + Send + Sync + 'static,
    P: EvictionPolicy<T>,
{
    /// Must be called while holding the state lock (the settling protocol
    /// relies on frozen never changing under a held lock).
    fn frozen(&self) -> bool {
        self.loading.is_pending() || self.saving.is_pending()
    }

    fn evict(&self, key: &str) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let frozen = self.frozen();
        let evicted = state.evict_value(frozen, key);
        drop(state);
        if evicted {
            tracing::debug!(key, "evicted expired record");
            self.request_autosave();
        }
    }

    fn request_autosave(&self) {
        if !self.config.save_on_write {
            return;
        }
        let Some(timer) = self.autosave.get() else {
            return;
        };
        // An armed timer is left alone so write bursts collapse into the
        // one already-pending save.
        if timer.is_ticking() {
            return;
        }
        timer.start(self.config.save_on_write_debounce);
    }
}

/// Persistence-backed key/value cache with pluggable eviction and storage.
///
/// Cheap to clone: clones are handles onto the same engine.
///
/// # Example
///
/// ```
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// use std::time::Duration;
/// use stashkit::cache::MemoryCache;
/// use stashkit::policy::TtlPolicy;
/// use stashkit::store::MemoryStorage;
///
/// let cache = MemoryCache::new(MemoryStorage::new(), TtlPolicy::new(Duration::from_secs(60)));
/// cache.load().await.unwrap();
///
/// cache.set("greeting", "hello".to_string()).await;
/// assert_eq!(cache.get("greeting").await.unwrap(), Some("hello".to_string()));
///
/// cache.save().await.unwrap();
/// assert!(!cache.dirty());
/// # });
/// ```
pub struct MemoryCache<T, P, S>
where
    P: EvictionPolicy<T>,
{
    shared: Arc<CacheShared<T, P, S>>,
}

impl<T, P, S> Clone for MemoryCache<T, P, S>
where
    P: EvictionPolicy<T>,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, P, S> MemoryCache<T, P, S>
where
    T: Clone + Send + Sync + 'static,
    P: EvictionPolicy<T> + 'static,
    S: Storage<T, P::Expiry, P::State> + 'static,
{
    /// Creates an engine with the default [`CacheConfig`].
    pub fn new(storage: S, policy: P) -> Self {
        Self::with_config(storage, policy, CacheConfig::default())
    }

    /// Creates an engine with an explicit [`CacheConfig`].
    pub fn with_config(storage: S, policy: P, config: CacheConfig) -> Self {
        let shared = Arc::new(CacheShared {
            state: Mutex::new(CacheState {
                items: FxHashMap::default(),
                changes: FxHashMap::default(),
                seq: 0,
                dirty: false,
                stale: true,
                closed: false,
                policy,
            }),
            storage,
            io_permit: Semaphore::new(1),
            loading: Flight::new(),
            saving: Flight::new(),
            autosave: OnceLock::new(),
            config,
        });

        let weak: Weak<CacheShared<T, P, S>> = Arc::downgrade(&shared);
        let sink: EvictionSink = Arc::new(move |key: &str| {
            if let Some(shared) = weak.upgrade() {
                shared.evict(key);
            }
        });
        shared.state.lock().policy.attach(sink);

        let weak = Arc::downgrade(&shared);
        let autosave = ReusableTimer::new(move || {
            if let Some(shared) = weak.upgrade() {
                let cache = MemoryCache { shared };
                tokio::spawn(async move {
                    if let Err(err) = cache.save_if_dirty().await {
                        tracing::warn!(error = %err, "write-triggered save failed");
                    }
                });
            }
        });
        let _ = shared.autosave.set(autosave);

        Self { shared }
    }

    // ---------------------------------------------------------------
    // load / save
    // ---------------------------------------------------------------

    /// Replaces the table with the full record set from storage.
    ///
    /// Concurrent callers collapse onto one storage read and all observe
    /// its outcome. Writes issued while the load is in flight land on top
    /// of the loaded table. A failed load leaves the previous table (and
    /// `stale = true`) but still replays buffered changes.
    pub async fn load(&self) -> Result<(), CacheError> {
        let ticket = {
            let state = self.shared.state.lock();
            if state.closed {
                return Ok(());
            }
            self.shared.loading.begin()
        };
        match ticket {
            FlightTicket::Follower(rx) => Flight::join(rx)
                .await
                .unwrap_or(Err(CacheError::Interrupted)),
            FlightTicket::Leader => {
                // The permit is held through install: a save queued on it
                // must not snapshot between the storage read and the table
                // replacement.
                let permit = self
                    .shared
                    .io_permit
                    .acquire()
                    .await
                    .map_err(|_| CacheError::Interrupted);
                let (result, _permit) = match permit {
                    Ok(permit) => (self.shared.storage.load().await, Some(permit)),
                    Err(err) => (Err(err), None),
                };

                let mut state = self.shared.state.lock();
                let outcome = match result {
                    Ok(records) => {
                        state.install_records(records);
                        Ok(())
                    }
                    Err(err) => Err(err),
                };
                // A still-pending save keeps the engine frozen; replay then
                // belongs to its settle, or a buffered write would drain
                // into a table the save is about to overwrite.
                if !self.shared.saving.is_pending() {
                    state.replay_changes();
                }
                // Publish before releasing the lock: no writer may observe
                // "not frozen" while buffered changes await replay.
                self.shared.loading.finish(outcome.clone());
                drop(state);
                outcome
            }
        }
    }

    /// Synchronous [`load`](Self::load).
    ///
    /// Returns without touching storage when an asynchronous load or save
    /// is already in flight (a synchronous caller cannot await it).
    pub fn load_sync(&self) -> Result<(), CacheError> {
        self.load_sync_inner().map(|_| ())
    }

    /// Returns whether storage was actually read; `Ok(false)` means the
    /// call declined because of a pending flight or a closed engine.
    fn load_sync_inner(&self) -> Result<bool, CacheError> {
        let ticket = {
            let state = self.shared.state.lock();
            if state.closed || self.shared.saving.is_pending() {
                return Ok(false);
            }
            self.shared.loading.begin()
        };
        let FlightTicket::Leader = ticket else {
            return Ok(false);
        };

        let result = self.shared.storage.load_sync();
        let mut state = self.shared.state.lock();
        let outcome = match result {
            Ok(records) => {
                state.install_records(records);
                Ok(())
            }
            Err(err) => Err(err),
        };
        if !self.shared.saving.is_pending() {
            state.replay_changes();
        }
        self.shared.loading.finish(outcome.clone());
        drop(state);
        outcome.map(|()| true)
    }

    /// Loads only if the table is stale. Returns whether a load ran.
    pub async fn load_if_stale(&self) -> Result<bool, CacheError> {
        if self.stale() {
            self.load().await.map(|_| true)
        } else {
            Ok(false)
        }
    }

    /// Synchronous [`load_if_stale`](Self::load_if_stale).
    ///
    /// Also returns `false` when the sync path declined to touch storage
    /// because an asynchronous flight is in progress.
    pub fn load_if_stale_sync(&self) -> Result<bool, CacheError> {
        if self.stale() {
            self.load_sync_inner()
        } else {
            Ok(false)
        }
    }

    /// Hands the current table snapshot to storage.
    ///
    /// Concurrent callers collapse onto one storage write. The snapshot is
    /// taken once storage access is granted, so a save queued behind a load
    /// persists the freshly loaded table. Writes issued while the save is
    /// in flight are buffered and replayed afterwards, leaving the engine
    /// dirty for the next save. A failed save leaves `dirty = true`.
    pub async fn save(&self) -> Result<(), CacheError> {
        let ticket = {
            let state = self.shared.state.lock();
            if state.closed {
                return Ok(());
            }
            self.shared.saving.begin()
        };
        match ticket {
            FlightTicket::Follower(rx) => Flight::join(rx)
                .await
                .unwrap_or(Err(CacheError::Interrupted)),
            FlightTicket::Leader => {
                let result = {
                    let permit = self
                        .shared
                        .io_permit
                        .acquire()
                        .await
                        .map_err(|_| CacheError::Interrupted);
                    match permit {
                        Ok(_permit) => {
                            // Snapshot only now: a load that held the permit
                            // ahead of us has already replaced the table.
                            let snapshot: Vec<PolicyRecord<T, P>> = {
                                let mut state = self.shared.state.lock();
                                state.dirty = false;
                                state.items.values().cloned().collect()
                            };
                            self.shared.storage.save(snapshot).await
                        }
                        Err(err) => Err(err),
                    }
                };

                let mut state = self.shared.state.lock();
                if result.is_err() {
                    state.dirty = true;
                }
                // A still-pending load keeps the engine frozen; replay then
                // belongs to its settle, after the table is replaced.
                if !self.shared.loading.is_pending() {
                    state.replay_changes();
                }
                self.shared.saving.finish(result.clone());
                drop(state);
                result
            }
        }
    }

    /// Synchronous [`save`](Self::save).
    ///
    /// Returns without touching storage when an asynchronous load or save
    /// is already in flight.
    pub fn save_sync(&self) -> Result<(), CacheError> {
        self.save_sync_inner().map(|_| ())
    }

    /// Returns whether storage was actually written; `Ok(false)` means the
    /// call declined because of a pending flight or a closed engine.
    fn save_sync_inner(&self) -> Result<bool, CacheError> {
        let snapshot = {
            let mut state = self.shared.state.lock();
            if state.closed || self.shared.loading.is_pending() {
                return Ok(false);
            }
            match self.shared.saving.begin() {
                FlightTicket::Leader => {
                    state.dirty = false;
                    state.items.values().cloned().collect::<Vec<_>>()
                }
                FlightTicket::Follower(_) => return Ok(false),
            }
        };

        let result = self.shared.storage.save_sync(snapshot);
        let mut state = self.shared.state.lock();
        if result.is_err() {
            state.dirty = true;
        }
        if !self.shared.loading.is_pending() {
            state.replay_changes();
        }
        self.shared.saving.finish(result.clone());
        drop(state);
        result.map(|()| true)
    }

    /// Saves only if the table has unsaved changes. Returns whether a save
    /// ran.
    pub async fn save_if_dirty(&self) -> Result<bool, CacheError> {
        if self.dirty() {
            self.save().await.map(|_| true)
        } else {
            Ok(false)
        }
    }

    /// Synchronous [`save_if_dirty`](Self::save_if_dirty).
    ///
    /// Also returns `false` when the sync path declined to touch storage
    /// because an asynchronous flight is in progress.
    pub fn save_if_dirty_sync(&self) -> Result<bool, CacheError> {
        if self.dirty() {
            self.save_sync_inner()
        } else {
            Ok(false)
        }
    }

    // ---------------------------------------------------------------
    // reads
    // ---------------------------------------------------------------

    /// Looks up a valid record's value.
    ///
    /// With `load_on_read` enabled a stale table is loaded first. A hit
    /// runs the policy's `retrieved` hook (e.g. TTL refresh); an expired
    /// record is removed as a side effect and reads as absent.
    pub async fn get(&self, key: &str) -> Result<Option<T>, CacheError> {
        self.get_with(key, ReadOptions::default()).await
    }

    /// [`get`](Self::get) with explicit [`ReadOptions`].
    pub async fn get_with(
        &self,
        key: &str,
        options: ReadOptions<P::Expiry>,
    ) -> Result<Option<T>, CacheError> {
        if !options.read_cache {
            return Ok(None);
        }
        if self.shared.config.load_on_read {
            self.load_if_stale().await?;
        }
        Ok(self.read(key, options.read_expiry.as_ref(), true))
    }

    /// Synchronous [`get`](Self::get).
    pub fn get_sync(&self, key: &str) -> Result<Option<T>, CacheError> {
        self.get_sync_with(key, ReadOptions::default())
    }

    /// Synchronous [`get_with`](Self::get_with).
    pub fn get_sync_with(
        &self,
        key: &str,
        options: ReadOptions<P::Expiry>,
    ) -> Result<Option<T>, CacheError> {
        if !options.read_cache {
            return Ok(None);
        }
        if self.shared.config.load_on_read && !self.shared.config.disable_internal_sync_io {
            self.load_if_stale_sync()?;
        }
        Ok(self.read(key, options.read_expiry.as_ref(), true))
    }

    /// Returns whether a valid record exists under `key`.
    ///
    /// Unlike [`get`](Self::get) this never refreshes the record's policy
    /// state, but an expired record is still removed as a side effect.
    pub async fn has(&self, key: &str) -> Result<bool, CacheError> {
        self.has_with(key, ReadOptions::default()).await
    }

    /// [`has`](Self::has) with explicit [`ReadOptions`].
    pub async fn has_with(
        &self,
        key: &str,
        options: ReadOptions<P::Expiry>,
    ) -> Result<bool, CacheError> {
        if !options.read_cache {
            return Ok(false);
        }
        if self.shared.config.load_on_read {
            self.load_if_stale().await?;
        }
        Ok(self.read(key, options.read_expiry.as_ref(), false).is_some())
    }

    /// Synchronous [`has`](Self::has).
    pub fn has_sync(&self, key: &str) -> Result<bool, CacheError> {
        self.has_sync_with(key, ReadOptions::default())
    }

    /// Synchronous [`has_with`](Self::has_with).
    pub fn has_sync_with(
        &self,
        key: &str,
        options: ReadOptions<P::Expiry>,
    ) -> Result<bool, CacheError> {
        if !options.read_cache {
            return Ok(false);
        }
        if self.shared.config.load_on_read && !self.shared.config.disable_internal_sync_io {
            self.load_if_stale_sync()?;
        }
        Ok(self.read(key, options.read_expiry.as_ref(), false).is_some())
    }

    fn read(&self, key: &str, read_expiry: Option<&P::Expiry>, refresh: bool) -> Option<T> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return None;
        }
        let frozen = self.shared.frozen();
        state.read_value(frozen, key, read_expiry, refresh)
    }

    // ---------------------------------------------------------------
    // writes
    // ---------------------------------------------------------------

    /// Inserts or overwrites the record under `key`.
    ///
    /// With `save_on_write` enabled and a zero debounce, the write is
    /// persisted before this returns; a nonzero debounce defers persistence
    /// to the timer-driven save (see [`CacheConfig::save_on_write`]).
    pub async fn set(&self, key: &str, value: T) {
        self.set_with(key, value, WriteOptions::default()).await;
    }

    /// [`set`](Self::set) with explicit [`WriteOptions`].
    pub async fn set_with(&self, key: &str, value: T, options: WriteOptions<P::Expiry, P::State>) {
        if self.write_record(key, value, options) {
            self.flush_after_write().await;
        }
    }

    /// Synchronous [`set`](Self::set).
    pub fn set_sync(&self, key: &str, value: T) {
        self.set_sync_with(key, value, WriteOptions::default());
    }

    /// Synchronous [`set_with`](Self::set_with).
    pub fn set_sync_with(&self, key: &str, value: T, options: WriteOptions<P::Expiry, P::State>) {
        if self.write_record(key, value, options) {
            self.flush_after_write_sync();
        }
    }

    fn write_record(&self, key: &str, value: T, options: WriteOptions<P::Expiry, P::State>) -> bool {
        if !options.write_cache {
            return false;
        }
        let mut state = self.shared.state.lock();
        if state.closed {
            return false;
        }
        let frozen = self.shared.frozen();
        state.write_value(frozen, key, value, options);
        true
    }

    /// Removes the record under `key`. Returns whether one existed.
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.delete_record(key);
        if removed {
            self.flush_after_write().await;
        }
        removed
    }

    /// Synchronous [`delete`](Self::delete).
    pub fn delete_sync(&self, key: &str) -> bool {
        let removed = self.delete_record(key);
        if removed {
            self.flush_after_write_sync();
        }
        removed
    }

    fn delete_record(&self, key: &str) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed {
            return false;
        }
        let frozen = self.shared.frozen();
        state.delete_value(frozen, key)
    }

    /// Write-triggered persistence: inline at zero debounce, timer-armed
    /// otherwise. Failures are logged, not propagated; `dirty` stays set so
    /// the next save retries.
    async fn flush_after_write(&self) {
        if !self.shared.config.save_on_write {
            return;
        }
        if self.shared.config.save_on_write_debounce.is_zero() {
            if let Err(err) = self.save_if_dirty().await {
                tracing::warn!(error = %err, "write-triggered save failed");
            }
        } else {
            self.shared.request_autosave();
        }
    }

    fn flush_after_write_sync(&self) {
        if !self.shared.config.save_on_write {
            return;
        }
        if self.shared.config.save_on_write_debounce.is_zero()
            && !self.shared.config.disable_internal_sync_io
        {
            if let Err(err) = self.save_if_dirty_sync() {
                tracing::warn!(error = %err, "write-triggered save failed");
            }
        } else {
            self.shared.request_autosave();
        }
    }

    // ---------------------------------------------------------------
    // compute
    // ---------------------------------------------------------------

    /// Read-or-produce-and-write.
    ///
    /// On a miss the producer runs (at most once per call); a `Some` result
    /// is stored and returned, a `None` result is returned without writing.
    /// Producer failures propagate and write nothing.
    ///
    /// # Example
    ///
    /// ```
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// use std::time::Duration;
    /// use stashkit::cache::MemoryCache;
    /// use stashkit::policy::TtlPolicy;
    /// use stashkit::store::MemoryStorage;
    ///
    /// let cache = MemoryCache::new(MemoryStorage::new(), TtlPolicy::new(Duration::from_secs(60)));
    ///
    /// let value = cache.compute("answer", || async { Ok(Some(42)) }).await.unwrap();
    /// assert_eq!(value, Some(42));
    ///
    /// // Hit: the second producer never runs.
    /// let value = cache.compute("answer", || async { Ok(Some(99)) }).await.unwrap();
    /// assert_eq!(value, Some(42));
    /// # });
    /// ```
    pub async fn compute<F, Fut>(&self, key: &str, producer: F) -> Result<Option<T>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Option<T>, CacheError>>,
    {
        self.compute_with(key, producer, CacheOptions::default())
            .await
    }

    /// [`compute`](Self::compute) with explicit [`CacheOptions`].
    pub async fn compute_with<F, Fut>(
        &self,
        key: &str,
        producer: F,
        options: CacheOptions<P::Expiry, P::State>,
    ) -> Result<Option<T>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Option<T>, CacheError>>,
    {
        if let Some(value) = self.get_with(key, options.read).await? {
            return Ok(Some(value));
        }
        match producer().await? {
            Some(value) => {
                self.set_with(key, value.clone(), options.write).await;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Synchronous [`compute`](Self::compute).
    pub fn compute_sync<F>(&self, key: &str, producer: F) -> Result<Option<T>, CacheError>
    where
        F: FnOnce() -> Result<Option<T>, CacheError>,
    {
        self.compute_sync_with(key, producer, CacheOptions::default())
    }

    /// Synchronous [`compute_with`](Self::compute_with).
    pub fn compute_sync_with<F>(
        &self,
        key: &str,
        producer: F,
        options: CacheOptions<P::Expiry, P::State>,
    ) -> Result<Option<T>, CacheError>
    where
        F: FnOnce() -> Result<Option<T>, CacheError>,
    {
        if let Some(value) = self.get_sync_with(key, options.read)? {
            return Ok(Some(value));
        }
        match producer()? {
            Some(value) => {
                self.set_sync_with(key, value.clone(), options.write);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    // ---------------------------------------------------------------
    // enumeration
    // ---------------------------------------------------------------

    /// All valid `(key, value)` pairs, filtered through the validity check
    /// (expired records are removed as a side effect).
    ///
    /// The change buffer is not consulted: enumeration during a frozen
    /// window reflects the pre-freeze table.
    pub async fn entries(&self) -> Result<Vec<(String, T)>, CacheError> {
        if self.shared.config.load_on_read {
            self.load_if_stale().await?;
        }
        Ok(self.snapshot())
    }

    /// Synchronous [`entries`](Self::entries).
    pub fn entries_sync(&self) -> Result<Vec<(String, T)>, CacheError> {
        if self.shared.config.load_on_read && !self.shared.config.disable_internal_sync_io {
            self.load_if_stale_sync()?;
        }
        Ok(self.snapshot())
    }

    /// All valid keys.
    pub async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.entries().await?.into_iter().map(|(key, _)| key).collect())
    }

    /// All valid values.
    pub async fn values(&self) -> Result<Vec<T>, CacheError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    fn snapshot(&self) -> Vec<(String, T)> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Vec::new();
        }
        let frozen = self.shared.frozen();
        state.snapshot_entries(frozen)
    }

    // ---------------------------------------------------------------
    // lifecycle & flags
    // ---------------------------------------------------------------

    /// Whether the table has unsaved changes.
    pub fn dirty(&self) -> bool {
        self.shared.state.lock().dirty
    }

    /// Whether the table may not reflect the latest durable state.
    pub fn stale(&self) -> bool {
        self.shared.state.lock().stale
    }

    /// Raw record count, including records that are expired but not yet
    /// removed by a read or by active eviction.
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Returns `true` if the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shuts the engine down: stops timers, tears down the policy, clears
    /// all tables, and releases the storage handle.
    ///
    /// Unsaved changes are discarded; call
    /// [`save_if_dirty`](Self::save_if_dirty) first to keep them. A closed
    /// engine reads as empty and ignores writes.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.policy.close();
        state.items.clear();
        state.changes.clear();
        drop(state);
        if let Some(timer) = self.shared.autosave.get() {
            timer.stop();
        }
        self.shared.storage.close();
    }
}

impl<T, P, S> std::fmt::Debug for MemoryCache<T, P, S>
where
    P: EvictionPolicy<T>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MemoryCache")
            .field("len", &state.items.len())
            .field("buffered", &state.changes.len())
            .field("dirty", &state.dirty)
            .field("stale", &state.stale)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{NoEviction, TtlExpiry, TtlOptions, TtlPolicy};

    fn fresh_state() -> CacheState<i32, NoEviction> {
        CacheState {
            items: FxHashMap::default(),
            changes: FxHashMap::default(),
            seq: 0,
            dirty: false,
            stale: true,
            closed: false,
            policy: NoEviction,
        }
    }

    enum Op {
        Set(&'static str, i32),
        Delete(&'static str),
    }

    fn apply(state: &mut CacheState<i32, NoEviction>, frozen: bool, ops: &[Op]) {
        for op in ops {
            match op {
                Op::Set(key, value) => {
                    state.write_value(frozen, key, *value, WriteOptions::default())
                }
                Op::Delete(key) => {
                    state.delete_value(frozen, key);
                }
            }
        }
    }

    #[test]
    fn buffered_replay_equals_direct_application() {
        let script = [
            Op::Set("a", 1),
            Op::Set("b", 2),
            Op::Delete("a"),
            Op::Set("b", 3),
            Op::Set("c", 4),
            Op::Delete("missing"),
        ];

        let mut direct = fresh_state();
        apply(&mut direct, false, &script);

        let mut frozen = fresh_state();
        apply(&mut frozen, true, &script);
        assert!(frozen.items.is_empty(), "frozen writes must not touch items");
        frozen.replay_changes();

        let collect = |state: &CacheState<i32, NoEviction>| {
            let mut entries: Vec<(String, i32)> = state
                .items
                .iter()
                .map(|(key, record)| (key.clone(), record.value))
                .collect();
            entries.sort();
            entries
        };
        assert_eq!(collect(&frozen), collect(&direct));
        assert!(frozen.changes.is_empty());
        assert_eq!(frozen.seq, 0);
    }

    #[test]
    fn later_change_supersedes_earlier_for_same_key() {
        let mut state = fresh_state();
        state.write_value(true, "k", 1, WriteOptions::default());
        state.delete_value(true, "k");
        state.write_value(true, "k", 2, WriteOptions::default());
        assert_eq!(state.changes.len(), 1);

        state.replay_changes();
        assert_eq!(state.items.get("k").map(|r| r.value), Some(2));
    }

    #[test]
    fn tombstone_hides_table_record_while_frozen() {
        let mut state = fresh_state();
        state.write_value(false, "k", 1, WriteOptions::default());

        assert!(state.delete_value(true, "k"));
        // The authoritative table still holds the record…
        assert!(state.items.contains_key("k"));
        // …but the frozen-aware read sees the tombstone.
        assert_eq!(state.read_value(true, "k", None, false), None);

        state.replay_changes();
        assert!(!state.items.contains_key("k"));
    }

    #[test]
    fn replay_marks_dirty_only_when_changes_existed() {
        let mut state = fresh_state();
        state.replay_changes();
        assert!(!state.dirty);

        state.write_value(true, "k", 1, WriteOptions::default());
        state.dirty = false; // simulate the save leader clearing it
        state.replay_changes();
        assert!(state.dirty);
    }

    #[test]
    fn overwrite_preserves_expiry_and_state_unless_overridden() {
        let mut state = CacheState::<i32, TtlPolicy> {
            items: FxHashMap::default(),
            changes: FxHashMap::default(),
            seq: 0,
            dirty: false,
            stale: false,
            closed: false,
            policy: TtlPolicy::with_options(TtlOptions {
                refresh_on_write: false,
                ..TtlOptions::default()
            }),
        };

        state.write_value(
            false,
            "k",
            1,
            WriteOptions::default().expiry(TtlExpiry::Millis(5_000)),
        );
        state.write_value(false, "k", 2, WriteOptions::default());

        let record = state.items.get("k").unwrap();
        assert_eq!(record.value, 2);
        assert_eq!(record.expiry, Some(TtlExpiry::Millis(5_000)));

        state.write_value(
            false,
            "k",
            3,
            WriteOptions::default().expiry(TtlExpiry::Millis(9_000)),
        );
        assert_eq!(
            state.items.get("k").unwrap().expiry,
            Some(TtlExpiry::Millis(9_000))
        );
    }

    #[test]
    fn install_records_resets_flags_and_tracks() {
        let mut state = fresh_state();
        state.write_value(false, "old", 1, WriteOptions::default());

        state.install_records(vec![Record::new("new".into(), 7)]);
        assert!(!state.stale);
        assert!(!state.dirty);
        assert!(state.items.contains_key("new"));
        assert!(!state.items.contains_key("old"));
    }
}
