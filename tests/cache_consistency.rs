// ==============================================
// FREEZE / CHANGE-BUFFER CONSISTENCY (integration)
// ==============================================
//
// Exercises the engine's consistency protocol with a storage backend whose
// load/save can be held open by the test: writes issued while a load or
// save is in flight must buffer, replay on settle, and never be lost,
// and duplicate concurrent load/save calls must collapse onto one storage
// operation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stashkit::builder::MemoryCacheBuilder;
use stashkit::cache::MemoryCache;
use stashkit::error::CacheError;
use stashkit::policy::NoEviction;
use stashkit::record::Record;
use stashkit::store::MemoryStorage;
use stashkit::traits::Storage;
use tokio::sync::Semaphore;

type TestRecord = Record<i32, (), ()>;

/// Storage wrapper whose async load/save block until the test releases
/// them, with operation counters.
#[derive(Clone)]
struct GatedStorage {
    inner: MemoryStorage<i32, (), ()>,
    load_gate: Option<Arc<Semaphore>>,
    save_gate: Option<Arc<Semaphore>>,
    loads: Arc<AtomicUsize>,
    saves: Arc<AtomicUsize>,
    fail_loads: bool,
}

impl GatedStorage {
    fn open() -> Self {
        Self {
            inner: MemoryStorage::new(),
            load_gate: None,
            save_gate: None,
            loads: Arc::new(AtomicUsize::new(0)),
            saves: Arc::new(AtomicUsize::new(0)),
            fail_loads: false,
        }
    }

    fn gated_loads() -> Self {
        Self {
            load_gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::open()
        }
    }

    fn gated_saves() -> Self {
        Self {
            save_gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::open()
        }
    }

    fn failing_gated_loads() -> Self {
        Self {
            fail_loads: true,
            ..Self::gated_loads()
        }
    }

    fn release_load(&self) {
        self.load_gate.as_ref().unwrap().add_permits(1);
    }

    fn release_save(&self) {
        self.save_gate.as_ref().unwrap().add_permits(1);
    }

    fn seed(&self, records: Vec<TestRecord>) {
        self.inner.save_sync(records).unwrap();
    }

    fn persisted(&self) -> Vec<TestRecord> {
        self.inner.load_sync().unwrap()
    }
}

#[async_trait]
impl Storage<i32, (), ()> for GatedStorage {
    async fn load(&self) -> Result<Vec<TestRecord>, CacheError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.load_gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail_loads {
            return Err(CacheError::from(std::io::Error::other("load refused")));
        }
        self.inner.load().await
    }

    fn load_sync(&self) -> Result<Vec<TestRecord>, CacheError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_sync()
    }

    async fn save(&self, records: Vec<TestRecord>) -> Result<(), CacheError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.save_gate {
            gate.acquire().await.unwrap().forget();
        }
        self.inner.save(records).await
    }

    fn save_sync(&self, records: Vec<TestRecord>) -> Result<(), CacheError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save_sync(records)
    }
}

fn quiet_cache(storage: GatedStorage) -> MemoryCache<i32, NoEviction, GatedStorage> {
    // Implicit I/O disabled so each scenario controls exactly when the
    // engine talks to storage.
    MemoryCacheBuilder::new(storage, NoEviction)
        .load_on_read(false)
        .save_on_write(false)
        .build()
}

// ==============================================
// Load coalescing
// ==============================================

#[tokio::test]
async fn concurrent_loads_collapse_to_one_storage_read() {
    let storage = GatedStorage::gated_loads();
    storage.seed(vec![Record::new("a".into(), 1)]);
    let loads = storage.loads.clone();
    let cache = quiet_cache(storage.clone());

    let first = tokio::spawn({
        let cache = cache.clone();
        async move { cache.load().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = tokio::spawn({
        let cache = cache.clone();
        async move { cache.load().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    storage.release_load();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(loads.load(Ordering::SeqCst), 1, "follower must not trigger a second read");
    assert_eq!(cache.get("a").await.unwrap(), Some(1));
    assert!(!cache.stale());
}

#[tokio::test]
async fn load_failure_reaches_every_coalesced_waiter() {
    let storage = GatedStorage::failing_gated_loads();
    let loads = storage.loads.clone();
    let cache = quiet_cache(storage.clone());

    let first = tokio::spawn({
        let cache = cache.clone();
        async move { cache.load().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = tokio::spawn({
        let cache = cache.clone();
        async move { cache.load().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    storage.release_load();
    assert!(matches!(first.await.unwrap(), Err(CacheError::Io(_))));
    assert!(matches!(second.await.unwrap(), Err(CacheError::Io(_))));
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(cache.stale(), "failed load must leave the table stale");
}

// ==============================================
// Writes racing a load
// ==============================================

#[tokio::test]
async fn writes_during_load_land_on_top_of_the_loaded_table() {
    let storage = GatedStorage::gated_loads();
    storage.seed(vec![Record::new("a".into(), 1), Record::new("b".into(), 2)]);
    let cache = quiet_cache(storage.clone());
    cache.set("b", 0).await; // pre-load table entry, wiped by install

    let load = tokio::spawn({
        let cache = cache.clone();
        async move { cache.load().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Frozen: these buffer instead of touching the table.
    cache.set("a", 10).await;
    cache.set("c", 30).await;
    assert!(cache.delete("b").await);

    storage.release_load();
    load.await.unwrap().unwrap();

    assert_eq!(cache.get("a").await.unwrap(), Some(10), "buffered write wins over loaded value");
    assert_eq!(cache.get("b").await.unwrap(), None, "buffered delete wins over loaded value");
    assert_eq!(cache.get("c").await.unwrap(), Some(30));
    assert!(cache.dirty(), "replayed changes leave the table dirty");
}

#[tokio::test]
async fn failed_load_still_replays_buffered_writes() {
    let storage = GatedStorage::failing_gated_loads();
    let cache = quiet_cache(storage.clone());

    let load = tokio::spawn({
        let cache = cache.clone();
        async move { cache.load().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    cache.set("x", 7).await;

    storage.release_load();
    assert!(load.await.unwrap().is_err());

    assert_eq!(cache.get("x").await.unwrap(), Some(7), "no caller-visible write may be lost");
    assert!(cache.stale());
    assert!(cache.dirty());
}

// ==============================================
// Writes racing a save
// ==============================================

#[tokio::test]
async fn writes_during_save_buffer_and_replay_after_settle() {
    let storage = GatedStorage::gated_saves();
    let cache = quiet_cache(storage.clone());

    cache.load().await.unwrap();
    cache.set("a", 1).await;

    let save = tokio::spawn({
        let cache = cache.clone();
        async move { cache.save().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Frozen by the in-flight save.
    cache.set("a", 9).await;
    cache.set("b", 2).await;
    // Overlay read sees the buffered value immediately.
    assert_eq!(cache.get("a").await.unwrap(), Some(9));

    storage.release_save();
    save.await.unwrap().unwrap();

    // The save captured the pre-freeze snapshot…
    let persisted = storage.persisted();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].value, 1);

    // …and the racing writes replayed on top, leaving the engine dirty.
    assert_eq!(cache.get("a").await.unwrap(), Some(9));
    assert_eq!(cache.get("b").await.unwrap(), Some(2));
    assert!(cache.dirty());
}

#[tokio::test]
async fn concurrent_saves_collapse_to_one_storage_write() {
    let storage = GatedStorage::gated_saves();
    let saves = storage.saves.clone();
    let cache = quiet_cache(storage.clone());

    cache.load().await.unwrap();
    cache.set("a", 1).await;

    let first = tokio::spawn({
        let cache = cache.clone();
        async move { cache.save().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = tokio::spawn({
        let cache = cache.clone();
        async move { cache.save().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    storage.release_save();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(saves.load(Ordering::SeqCst), 1);
    assert!(!cache.dirty());
}

// ==============================================
// Dirty-guarded and write-triggered saves
// ==============================================

#[tokio::test]
async fn save_if_dirty_is_idempotent() {
    let storage = GatedStorage::open();
    let saves = storage.saves.clone();
    let cache = quiet_cache(storage);

    cache.load().await.unwrap();
    cache.set("a", 1).await;

    assert!(cache.save_if_dirty().await.unwrap(), "first call must save");
    assert!(!cache.save_if_dirty().await.unwrap(), "second call must be a no-op");
    assert_eq!(saves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn write_burst_collapses_to_one_debounced_save() {
    let storage = GatedStorage::open();
    let saves = storage.saves.clone();
    let cache = MemoryCacheBuilder::new(storage.clone(), NoEviction)
        .load_on_read(false)
        .save_on_write_debounce(Duration::from_millis(100))
        .build();

    cache.load().await.unwrap();
    cache.set("a", 1).await;
    cache.set("b", 2).await;
    cache.set("c", 3).await;

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(saves.load(Ordering::SeqCst), 1, "burst must coalesce into one save");
    assert_eq!(storage.persisted().len(), 3);
    assert!(!cache.dirty());
}

// ==============================================
// Overlapping flights
// ==============================================

#[tokio::test]
async fn write_during_overlapping_save_and_load_is_not_lost() {
    let storage = GatedStorage::gated_saves();
    let cache = quiet_cache(storage.clone());

    cache.load().await.unwrap();
    cache.set("existing", 1).await;

    let save = tokio::spawn({
        let cache = cache.clone();
        async move { cache.save().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Queues behind the save on the storage permit.
    let load = tokio::spawn({
        let cache = cache.clone();
        async move { cache.load().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Both flights pending: this must stay buffered until the last one
    // settles, not drain into the table the load is about to replace.
    cache.set("k", 7).await;

    storage.release_save();
    save.await.unwrap().unwrap();
    load.await.unwrap().unwrap();

    assert_eq!(cache.get("k").await.unwrap(), Some(7), "write issued under two in-flight operations must survive the reload");
    assert_eq!(cache.get("existing").await.unwrap(), Some(1));
    assert!(cache.dirty(), "the replayed write still needs persisting");
    assert_eq!(storage.persisted().len(), 1, "the save snapshot predates the buffered write");
}

#[tokio::test]
async fn save_queued_behind_a_load_persists_the_loaded_table() {
    let storage = GatedStorage::gated_loads();
    storage.seed(vec![Record::new("a".into(), 1)]);
    let cache = quiet_cache(storage.clone());

    let load = tokio::spawn({
        let cache = cache.clone();
        async move { cache.load().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Elects its save leader now, but waits for storage access behind
    // the held-open load.
    let save = tokio::spawn({
        let cache = cache.clone();
        async move { cache.save().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    storage.release_load();
    load.await.unwrap().unwrap();
    save.await.unwrap().unwrap();

    let persisted = storage.persisted();
    assert_eq!(persisted.len(), 1, "the snapshot must be taken after the load replaced the table");
    assert_eq!(persisted[0].key, "a");
    assert_eq!(persisted[0].value, 1);
    assert!(!cache.dirty());
}

// ==============================================
// Zero-debounce write-triggered saves
// ==============================================

#[test]
fn zero_debounce_sync_write_persists_inline_without_a_runtime() {
    let storage = GatedStorage::open();
    let cache = MemoryCacheBuilder::new(storage.clone(), NoEviction).build();

    cache.load_sync().unwrap();
    cache.set_sync("k", 1);

    assert_eq!(storage.persisted().len(), 1, "sync write must persist before returning");
    assert_eq!(storage.saves.load(Ordering::SeqCst), 1);
    assert!(!cache.dirty());
}

#[tokio::test]
async fn zero_debounce_async_write_persists_before_returning() {
    let storage = GatedStorage::open();
    let cache = MemoryCacheBuilder::new(storage.clone(), NoEviction).build();

    cache.load().await.unwrap();
    cache.set("k", 1).await;

    // No sleep: the save completed as part of the write.
    assert_eq!(storage.persisted().len(), 1);
    assert!(!cache.dirty());
}

#[test]
fn disable_internal_sync_io_keeps_sync_writes_off_storage() {
    let storage = GatedStorage::open();
    let cache = MemoryCacheBuilder::new(storage.clone(), NoEviction)
        .disable_internal_sync_io(true)
        .build();

    cache.load_sync().unwrap();
    cache.set_sync("k", 1);

    assert!(storage.persisted().is_empty());
    assert!(cache.dirty(), "the write stays pending for an explicit save");
}

// ==============================================
// Sync paths declining during async flights
// ==============================================

#[tokio::test]
async fn sync_load_reports_the_skip_while_an_async_load_is_in_flight() {
    let storage = GatedStorage::gated_loads();
    let cache = quiet_cache(storage.clone());

    let load = tokio::spawn({
        let cache = cache.clone();
        async move { cache.load().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Stale table, but the sync path must not pretend it loaded.
    assert!(cache.stale());
    assert!(!cache.load_if_stale_sync().unwrap());

    storage.release_load();
    load.await.unwrap().unwrap();
    assert!(!cache.stale());
}

#[tokio::test]
async fn sync_save_reports_the_skip_while_an_async_save_is_in_flight() {
    let storage = GatedStorage::gated_saves();
    let cache = quiet_cache(storage.clone());

    cache.load().await.unwrap();
    cache.set("a", 1).await;

    let save = tokio::spawn({
        let cache = cache.clone();
        async move { cache.save().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Dirty again while frozen, but the sync path must not pretend it saved.
    cache.set("b", 2).await;
    assert!(!cache.save_if_dirty_sync().unwrap());

    storage.release_save();
    save.await.unwrap().unwrap();
    assert!(cache.dirty(), "the buffered write replays and awaits the next save");
}

// ==============================================
// Enumeration vs. the change buffer
// ==============================================

#[tokio::test]
async fn enumeration_reflects_the_pre_freeze_table() {
    let storage = GatedStorage::gated_saves();
    let cache = quiet_cache(storage.clone());

    cache.load().await.unwrap();
    cache.set("a", 1).await;

    let save = tokio::spawn({
        let cache = cache.clone();
        async move { cache.save().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    cache.set("b", 2).await; // buffered, invisible to enumeration

    let keys = cache.keys().await.unwrap();
    assert_eq!(keys, vec!["a".to_string()]);

    storage.release_save();
    save.await.unwrap().unwrap();

    let mut keys = cache.keys().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
}
