//! Deadline-ordered index with a single live timer.
//!
//! A [`DeadlineMap`] tracks values that become due at specific instants and
//! fires a handler for them passively — no polling loop, no timer per value.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       DeadlineMap<V> Layout                      │
//! │                                                                  │
//! │   buckets: BTreeMap<u64, Vec<V>>   (deadline ms -> tied values)  │
//! │                                                                  │
//! │     1_700_000_001_000 ─► [ "a" ]          ◄── target (minimum)   │
//! │     1_700_000_004_250 ─► [ "b", "c" ]         one ReusableTimer  │
//! │     1_700_000_009_000 ─► [ "d" ]              armed for it       │
//! │                                                                  │
//! │   On fire: pop the target bucket (within a 5 ms grace), invoke   │
//! │   the handler per value, retarget the new minimum, re-arm.       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Bucketing by exact deadline absorbs ties without sub-key disambiguation,
//! and the timer is only touched when the minimum actually changes: inserts
//! behind the current target and deletes past it cost a map operation and
//! nothing else. That keeps insert/delete at O(log n) with O(1) amortized
//! timer churn.
//!
//! Values are matched on removal by a caller-supplied equivalence rather
//! than identity, so callers may hand in copies (the TTL policy stores
//! record keys and compares them by string equality).
//!
//! Deadlines are wall-clock epoch milliseconds (see
//! [`epoch_millis`](crate::ds::epoch_millis)); they persist meaningfully
//! across process restarts, which is what a persistence-backed TTL needs.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::ds::epoch_millis;
use crate::ds::timer::ReusableTimer;

/// Tolerance for timer-coalescing jitter: a fire within this many
/// milliseconds of the target deadline counts as due.
const GRACE_MS: u64 = 5;

type Handler<V> = Arc<dyn Fn(V) + Send + Sync>;
type Equivalence<V> = Box<dyn Fn(&V, &V) -> bool + Send + Sync>;

struct SchedState<V> {
    buckets: BTreeMap<u64, Vec<V>>,
    /// Deadline the live timer is currently armed for, if any.
    target: Option<u64>,
}

struct SchedShared<V> {
    state: Mutex<SchedState<V>>,
    handler: Mutex<Option<Handler<V>>>,
    is_same: Equivalence<V>,
    // Set once right after construction; the timer's closure needs a Weak
    // back-reference to this struct, hence the two-phase init.
    timer: OnceLock<ReusableTimer>,
}

impl<V: Send + 'static> SchedShared<V> {
    fn tick(self: &Arc<Self>) {
        let due = {
            let mut state = self.state.lock();
            match state.target {
                Some(target) if target.saturating_sub(epoch_millis()) <= GRACE_MS => {
                    state.target = None;
                    state.buckets.remove(&target)
                }
                _ => None,
            }
        };

        // Handler runs without the index lock so it may insert/delete.
        if let Some(values) = due {
            let handler = self.handler.lock().clone();
            if let Some(handler) = handler {
                for value in values {
                    handler(value);
                }
            }
        }

        let mut state = self.state.lock();
        self.retarget(&mut state);
    }

    fn retarget(&self, state: &mut SchedState<V>) {
        let Some(timer) = self.timer.get() else {
            return;
        };
        match state.buckets.keys().next().copied() {
            Some(min) => {
                state.target = Some(min);
                let remaining = min.saturating_sub(epoch_millis());
                timer.start(Duration::from_millis(remaining));
            }
            None => {
                state.target = None;
                timer.stop();
            }
        }
    }
}

/// Ordered deadline → values index driving one re-armable timer.
///
/// See the [module docs](self) for the shape and complexity argument.
///
/// # Example
///
/// ```
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// use std::sync::Arc;
/// use parking_lot::Mutex;
/// use stashkit::ds::{epoch_millis, DeadlineMap};
///
/// let fired: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
/// let sink = fired.clone();
///
/// let map = DeadlineMap::with_handler(
///     move |key: String| sink.lock().push(key),
///     |a, b| a == b,
/// );
///
/// map.insert(epoch_millis() + 20, "soon".to_string());
/// map.insert(epoch_millis() + 60_000, "later".to_string());
/// assert_eq!(map.len(), 2);
///
/// tokio::time::sleep(std::time::Duration::from_millis(300)).await;
/// assert_eq!(fired.lock().clone(), vec!["soon".to_string()]);
/// assert_eq!(map.len(), 1);
/// # });
/// ```
pub struct DeadlineMap<V> {
    shared: Arc<SchedShared<V>>,
}

impl<V: Send + 'static> DeadlineMap<V> {
    /// Creates an index with no handler installed.
    ///
    /// Values in buckets that fire before [`set_handler`](Self::set_handler)
    /// is called are dropped silently.
    pub fn new<F>(is_same: F) -> Self
    where
        F: Fn(&V, &V) -> bool + Send + Sync + 'static,
    {
        let shared = Arc::new(SchedShared {
            state: Mutex::new(SchedState {
                buckets: BTreeMap::new(),
                target: None,
            }),
            handler: Mutex::new(None),
            is_same: Box::new(is_same),
            timer: OnceLock::new(),
        });

        let weak = Arc::downgrade(&shared);
        let timer = ReusableTimer::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.tick();
            }
        });
        let _ = shared.timer.set(timer);

        Self { shared }
    }

    /// Creates an index with the due-handler installed up front.
    pub fn with_handler<H, F>(handler: H, is_same: F) -> Self
    where
        H: Fn(V) + Send + Sync + 'static,
        F: Fn(&V, &V) -> bool + Send + Sync + 'static,
    {
        let map = Self::new(is_same);
        map.set_handler(handler);
        map
    }

    /// Installs or replaces the handler invoked for each due value.
    pub fn set_handler<H>(&self, handler: H)
    where
        H: Fn(V) + Send + Sync + 'static,
    {
        *self.shared.handler.lock() = Some(Arc::new(handler));
    }

    /// Adds `value` to the bucket for `deadline` (epoch milliseconds).
    ///
    /// Re-arms the timer only when this deadline becomes the new minimum.
    pub fn insert(&self, deadline: u64, value: V) {
        let mut state = self.shared.state.lock();
        state.buckets.entry(deadline).or_default().push(value);
        let is_new_minimum = state.target.map_or(true, |target| deadline < target);
        if is_new_minimum {
            self.shared.retarget(&mut state);
        }
    }

    /// Removes the first value in the `deadline` bucket matching `value`
    /// under the index's equivalence; drops the bucket if it empties.
    ///
    /// Re-arms (or stops) the timer when the removal may have affected the
    /// current minimum. Removing an untracked value is a no-op.
    pub fn delete(&self, deadline: u64, value: &V) {
        let mut state = self.shared.state.lock();
        if let Some(bucket) = state.buckets.get_mut(&deadline) {
            if let Some(index) = bucket.iter().position(|v| (self.shared.is_same)(v, value)) {
                bucket.remove(index);
            }
            if bucket.is_empty() {
                state.buckets.remove(&deadline);
            }
        }
        if state.target.map_or(true, |target| deadline <= target) {
            self.shared.retarget(&mut state);
        }
    }

    /// Discards every bucket and stops the timer.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        state.buckets.clear();
        state.target = None;
        if let Some(timer) = self.shared.timer.get() {
            timer.stop();
        }
    }

    /// Total number of tracked values across all buckets.
    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .buckets
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Returns `true` if no values are tracked.
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().buckets.is_empty()
    }

    /// The smallest tracked deadline, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.shared
            .state
            .lock()
            .buckets
            .keys()
            .next()
            .copied()
    }

    /// Returns `true` while the live timer is armed.
    pub fn is_armed(&self) -> bool {
        self.shared
            .timer
            .get()
            .map_or(false, ReusableTimer::is_ticking)
    }
}

impl<V> std::fmt::Debug for DeadlineMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DeadlineMap")
            .field("buckets", &state.buckets.len())
            .field("target", &state.target)
            .finish()
    }
}
