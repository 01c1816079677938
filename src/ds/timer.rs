//! Re-armable one-shot timer.
//!
//! A [`ReusableTimer`] owns a single deadline and a handler. Arming it while
//! already armed replaces the previous arming; stopping an unarmed timer is a
//! no-op. The interval of an armed timer can be changed in flight with two
//! policies:
//!
//! - **restart**: the elapsed time resets, the full new interval runs;
//! - **preserve remaining** (default): the new deadline becomes
//!   `now + (new_interval − elapsed)`; if that is non-positive the timer
//!   fires immediately instead of being silently dropped.
//!
//! The deadline scheduler re-arms one of these on every minimum change, and
//! the cache engine uses another to debounce write-triggered saves, so the
//! bookkeeping lives here once rather than in either consumer.
//!
//! ## Runtime requirement
//!
//! Firing is driven by a background tokio task spawned lazily on first arm.
//! Arming from outside a tokio runtime logs a warning and leaves the timer
//! disarmed. The cache engine arms its timer only for a nonzero save
//! debounce; zero-debounce saves run inline and never reach it.
//!
//! ## Example
//!
//! ```
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::time::Duration;
//! use stashkit::ds::ReusableTimer;
//!
//! let fired = Arc::new(AtomicUsize::new(0));
//! let flag = fired.clone();
//! let timer = ReusableTimer::new(move || {
//!     flag.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! timer.start(Duration::from_millis(10));
//! assert!(timer.is_ticking());
//!
//! tokio::time::sleep(Duration::from_millis(100)).await;
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! assert!(!timer.is_ticking());
//! # });
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

/// Error returned by [`ReusableTimer::start_default`] when neither a default
/// nor a remembered interval is configured.
///
/// This is a programmer error: the caller asked the timer to arm without
/// ever telling it for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no custom or default interval configured for timer")]
pub struct MissingInterval;

/// Configuration for [`ReusableTimer`].
#[derive(Debug, Clone, Default)]
pub struct TimerOptions {
    /// Interval used by [`ReusableTimer::start_default`] when no interval
    /// was remembered from an earlier [`start`](ReusableTimer::start).
    pub interval: Option<Duration>,
    /// Remember the interval passed to `start` and prefer it over
    /// `interval` on later `start_default` calls.
    pub remember_last_interval: bool,
    /// On [`set_interval`](ReusableTimer::set_interval) while armed, restart
    /// the full new interval instead of preserving the remaining time.
    pub restart_after_interval_change: bool,
}

struct TimerState {
    options: TimerOptions,
    last_interval: Option<Duration>,
    /// Deadline of the current arming; `Some` iff the timer is ticking.
    deadline: Option<Instant>,
    armed_at: Option<Instant>,
    current_interval: Option<Duration>,
    task_spawned: bool,
}

impl TimerState {
    fn effective_interval(&self) -> Option<Duration> {
        self.last_interval.or(self.options.interval)
    }

    fn arm(&mut self, interval: Duration) {
        let now = Instant::now();
        self.armed_at = Some(now);
        self.deadline = Some(now + interval);
        self.current_interval = Some(interval);
    }

    fn disarm(&mut self) {
        self.deadline = None;
        self.armed_at = None;
        self.current_interval = None;
    }
}

type Handler = dyn Fn() + Send + Sync;

/// One-shot alarm that can be re-armed, retargeted, and stopped.
///
/// See the [module docs](self) for semantics and the runtime requirement.
pub struct ReusableTimer {
    state: Arc<Mutex<TimerState>>,
    notify: Arc<Notify>,
    handler: Arc<Handler>,
}

impl ReusableTimer {
    /// Creates a timer with default options.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::with_options(handler, TimerOptions::default())
    }

    /// Creates a timer with explicit [`TimerOptions`].
    pub fn with_options<F>(handler: F, options: TimerOptions) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(TimerState {
                options,
                last_interval: None,
                deadline: None,
                armed_at: None,
                current_interval: None,
                task_spawned: false,
            })),
            notify: Arc::new(Notify::new()),
            handler: Arc::new(handler),
        }
    }

    /// Returns `true` while the timer is armed and has not yet fired.
    pub fn is_ticking(&self) -> bool {
        self.state.lock().deadline.is_some()
    }

    /// Time elapsed since the current arming, or `None` if not ticking.
    pub fn elapsed(&self) -> Option<Duration> {
        let state = self.state.lock();
        state.armed_at.map(|at| at.elapsed())
    }

    /// Time left until the current deadline, or `None` if not ticking.
    pub fn remaining(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// The interval `start_default` would use right now.
    pub fn interval(&self) -> Option<Duration> {
        self.state.lock().effective_interval()
    }

    /// Arms (or re-arms) the timer for `interval` from now.
    ///
    /// An existing arming is replaced, not stacked.
    pub fn start(&self, interval: Duration) {
        let mut state = self.state.lock();
        if state.options.remember_last_interval {
            state.last_interval = Some(interval);
        }
        state.arm(interval);
        self.ensure_task(&mut state);
        drop(state);
        self.notify.notify_one();
    }

    /// Arms the timer using the remembered or configured default interval.
    pub fn start_default(&self) -> Result<(), MissingInterval> {
        let interval = self.interval().ok_or(MissingInterval)?;
        self.start(interval);
        Ok(())
    }

    /// Changes the configured interval, retargeting an in-flight arming.
    ///
    /// While armed, the behavior follows
    /// [`TimerOptions::restart_after_interval_change`]: either the full new
    /// interval is restarted, or the already-elapsed time is credited
    /// against the new interval — firing immediately when nothing remains.
    pub fn set_interval(&self, value: Duration) {
        let mut state = self.state.lock();
        if state.effective_interval() == Some(value) {
            return;
        }

        if state.last_interval.is_some() {
            state.last_interval = Some(value);
        } else {
            state.options.interval = Some(value);
        }

        if state.deadline.is_some() {
            if state.options.restart_after_interval_change {
                state.arm(value);
            } else if let Some(armed_at) = state.armed_at {
                let elapsed = armed_at.elapsed();
                let remaining = value.saturating_sub(elapsed);
                // Keep armed_at so elapsed() stays continuous; only the
                // deadline moves.
                state.deadline = Some(Instant::now() + remaining);
                state.current_interval = Some(value);
            }
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Disarms the timer. No-op if it is not ticking.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.disarm();
        drop(state);
        self.notify.notify_one();
    }

    fn ensure_task(&self, state: &mut TimerState) {
        if state.task_spawned {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                state.task_spawned = true;
                handle.spawn(run_timer(
                    Arc::downgrade(&self.state),
                    Arc::clone(&self.notify),
                    Arc::downgrade(&self.handler),
                ));
            }
            Err(_) => {
                tracing::warn!("timer armed outside a tokio runtime; it will not fire");
            }
        }
    }
}

impl Drop for ReusableTimer {
    fn drop(&mut self) {
        // Wake the driver task so it notices the state is gone and exits.
        self.notify.notify_one();
    }
}

impl std::fmt::Debug for ReusableTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReusableTimer")
            .field("is_ticking", &self.is_ticking())
            .finish()
    }
}

async fn run_timer(
    state: Weak<Mutex<TimerState>>,
    notify: Arc<Notify>,
    handler: Weak<Handler>,
) {
    loop {
        let deadline = match state.upgrade() {
            Some(state) => state.lock().deadline,
            None => return,
        };

        match deadline {
            None => notify.notified().await,
            Some(deadline) => {
                tokio::select! {
                    _ = time::sleep_until(deadline) => {
                        let fire = match state.upgrade() {
                            Some(state) => {
                                let mut state = state.lock();
                                // A re-arm may have moved the deadline while
                                // we slept; only fire if it still matches.
                                if state.deadline == Some(deadline) {
                                    state.disarm();
                                    true
                                } else {
                                    false
                                }
                            }
                            None => return,
                        };
                        if fire {
                            if let Some(handler) = handler.upgrade() {
                                handler();
                            }
                        }
                    }
                    _ = notify.notified() => {}
                }
            }
        }
    }
}
