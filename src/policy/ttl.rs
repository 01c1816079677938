//! Time-to-live eviction policy.
//!
//! A record is valid while `last_touch + ttl >= now` (the boundary instant
//! itself is still valid). The TTL is resolved with a three-level
//! precedence, most specific first:
//!
//! ```text
//!   per-call override   (ReadOptions::read_expiry)
//!      └─ falls back to ──►  per-record expiry   (Record::expiry)
//!            └─ falls back to ──►  policy default   (TtlOptions::ttl)
//! ```
//!
//! No TTL at any level means the record never expires.
//!
//! ## Passive vs active
//!
//! | Mode                | Expired records are removed…                     |
//! |---------------------|--------------------------------------------------|
//! | passive (default)   | lazily, when a read or write next touches them   |
//! | active              | eagerly, by a deadline schedule with one timer   |
//!
//! In active mode every tracked record's expiry threshold is inserted into a
//! [`DeadlineMap`] keyed by record key. When a deadline fires the policy
//! reports the key through the engine's eviction sink; the engine then
//! re-validates the record before dropping it, so a threshold that moved
//! (the record was touched after scheduling) results in a re-track at the
//! new threshold rather than a premature eviction.
//!
//! ## Persisted bookkeeping
//!
//! [`TtlState`] stores the last-touch instant as epoch milliseconds. It
//! rides along in `Record::state`, so TTLs keep counting across a process
//! restart instead of resetting on load.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ds::{epoch_millis, DeadlineMap};
use crate::record::Record;
use crate::traits::{EvictionPolicy, EvictionSink};

/// Per-record TTL override.
///
/// Accepts either a bare millisecond count or an options object in the
/// persisted form, so both `"expiry": 5000` and `"expiry": {"ttl": 5000}`
/// decode to the same thing.
///
/// # Example
///
/// ```
/// use stashkit::policy::TtlExpiry;
///
/// let bare: TtlExpiry = serde_json::from_str("5000").unwrap();
/// let keyed: TtlExpiry = serde_json::from_str(r#"{"ttl": 5000}"#).unwrap();
/// assert_eq!(bare.ttl_millis(), 5000);
/// assert_eq!(keyed.ttl_millis(), 5000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TtlExpiry {
    /// TTL in milliseconds.
    Millis(u64),
    /// TTL wrapped in an options object.
    Options {
        /// TTL in milliseconds.
        ttl: u64,
    },
}

impl TtlExpiry {
    /// The TTL in milliseconds, whichever form carries it.
    pub fn ttl_millis(&self) -> u64 {
        match *self {
            TtlExpiry::Millis(ttl) => ttl,
            TtlExpiry::Options { ttl } => ttl,
        }
    }
}

impl From<u64> for TtlExpiry {
    fn from(millis: u64) -> Self {
        TtlExpiry::Millis(millis)
    }
}

impl From<Duration> for TtlExpiry {
    fn from(ttl: Duration) -> Self {
        TtlExpiry::Millis(ttl.as_millis() as u64)
    }
}

/// Persisted per-record bookkeeping: when the record was last touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlState {
    /// Last touch as milliseconds since the Unix epoch.
    pub last_time: u64,
}

/// Configuration for [`TtlPolicy`].
///
/// | Field              | Default | Meaning                                  |
/// |--------------------|---------|------------------------------------------|
/// | `ttl`              | `None`  | default TTL; `None` = no default expiry  |
/// | `only_passive`     | `true`  | skip the deadline schedule entirely      |
/// | `refresh_on_read`  | `true`  | reads reset the last-touch instant       |
/// | `refresh_on_write` | `true`  | overwrites reset the last-touch instant  |
#[derive(Debug, Clone)]
pub struct TtlOptions {
    /// Default TTL applied when a record carries no expiry of its own.
    pub ttl: Option<Duration>,
    /// When `true`, expired records are only removed lazily on access.
    pub only_passive: bool,
    /// Reads refresh the record's last-touch instant.
    pub refresh_on_read: bool,
    /// Overwrites refresh the record's last-touch instant.
    pub refresh_on_write: bool,
}

impl Default for TtlOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            only_passive: true,
            refresh_on_read: true,
            refresh_on_write: true,
        }
    }
}

/// Validity test against a resolved threshold: the boundary instant is
/// inclusive, so a record whose threshold equals `now` is still valid.
fn is_valid_at(threshold: u64, now: u64) -> bool {
    threshold >= now
}

/// TTL-based [`EvictionPolicy`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use stashkit::policy::TtlPolicy;
/// use stashkit::record::Record;
/// use stashkit::traits::EvictionPolicy;
///
/// let mut policy = TtlPolicy::new(Duration::from_secs(60));
/// let mut record = Record::new("session".into(), "data");
///
/// policy.track(&mut record);
/// // Tracking stamps the last-touch instant into the record's state.
/// assert!(record.state.is_some());
/// assert!(policy.check(&mut record, None));
/// ```
pub struct TtlPolicy {
    options: TtlOptions,
    schedule: DeadlineMap<String>,
}

impl TtlPolicy {
    /// Passive policy with `ttl` as the default time-to-live.
    pub fn new(ttl: Duration) -> Self {
        Self::with_options(TtlOptions {
            ttl: Some(ttl),
            ..TtlOptions::default()
        })
    }

    /// Active policy: expired records are evicted by deadline, not just
    /// filtered out on access.
    pub fn active(ttl: Duration) -> Self {
        Self::with_options(TtlOptions {
            ttl: Some(ttl),
            only_passive: false,
            ..TtlOptions::default()
        })
    }

    /// Policy with explicit [`TtlOptions`].
    pub fn with_options(options: TtlOptions) -> Self {
        Self {
            options,
            schedule: DeadlineMap::new(|a: &String, b: &String| a == b),
        }
    }

    /// Number of records currently scheduled for active eviction.
    pub fn scheduled(&self) -> usize {
        self.schedule.len()
    }

    fn default_ttl_millis(&self) -> Option<u64> {
        self.options.ttl.map(|ttl| ttl.as_millis() as u64)
    }

    /// Resolves the expiry threshold for `record`, lazily stamping a
    /// last-touch instant into its state when missing.
    ///
    /// Returns `None` when no TTL applies at any precedence level.
    fn threshold<T>(
        &self,
        record: &mut Record<T, TtlExpiry, TtlState>,
        read_expiry: Option<&TtlExpiry>,
    ) -> Option<u64> {
        let ttl = read_expiry
            .copied()
            .or(record.expiry)
            .map(|expiry| expiry.ttl_millis())
            .or_else(|| self.default_ttl_millis())?;

        let last_time = match record.state {
            Some(state) => state.last_time,
            None => {
                let now = epoch_millis();
                record.state = Some(TtlState { last_time: now });
                now
            }
        };

        Some(last_time.saturating_add(ttl))
    }
}

impl<T> EvictionPolicy<T> for TtlPolicy {
    type Expiry = TtlExpiry;
    type State = TtlState;

    fn attach(&mut self, evict: EvictionSink) {
        self.schedule.set_handler(move |key: String| evict(&key));
    }

    fn track(&mut self, record: &mut Record<T, TtlExpiry, TtlState>) {
        let threshold = self.threshold(record, None);
        if !self.options.only_passive {
            if let Some(threshold) = threshold {
                self.schedule.insert(threshold, record.key.clone());
            }
        }
    }

    fn check(
        &mut self,
        record: &mut Record<T, TtlExpiry, TtlState>,
        read_expiry: Option<&TtlExpiry>,
    ) -> bool {
        match self.threshold(record, read_expiry) {
            Some(threshold) => is_valid_at(threshold, epoch_millis()),
            None => true,
        }
    }

    fn retrieved(&mut self, record: &mut Record<T, TtlExpiry, TtlState>) -> bool {
        if !self.options.refresh_on_read {
            return false;
        }
        let now = epoch_millis();
        match record.state {
            Some(state) if state.last_time == now => false,
            _ => {
                record.state = Some(TtlState { last_time: now });
                true
            }
        }
    }

    fn updated(&mut self, record: &mut Record<T, TtlExpiry, TtlState>) {
        if self.options.refresh_on_write {
            record.state = Some(TtlState {
                last_time: epoch_millis(),
            });
        }
    }

    fn untrack(&mut self, record: &mut Record<T, TtlExpiry, TtlState>) {
        if !self.options.only_passive {
            if let Some(threshold) = self.threshold(record, None) {
                self.schedule.delete(threshold, &record.key);
            }
        }
    }

    fn clear(&mut self) {
        self.schedule.clear();
    }
}

impl std::fmt::Debug for TtlPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlPolicy")
            .field("options", &self.options)
            .field("scheduled", &self.schedule.len())
            .finish()
    }
}
