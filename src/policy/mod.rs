//! Eviction policy implementations.
//!
//! ## Policy Overview
//!
//! | Policy        | Expiry type | State type | Validity basis            |
//! |---------------|-------------|------------|---------------------------|
//! | [`NoEviction`]| `()`        | `()`       | always valid              |
//! | [`TtlPolicy`] | [`TtlExpiry`]| [`TtlState`] | time since last touch  |
//!
//! Policies plug into the engine through
//! [`EvictionPolicy`](crate::traits::EvictionPolicy); see that module for
//! the hook call map.

pub mod ttl;

pub use ttl::{TtlExpiry, TtlOptions, TtlPolicy, TtlState};

use crate::record::Record;
use crate::traits::EvictionPolicy;

/// Policy that never invalidates or evicts anything.
///
/// Useful for pure persistence use cases where the cache is a durable map
/// and records only leave through explicit deletes.
///
/// # Example
///
/// ```
/// use stashkit::policy::NoEviction;
/// use stashkit::record::Record;
/// use stashkit::traits::EvictionPolicy;
///
/// let mut policy = NoEviction;
/// let mut record: Record<&str, (), ()> = Record::new("k".into(), "v");
///
/// policy.track(&mut record);
/// assert!(policy.check(&mut record, None));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEviction;

impl<T> EvictionPolicy<T> for NoEviction {
    type Expiry = ();
    type State = ();

    fn track(&mut self, _record: &mut Record<T, (), ()>) {}

    fn check(&mut self, _record: &mut Record<T, (), ()>, _read_expiry: Option<&()>) -> bool {
        true
    }

    fn retrieved(&mut self, _record: &mut Record<T, (), ()>) -> bool {
        false
    }

    fn updated(&mut self, _record: &mut Record<T, (), ()>) {}

    fn untrack(&mut self, _record: &mut Record<T, (), ()>) {}

    fn clear(&mut self) {}
}
