//! Core data structures powering the cache engine.
//!
//! ## Module Overview
//!
//! | Module           | Structure       | Used for                              |
//! |------------------|-----------------|---------------------------------------|
//! | [`timer`]        | `ReusableTimer` | one-shot re-armable alarm             |
//! | [`deadline_map`] | `DeadlineMap`   | deadline-ordered eviction scheduling  |
//! | [`flight`]       | `Flight`        | load/save in-flight deduplication     |
//!
//! Everything here is policy- and storage-agnostic; the cache engine and the
//! TTL policy compose these pieces but the structures know nothing about
//! records or keys.

pub mod deadline_map;
pub mod flight;
pub mod timer;

pub use deadline_map::DeadlineMap;
pub use flight::{Flight, FlightTicket};
pub use timer::{MissingInterval, ReusableTimer, TimerOptions};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// Expiry thresholds are stored in this unit so they stay meaningful across
/// process restarts.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
