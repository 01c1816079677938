//! stashkit: persistence-backed key/value caching with pluggable eviction
//! policies and storage backends.
//!
//! See `DESIGN.md` for internal architecture and invariants.

pub mod builder;
pub mod cache;
pub mod ds;
pub mod error;
pub mod policy;
pub mod prelude;
pub mod record;
pub mod store;
pub mod traits;
