//! Storage backends for the record table.
//!
//! ## Backend Overview
//!
//! | Backend           | Medium           | Encoding                      |
//! |-------------------|------------------|-------------------------------|
//! | [`FileStorage`]   | one file on disk | newline-delimited JSON        |
//! | [`MemoryStorage`] | process memory   | cloned record vectors         |
//!
//! Both implement [`Storage`](crate::traits::Storage); the engine treats
//! them identically. `MemoryStorage` exists mostly for tests and for using
//! the engine as a plain TTL map without persistence.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;
