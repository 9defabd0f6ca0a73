//! Storage layer for Teak Core.
//!
//! A single SQLite table backs the [`PersistentRequestCache`]. The connection
//! is shared and reference counted through [`CacheDatabase`].

mod cache;
pub mod database;
pub mod error;

pub use cache::{CachedRequestRecord, PersistentRequestCache, read_records};
pub use database::{CacheDatabase, CacheLease};
pub use error::{StorageError, StorageResult};
