//! Command implementations for the Teak CLI.

pub mod cache;
pub mod config;
pub mod sign;

pub use cache::CacheCommand;
