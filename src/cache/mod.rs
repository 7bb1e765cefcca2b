//! Last-known-good storage for keyed resources.
//!
//! This module provides:
//! - `ResourceCache`, the single source of truth for the last successful
//!   value of each key, with explicit invalidation only
//! - `CacheEntry`, a snapshot of one key with derived staleness
//! - `CacheSource`, describing where served data came from

mod entry;
mod store;

pub use entry::{CacheEntry, CacheSource};
pub use store::ResourceCache;
