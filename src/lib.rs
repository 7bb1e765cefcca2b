//! Resilient data synchronization for clients of an unreliable backend.
//!
//! The crate decides *when* to fetch, whether a fetch is already in flight,
//! what to serve while fetching or failing, and how to notice and recover
//! from connectivity loss:
//!
//! - [`ConnectionMonitor`] probes the backend and drives reconnection with
//!   exponential backoff.
//! - [`FetchCoordinator`] deduplicates, throttles and cancels reads per key.
//! - [`ResourceCache`] keeps the last good value of every key.
//! - [`SyncedResource`] is the handle a consumer holds, obtained from a
//!   [`SyncContext`].

pub mod backend;
pub mod cache;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod fetch;
pub mod resource;

pub use backend::{Backend, HttpBackend};
pub use cache::{CacheEntry, CacheSource, ResourceCache};
pub use config::{Config, FetchConfig, MonitorConfig, SyncConfig};
pub use connection::{
  ConnectionEvent, ConnectionMonitor, ConnectionState, ConnectionStatus, HostSignal,
};
pub use context::SyncContext;
pub use error::{ErrorKind, SyncError};
pub use fetch::{CancelToken, FetchCoordinator, RunOptions, RunOutcome, SkipReason};
pub use resource::{ResourceOptions, ResourceSnapshot, SyncedResource};
