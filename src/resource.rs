//! Consumer-facing handle for one keyed piece of remote data.
//!
//! A `SyncedResource<T>` is what a screen depends on: "the list of clients",
//! "dashboard statistics". It never exposes cache or fetch-guard internals;
//! consumers read a [`ResourceSnapshot`] and ask for refreshes.
//!
//! ```ignore
//! let clients = ctx.subscribe("clients", ResourceOptions::default(), move |token| {
//!   let backend = backend.clone();
//!   async move { backend.get_json::<Vec<Client>>("clients", &token).await }
//! })?;
//!
//! loop {
//!   let snap = clients.changed().await;
//!   match (&snap.data, &snap.error) {
//!     (None, _) if snap.loading => render_spinner(),
//!     (Some(data), err) => render(data, snap.is_stale, err.as_deref()),
//!     (None, Some(err)) => render_error(err),
//!     (None, None) => {}
//!   }
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::CacheEntry;
use crate::error::SyncError;
use crate::fetch::{CancelToken, FetchCoordinator, RunOptions, RunOutcome};

/// A factory that creates one fetch future per attempt
type Fetcher<T> =
  Arc<dyn Fn(CancelToken) -> BoxFuture<'static, Result<T, SyncError>> + Send + Sync>;

/// Per-consumer policy for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceOptions {
  /// Freshness window; falls back to the context's `default_ttl`
  pub ttl: Option<Duration>,
  /// Start a background fetch on subscription unless the cache is fresh
  pub refresh_on_mount: bool,
}

impl Default for ResourceOptions {
  fn default() -> Self {
    Self {
      ttl: None,
      refresh_on_mount: true,
    }
  }
}

impl ResourceOptions {
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  /// Do not fetch on subscription
  pub fn lazy(mut self) -> Self {
    self.refresh_on_mount = false;
    self
  }
}

/// What a consumer renders.
#[derive(Debug)]
pub struct ResourceSnapshot<T> {
  /// Last cached value, `None` if never fetched
  pub data: Option<Arc<T>>,
  /// First fetch outstanding and nothing cached yet
  pub loading: bool,
  /// Background refresh outstanding while cached data is shown
  pub refreshing: bool,
  /// Last error, cleared by the next successful fetch
  pub error: Option<String>,
  pub is_stale: bool,
  pub age: Option<Duration>,
}

impl<T> Clone for ResourceSnapshot<T> {
  fn clone(&self) -> Self {
    Self {
      data: self.data.clone(),
      loading: self.loading,
      refreshing: self.refreshing,
      error: self.error.clone(),
      is_stale: self.is_stale,
      age: self.age,
    }
  }
}

impl<T> ResourceSnapshot<T> {
  pub fn has_data(&self) -> bool {
    self.data.is_some()
  }

  pub fn is_busy(&self) -> bool {
    self.loading || self.refreshing
  }
}

/// State shared by every handle of one key.
pub(crate) struct ResourceCore<T> {
  key: String,
  ttl: Duration,
  fetcher: Fetcher<T>,
  coordinator: Arc<FetchCoordinator>,
}

impl<T: Send + Sync + 'static> ResourceCore<T> {
  pub(crate) fn new<F, Fut>(
    key: String,
    ttl: Duration,
    coordinator: Arc<FetchCoordinator>,
    fetch: F,
  ) -> Self
  where
    F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    Self {
      key,
      ttl,
      fetcher: Arc::new(move |token| fetch(token).boxed()),
      coordinator,
    }
  }

  pub(crate) fn key(&self) -> &str {
    &self.key
  }

  async fn run(&self, force: bool) -> RunOutcome<T> {
    let mut options = RunOptions::new(self.ttl);
    if force {
      options = options.forced();
    }
    let fetcher = Arc::clone(&self.fetcher);
    self
      .coordinator
      .run(&self.key, options, move |token| fetcher(token))
      .await
  }

  fn is_fresh(&self) -> bool {
    self.coordinator.cache().is_fresh(&self.key, self.ttl)
  }

  /// Forced refresh, but only when the entry is stale or missing and no
  /// attempt is already running. Used for visibility and reconnect
  /// recovery so a fresh entry is never refetched early.
  pub(crate) async fn refresh_if_stale(&self) -> Option<RunOutcome<T>> {
    if self.is_fresh() || self.coordinator.is_in_flight(&self.key) {
      return None;
    }
    debug!(key = %self.key, "Refreshing stale resource");
    Some(self.run(true).await)
  }

  fn snapshot(&self) -> ResourceSnapshot<T> {
    let entry = self.coordinator.cache().get::<T>(&self.key);
    let in_flight = self.coordinator.is_in_flight(&self.key);
    ResourceSnapshot {
      loading: in_flight && entry.is_none(),
      refreshing: in_flight && entry.is_some(),
      error: self.coordinator.error(&self.key).map(|e| e.to_string()),
      is_stale: entry.as_ref().map(|e| e.is_stale(self.ttl)).unwrap_or(false),
      age: entry.as_ref().map(CacheEntry::age),
      data: entry.map(|e| e.value),
    }
  }
}

/// Runs a release hook when the last clone of a handle goes away.
pub(crate) struct Lease {
  release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Lease {
  pub(crate) fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
    Self {
      release: Some(Box::new(release)),
    }
  }
}

impl Drop for Lease {
  fn drop(&mut self) {
    if let Some(release) = self.release.take() {
      release();
    }
  }
}

/// A subscription to one keyed resource.
///
/// Clones share the subscription. Handles obtained from a
/// [`SyncContext`](crate::SyncContext) are reference counted per key: when
/// the last one is dropped the key's outstanding fetch is cancelled. Cached
/// data outlives every handle.
pub struct SyncedResource<T> {
  core: Arc<ResourceCore<T>>,
  revision: watch::Receiver<u64>,
  _lease: Option<Arc<Lease>>,
}

impl<T> Clone for SyncedResource<T> {
  fn clone(&self) -> Self {
    Self {
      core: Arc::clone(&self.core),
      revision: self.revision.clone(),
      _lease: self._lease.clone(),
    }
  }
}

impl<T: Send + Sync + 'static> SyncedResource<T> {
  /// Standalone resource on top of `coordinator`, without a context: no
  /// recovery refresh and no registry bookkeeping.
  pub fn new<F, Fut>(
    key: impl Into<String>,
    coordinator: Arc<FetchCoordinator>,
    options: ResourceOptions,
    fetch: F,
  ) -> Self
  where
    F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    let ttl = options
      .ttl
      .unwrap_or_else(|| coordinator.config().default_ttl());
    let core = Arc::new(ResourceCore::new(key.into(), ttl, coordinator, fetch));
    Self::from_core(core, None)
  }

  pub(crate) fn from_core(core: Arc<ResourceCore<T>>, lease: Option<Lease>) -> Self {
    let revision = core.coordinator.watch(&core.key);
    Self {
      core,
      revision,
      _lease: lease.map(Arc::new),
    }
  }

  pub fn key(&self) -> &str {
    &self.core.key
  }

  pub fn ttl(&self) -> Duration {
    self.core.ttl
  }

  pub fn snapshot(&self) -> ResourceSnapshot<T> {
    self.core.snapshot()
  }

  pub fn data(&self) -> Option<Arc<T>> {
    self.entry().map(|e| e.value)
  }

  pub fn entry(&self) -> Option<CacheEntry<T>> {
    self.core.coordinator.cache().get(&self.core.key)
  }

  pub fn is_fresh(&self) -> bool {
    self.core.is_fresh()
  }

  /// Fetch through the coordinator. `force` bypasses freshness, throttling
  /// and the offline check, and supersedes an outstanding attempt.
  pub async fn refresh(&self, force: bool) -> RunOutcome<T> {
    self.core.run(force).await
  }

  /// Like [`SyncedResource::refresh`] but detached from the caller.
  pub fn refresh_in_background(&self, force: bool) -> JoinHandle<RunOutcome<T>> {
    let core = Arc::clone(&self.core);
    tokio::spawn(async move { core.run(force).await })
  }

  /// Mount trigger: start a background fetch unless the cache is fresh or
  /// the coordinator would skip it anyway. Returns whether a fetch was started.
  pub fn mount(&self) -> bool {
    if self.core.is_fresh() {
      return false;
    }
    if let Some(reason) = self.core.coordinator.skip_reason(&self.core.key) {
      debug!(key = %self.core.key, ?reason, "Mount skipped");
      return false;
    }
    drop(self.refresh_in_background(false));
    true
  }

  /// Visibility trigger: refresh (bypassing throttling) only when the cached
  /// entry is stale or missing.
  pub async fn on_visible(&self) -> Option<RunOutcome<T>> {
    self.core.refresh_if_stale().await
  }

  /// Wait until data, error or in-flight status of the key changes.
  pub async fn changed(&mut self) -> ResourceSnapshot<T> {
    // The coordinator only drops the sender once no receiver is left
    let _ = self.revision.changed().await;
    self.core.snapshot()
  }

  pub fn has_changed(&self) -> bool {
    self.revision.has_changed().unwrap_or(false)
  }

  /// Write a locally known value (e.g. after a successful mutation). A fetch
  /// already in flight is cancelled so it cannot overwrite the value.
  pub fn set(&self, value: T) -> CacheEntry<T> {
    self.core.coordinator.write(&self.core.key, value)
  }

  /// Mark the cached value expired; it stays servable until replaced.
  pub fn invalidate(&self) -> bool {
    self.core.coordinator.invalidate(&self.core.key)
  }

  /// Cancel this key's outstanding fetch, discarding its result.
  pub fn cancel(&self) -> bool {
    self.core.coordinator.cancel(&self.core.key)
  }
}

impl<T> std::fmt::Debug for SyncedResource<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SyncedResource")
      .field("key", &self.core.key)
      .field("ttl", &self.core.ttl)
      .finish_non_exhaustive()
  }
}
