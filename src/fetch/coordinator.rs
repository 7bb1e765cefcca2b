//! Fetch coordination: cache-first reads with in-flight deduplication,
//! throttling and supersession of older attempts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheSource, ResourceCache};
use crate::config::FetchConfig;
use crate::error::SyncError;

use super::token::CancelToken;

/// Read-only view of backend reachability plus the feedback channel a data
/// fetch uses to report what it learned about the network.
pub trait Reachability: Send + Sync {
  fn is_reachable(&self) -> bool;

  /// A data fetch succeeded.
  fn report_success(&self);

  /// A data fetch failed with something other than a cancellation.
  fn report_failure(&self, error: &SyncError);
}

/// Reachability that never blocks a fetch and ignores reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

impl Reachability for AlwaysReachable {
  fn is_reachable(&self) -> bool {
    true
  }

  fn report_success(&self) {}

  fn report_failure(&self, _error: &SyncError) {}
}

/// Options for a single [`FetchCoordinator::run`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
  /// Freshness policy of the calling resource
  pub ttl: Duration,
  /// Bypass freshness, throttling, the offline check and the in-flight guard.
  /// A forced run supersedes any attempt already in flight.
  pub force: bool,
}

impl RunOptions {
  pub fn new(ttl: Duration) -> Self {
    Self { ttl, force: false }
  }

  pub fn forced(mut self) -> Self {
    self.force = true;
    self
  }
}

/// Why a run returned without invoking the fetch function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  /// Another attempt for the key is outstanding
  InFlight,
  /// The previous attempt started less than a throttle window ago
  Throttled,
  /// The connection monitor believes the backend is unreachable
  Offline,
}

/// Result of a coordinated run.
#[derive(Debug)]
pub enum RunOutcome<T> {
  /// Cache was fresh; nothing was fetched
  Fresh(CacheEntry<T>),
  /// The fetch succeeded and its value is now cached
  Fetched(CacheEntry<T>),
  /// No fetch was started; whatever was cached is returned
  Skipped {
    reason: SkipReason,
    cached: Option<CacheEntry<T>>,
  },
  /// The attempt was cancelled or superseded; its result was discarded
  Cancelled,
  /// The fetch failed; the previous entry (if any) is untouched
  Failed {
    error: SyncError,
    cached: Option<CacheEntry<T>>,
  },
}

impl<T> RunOutcome<T> {
  pub fn entry(&self) -> Option<&CacheEntry<T>> {
    match self {
      RunOutcome::Fresh(entry) | RunOutcome::Fetched(entry) => Some(entry),
      RunOutcome::Skipped { cached, .. } | RunOutcome::Failed { cached, .. } => cached.as_ref(),
      RunOutcome::Cancelled => None,
    }
  }

  pub fn data(&self) -> Option<&Arc<T>> {
    self.entry().map(|e| &e.value)
  }

  pub fn error(&self) -> Option<&SyncError> {
    match self {
      RunOutcome::Failed { error, .. } => Some(error),
      _ => None,
    }
  }

  pub fn source(&self) -> Option<CacheSource> {
    match self {
      RunOutcome::Fresh(_) => Some(CacheSource::CacheFresh),
      RunOutcome::Fetched(_) => Some(CacheSource::Network),
      RunOutcome::Skipped { cached, .. } | RunOutcome::Failed { cached, .. } => {
        cached.as_ref().map(|_| CacheSource::CacheStale)
      }
      RunOutcome::Cancelled => None,
    }
  }

  pub fn is_fetched(&self) -> bool {
    matches!(self, RunOutcome::Fetched(_))
  }

  pub fn is_skipped(&self) -> bool {
    matches!(self, RunOutcome::Skipped { .. })
  }
}

/// Transient state of one key while an attempt is outstanding or throttled.
#[derive(Debug, Clone)]
struct FetchGuard {
  last_attempt_at: Instant,
  /// Present only while the attempt is in flight
  token: Option<CancelToken>,
}

impl FetchGuard {
  fn in_flight(&self) -> bool {
    self.token.is_some()
  }

  fn holds(&self, token: &CancelToken) -> bool {
    self
      .token
      .as_ref()
      .map(|t| t.same_attempt(token))
      .unwrap_or(false)
  }
}

struct KeyState {
  guard: Option<FetchGuard>,
  error: Option<SyncError>,
  revision: watch::Sender<u64>,
}

impl KeyState {
  fn new() -> Self {
    let (revision, _) = watch::channel(0);
    Self {
      guard: None,
      error: None,
      revision,
    }
  }

  fn bump(&self) {
    self.revision.send_modify(|r| *r = r.wrapping_add(1));
  }

  /// Cancel the attempt in flight, if any. Its result will be discarded.
  fn cancel_in_flight(&mut self) -> Option<CancelToken> {
    let token = self.guard.as_mut().and_then(|g| g.token.take())?;
    token.cancel();
    Some(token)
  }

  /// Nobody watches the key, nothing is in flight and the throttle window
  /// of the last attempt has passed.
  fn is_idle(&self, now: Instant, throttle_window: Duration) -> bool {
    if self.revision.receiver_count() > 0 {
      return false;
    }
    match &self.guard {
      None => true,
      Some(guard) => {
        !guard.in_flight() && now.saturating_duration_since(guard.last_attempt_at) >= throttle_window
      }
    }
  }

  /// Release the in-flight marker held by `token`, keeping the attempt time
  /// for throttling. Returns `false` if a newer attempt owns the key.
  fn release(&mut self, token: &CancelToken) -> bool {
    match self.guard.as_mut() {
      Some(guard) if guard.holds(token) => {
        guard.token = None;
        true
      }
      _ => false,
    }
  }
}

/// Coordinates fetches for every key of a context.
///
/// At most one attempt per key is in flight. Results are only written to the
/// cache while the attempt still owns the key, so a superseded attempt can
/// never overwrite data from a newer one.
pub struct FetchCoordinator {
  cache: Arc<ResourceCache>,
  reachability: Arc<dyn Reachability>,
  config: FetchConfig,
  keys: Mutex<HashMap<String, KeyState>>,
  generations: AtomicU64,
}

impl FetchCoordinator {
  pub fn new(
    cache: Arc<ResourceCache>,
    reachability: Arc<dyn Reachability>,
    config: FetchConfig,
  ) -> Self {
    Self {
      cache,
      reachability,
      config,
      keys: Mutex::new(HashMap::new()),
      generations: AtomicU64::new(0),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, KeyState>> {
    self.keys.lock().unwrap_or_else(|poison| poison.into_inner())
  }

  pub fn cache(&self) -> &Arc<ResourceCache> {
    &self.cache
  }

  pub fn config(&self) -> &FetchConfig {
    &self.config
  }

  /// Run `fetch` for `key` unless the cache, the in-flight guard, the throttle
  /// window or the connection state says not to.
  pub async fn run<T, F, Fut>(&self, key: &str, options: RunOptions, fetch: F) -> RunOutcome<T>
  where
    T: Send + Sync + 'static,
    F: FnOnce(CancelToken) -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
  {
    if !options.force {
      if let Some(entry) = self.cache.get::<T>(key) {
        if entry.is_fresh(options.ttl) {
          return RunOutcome::Fresh(entry);
        }
      }
      if !self.reachability.is_reachable() {
        debug!(key = %key, "Backend unreachable, serving cached data");
        return RunOutcome::Skipped {
          reason: SkipReason::Offline,
          cached: self.cache.get(key),
        };
      }
    }

    let token = match self.begin(key, options.force) {
      Ok(token) => token,
      Err(reason) => {
        debug!(key = %key, ?reason, "Fetch skipped");
        return RunOutcome::Skipped {
          reason,
          cached: self.cache.get(key),
        };
      }
    };

    let mut release = ReleaseOnDrop {
      coordinator: self,
      key,
      token: &token,
      armed: true,
    };

    let timeout = self.config.fetch_timeout();
    let pending = fetch(token.clone());
    let result = tokio::select! {
      biased;
      _ = token.cancelled() => Err(SyncError::Cancelled),
      res = tokio::time::timeout(timeout, pending) => {
        res.unwrap_or_else(|_| Err(SyncError::Timeout(timeout)))
      }
    };

    release.armed = false;
    self.settle(key, &token, result)
  }

  /// Claim the key for a new attempt.
  fn begin(&self, key: &str, force: bool) -> Result<CancelToken, SkipReason> {
    let now = Instant::now();
    let mut keys = self.lock();
    let state = keys.entry(key.to_string()).or_insert_with(KeyState::new);

    if !force {
      if let Some(guard) = &state.guard {
        if guard.in_flight() {
          return Err(SkipReason::InFlight);
        }
        if now.saturating_duration_since(guard.last_attempt_at) < self.config.throttle_window() {
          return Err(SkipReason::Throttled);
        }
      }
    }

    if let Some(previous) = state.cancel_in_flight() {
      debug!(key = %key, generation = previous.generation(), "Superseding in-flight fetch");
    }

    let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
    let token = CancelToken::new(generation);
    state.guard = Some(FetchGuard {
      last_attempt_at: now,
      token: Some(token.clone()),
    });
    state.bump();
    Ok(token)
  }

  fn settle<T>(
    &self,
    key: &str,
    token: &CancelToken,
    result: Result<T, SyncError>,
  ) -> RunOutcome<T>
  where
    T: Send + Sync + 'static,
  {
    let outcome = {
      let mut keys = self.lock();
      let Some(state) = keys.get_mut(key) else {
        return RunOutcome::Cancelled;
      };
      if token.is_cancelled() || !state.release(token) {
        debug!(key = %key, generation = token.generation(), "Discarding superseded result");
        return RunOutcome::Cancelled;
      }

      let outcome = match result {
        Ok(value) => {
          state.error = None;
          RunOutcome::Fetched(self.cache.set(key, value))
        }
        Err(SyncError::Cancelled) => RunOutcome::Cancelled,
        Err(error) => {
          warn!(key = %key, error = %error, "Fetch failed");
          state.error = Some(error.clone());
          RunOutcome::Failed {
            error,
            cached: self.cache.get(key),
          }
        }
      };
      state.bump();
      outcome
    };

    match &outcome {
      RunOutcome::Fetched(_) => self.reachability.report_success(),
      RunOutcome::Failed { error, .. } => self.reachability.report_failure(error),
      _ => {}
    }
    outcome
  }

  /// Why a non-forced run of `key` would not call its fetch function right
  /// now, ignoring freshness. `None` means it would.
  pub fn skip_reason(&self, key: &str) -> Option<SkipReason> {
    if !self.reachability.is_reachable() {
      return Some(SkipReason::Offline);
    }
    let keys = self.lock();
    let guard = keys.get(key)?.guard.as_ref()?;
    if guard.in_flight() {
      Some(SkipReason::InFlight)
    } else if guard.last_attempt_at.elapsed() < self.config.throttle_window() {
      Some(SkipReason::Throttled)
    } else {
      None
    }
  }

  /// Cancel the outstanding attempt for `key`, if any.
  pub fn cancel(&self, key: &str) -> bool {
    let mut keys = self.lock();
    let Some(state) = keys.get_mut(key) else {
      return false;
    };
    let Some(token) = state.cancel_in_flight() else {
      return false;
    };
    debug!(key = %key, generation = token.generation(), "Fetch cancelled");
    state.bump();
    true
  }

  pub fn cancel_all(&self) {
    let mut keys = self.lock();
    for state in keys.values_mut() {
      if state.cancel_in_flight().is_some() {
        state.bump();
      }
    }
  }

  /// Store a value produced by a mutation. An attempt already in flight for
  /// `key` started before the mutation, so it is cancelled and its result
  /// discarded.
  pub fn write<T: Send + Sync + 'static>(&self, key: &str, value: T) -> CacheEntry<T> {
    let mut keys = self.lock();
    let entry = self.cache.set(key, value);
    if let Some(state) = keys.get_mut(key) {
      if let Some(token) = state.cancel_in_flight() {
        debug!(key = %key, generation = token.generation(), "Mutation supersedes in-flight fetch");
      }
      state.error = None;
      state.bump();
    }
    entry
  }

  /// Mark the cached value of `key` expired after a mutation. The stale value
  /// stays servable; an attempt already in flight is cancelled because it may
  /// carry pre-mutation data.
  pub fn invalidate(&self, key: &str) -> bool {
    let mut keys = self.lock();
    let hit = self.cache.invalidate(key);
    if let Some(state) = keys.get_mut(key) {
      let cancelled = state.cancel_in_flight().is_some();
      if hit || cancelled {
        state.bump();
      }
    }
    hit
  }

  pub fn invalidate_all(&self) {
    let mut keys = self.lock();
    self.cache.invalidate_all();
    for state in keys.values_mut() {
      state.cancel_in_flight();
      state.bump();
    }
  }

  /// Drop the bookkeeping of keys nobody watches any more. Keys with an
  /// attempt in flight or inside the throttle window are kept for a later
  /// pass. Cached values are not touched.
  pub fn prune(&self) -> usize {
    let now = Instant::now();
    let window = self.config.throttle_window();
    let mut keys = self.lock();
    let before = keys.len();
    keys.retain(|_, state| !state.is_idle(now, window));
    let pruned = before - keys.len();
    if pruned > 0 {
      debug!(pruned, remaining = keys.len(), "Pruned idle fetch state");
    }
    pruned
  }

  /// Keys with fetch bookkeeping, sorted
  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.lock().keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn is_in_flight(&self, key: &str) -> bool {
    self
      .lock()
      .get(key)
      .and_then(|s| s.guard.as_ref())
      .map(FetchGuard::in_flight)
      .unwrap_or(false)
  }

  /// Last error of `key`, cleared by the next successful fetch.
  pub fn error(&self, key: &str) -> Option<SyncError> {
    self.lock().get(key).and_then(|s| s.error.clone())
  }

  /// Revision counter of `key`; changes whenever its data, error or
  /// in-flight status changes.
  pub fn watch(&self, key: &str) -> watch::Receiver<u64> {
    self
      .lock()
      .entry(key.to_string())
      .or_insert_with(KeyState::new)
      .revision
      .subscribe()
  }
}

/// Releases the in-flight marker if the run future is dropped mid-flight.
struct ReleaseOnDrop<'a> {
  coordinator: &'a FetchCoordinator,
  key: &'a str,
  token: &'a CancelToken,
  armed: bool,
}

impl Drop for ReleaseOnDrop<'_> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let mut keys = self.coordinator.lock();
    if let Some(state) = keys.get_mut(self.key) {
      if state.release(self.token) {
        self.token.cancel();
        state.bump();
      }
    }
  }
}
