//! In-memory store of the last known good value per resource key.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::entry::CacheEntry;

struct StoredEntry {
  value: Arc<dyn Any + Send + Sync>,
  fetched_at: Instant,
  cached_at: DateTime<Utc>,
  invalidated: bool,
}

/// Keyed cache shared by every resource of a context.
///
/// Values of different types live side by side; a lookup with the wrong type
/// behaves like a miss. Freshness is always decided by the caller's TTL, the
/// cache itself never expires anything.
#[derive(Default)]
pub struct ResourceCache {
  entries: Mutex<HashMap<String, StoredEntry>>,
}

impl ResourceCache {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredEntry>> {
    self.entries.lock().unwrap_or_else(|poison| poison.into_inner())
  }

  pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<CacheEntry<T>> {
    let entries = self.lock();
    let stored = entries.get(key)?;
    match Arc::clone(&stored.value).downcast::<T>() {
      Ok(value) => Some(CacheEntry {
        key: key.to_string(),
        value,
        fetched_at: stored.fetched_at,
        cached_at: stored.cached_at,
        invalidated: stored.invalidated,
      }),
      Err(_) => {
        warn!(key = %key, "Cached value has a different type than requested");
        None
      }
    }
  }

  /// Overwrite the entry for `key`, stamping it with the current time.
  pub fn set<T: Send + Sync + 'static>(&self, key: &str, value: T) -> CacheEntry<T> {
    let entry = CacheEntry::new(key, Arc::new(value));
    let stored = StoredEntry {
      value: Arc::clone(&entry.value) as Arc<dyn Any + Send + Sync>,
      fetched_at: entry.fetched_at,
      cached_at: entry.cached_at,
      invalidated: false,
    };
    self.lock().insert(key.to_string(), stored);
    debug!(key = %key, "Cache entry stored");
    entry
  }

  /// `true` if an entry exists, was not invalidated, and is younger than `ttl`.
  pub fn is_fresh(&self, key: &str, ttl: Duration) -> bool {
    self
      .lock()
      .get(key)
      .map(|e| !e.invalidated && Instant::now().saturating_duration_since(e.fetched_at) < ttl)
      .unwrap_or(false)
  }

  pub fn age(&self, key: &str) -> Option<Duration> {
    self
      .lock()
      .get(key)
      .map(|e| Instant::now().saturating_duration_since(e.fetched_at))
  }

  pub fn contains(&self, key: &str) -> bool {
    self.lock().contains_key(key)
  }

  /// Mark an entry as expired so the next read refetches. The value remains
  /// available as stale data. Returns `false` if there was no entry.
  pub fn invalidate(&self, key: &str) -> bool {
    match self.lock().get_mut(key) {
      Some(entry) => {
        entry.invalidated = true;
        debug!(key = %key, "Cache entry invalidated");
        true
      }
      None => false,
    }
  }

  pub fn invalidate_all(&self) {
    for entry in self.lock().values_mut() {
      entry.invalidated = true;
    }
  }

  /// Drop an entry entirely; readers see "never fetched" afterwards.
  pub fn remove(&self, key: &str) -> bool {
    self.lock().remove(key).is_some()
  }

  pub fn clear(&self) {
    self.lock().clear();
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.lock().keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }
}

impl std::fmt::Debug for ResourceCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ResourceCache")
      .field("keys", &self.keys())
      .finish()
  }
}
