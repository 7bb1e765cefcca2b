//! Cache entries and metadata about where served data came from.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// The last successful result for a resource key.
///
/// Entries are overwritten (never merged) on every successful fetch. The
/// value is shared behind an `Arc` so handing it to many subscribers is cheap.
#[derive(Debug)]
pub struct CacheEntry<T> {
  pub key: String,
  pub value: Arc<T>,
  /// Monotonic fetch time, used for every freshness decision
  pub fetched_at: Instant,
  /// Wall-clock fetch time, for display only
  pub cached_at: DateTime<Utc>,
  /// Set by an explicit invalidation; the value stays servable as stale data
  pub(crate) invalidated: bool,
}

// Manual impl: `T` itself does not need to be `Clone`
impl<T> Clone for CacheEntry<T> {
  fn clone(&self) -> Self {
    Self {
      key: self.key.clone(),
      value: Arc::clone(&self.value),
      fetched_at: self.fetched_at,
      cached_at: self.cached_at,
      invalidated: self.invalidated,
    }
  }
}

impl<T> CacheEntry<T> {
  pub fn new(key: impl Into<String>, value: Arc<T>) -> Self {
    Self {
      key: key.into(),
      value,
      fetched_at: Instant::now(),
      cached_at: Utc::now(),
      invalidated: false,
    }
  }

  pub fn age(&self) -> Duration {
    Instant::now().saturating_duration_since(self.fetched_at)
  }

  /// Derived flag: older than `ttl`, or explicitly invalidated.
  pub fn is_stale(&self, ttl: Duration) -> bool {
    self.invalidated || self.age() > ttl
  }

  pub fn is_fresh(&self, ttl: Duration) -> bool {
    !self.invalidated && self.age() < ttl
  }

  pub fn is_invalidated(&self) -> bool {
    self.invalidated
  }

  pub fn age_display(&self) -> String {
    format_age(self.age())
  }
}

fn format_age(age: Duration) -> String {
  let secs = age.as_secs();
  if secs < 5 {
    "just now".to_string()
  } else if secs < 60 {
    format!("{}s ago", secs)
  } else if secs < 3600 {
    format!("{}m ago", secs / 60)
  } else if secs < 86_400 {
    let hours = secs / 3600;
    let remaining_mins = (secs % 3600) / 60;
    if remaining_mins >= 30 {
      // Round up: 1h 30m+ becomes 2h
      format!("{}h ago", hours + 1)
    } else {
      format!("{}h ago", hours)
    }
  } else {
    format!("{}d ago", secs / 86_400)
  }
}

/// Indicates where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, stale but served because a refresh is skipped or failed
  CacheStale,
}
