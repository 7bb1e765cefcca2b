//! Explicit listener bookkeeping.
//!
//! Every timer and signal listener a monitor starts is recorded here together
//! with its cancellation handle, and torn down in one place.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A running listener and the means to stop it
pub struct Subscription {
  id: SubscriptionId,
  name: String,
  cancel: Box<dyn FnOnce() + Send>,
}

impl Subscription {
  pub fn from_task<T: Send + 'static>(id: SubscriptionId, name: impl Into<String>, task: JoinHandle<T>) -> Self {
    Self {
      id,
      name: name.into(),
      cancel: Box::new(move || task.abort()),
    }
  }

  pub fn id(&self) -> SubscriptionId {
    self.id
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn cancel(self) {
    debug!(subscription = %self.name, "Cancelling subscription");
    (self.cancel)();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("id", &self.id)
      .field("name", &self.name)
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Default)]
pub struct SubscriptionList {
  next_id: AtomicU64,
  entries: Mutex<Vec<Subscription>>,
}

impl SubscriptionList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn next_id(&self) -> SubscriptionId {
    SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
  }

  /// Record a spawned listener task
  pub fn track<T: Send + 'static>(&self, name: impl Into<String>, task: JoinHandle<T>) -> SubscriptionId {
    let id = self.next_id();
    self.push(Subscription::from_task(id, name, task));
    id
  }

  pub fn push(&self, subscription: Subscription) {
    self
      .entries
      .lock()
      .unwrap_or_else(|poison| poison.into_inner())
      .push(subscription);
  }

  /// Cancel and forget one listener. Returns `false` if it was unknown.
  pub fn cancel(&self, id: SubscriptionId) -> bool {
    let removed = {
      let mut entries = self.entries.lock().unwrap_or_else(|poison| poison.into_inner());
      entries
        .iter()
        .position(|s| s.id == id)
        .map(|idx| entries.swap_remove(idx))
    };
    match removed {
      Some(subscription) => {
        subscription.cancel();
        true
      }
      None => false,
    }
  }

  /// Cancel every listener, returning how many were stopped
  pub fn cancel_all(&self) -> usize {
    let drained: Vec<Subscription> = self
      .entries
      .lock()
      .unwrap_or_else(|poison| poison.into_inner())
      .drain(..)
      .collect();
    let count = drained.len();
    for subscription in drained {
      subscription.cancel();
    }
    count
  }

  pub fn len(&self) -> usize {
    self.entries.lock().unwrap_or_else(|poison| poison.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
