//! Explicitly owned synchronization context.
//!
//! One `SyncContext` per process (or per test) holds the connection monitor,
//! the cache, the fetch coordinator and the registry of live resources.
//! Create it with [`SyncContext::init`] on startup and tear it down with
//! [`SyncContext::dispose`].

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::cache::ResourceCache;
use crate::config::SyncConfig;
use crate::connection::{ConnectionEvent, ConnectionMonitor, HostSignal, SubscriptionId};
use crate::error::SyncError;
use crate::fetch::{CancelToken, FetchCoordinator};
use crate::resource::{Lease, ResourceCore, ResourceOptions, SyncedResource};

struct Registration {
  core: Arc<dyn Any + Send + Sync>,
  handles: usize,
  listener: SubscriptionId,
}

struct Inner {
  config: SyncConfig,
  monitor: ConnectionMonitor,
  cache: Arc<ResourceCache>,
  coordinator: Arc<FetchCoordinator>,
  registry: Mutex<HashMap<String, Registration>>,
  disposed: AtomicBool,
}

impl Inner {
  fn lock(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
    self.registry.lock().unwrap_or_else(|poison| poison.into_inner())
  }

  /// Drop one handle of `key`; the last one cancels the outstanding fetch,
  /// stops the recovery listener and lets the coordinator forget idle keys.
  fn release(&self, key: &str) {
    let removed = {
      let mut registry = self.lock();
      let Some(registration) = registry.get_mut(key) else {
        return;
      };
      registration.handles -= 1;
      if registration.handles > 0 {
        return;
      }
      registry.remove(key)
    };

    if let Some(registration) = removed {
      debug!(key = %key, "Last subscriber gone, releasing resource");
      self.coordinator.cancel(key);
      self.monitor.unlisten(registration.listener);
      self.coordinator.prune();
    }
  }
}

/// Owner of everything a process needs to keep resources in sync.
///
/// Cloning yields another handle to the same context.
#[derive(Clone)]
pub struct SyncContext {
  inner: Arc<Inner>,
}

impl SyncContext {
  /// Validate `config`, start the connection monitor and return the context.
  /// Must be called from within a tokio runtime.
  pub fn init(config: SyncConfig, backend: Arc<dyn Backend>) -> Result<Self, SyncError> {
    config.validate()?;

    let monitor = ConnectionMonitor::new(backend, config.connection.clone());
    let cache = Arc::new(ResourceCache::new());
    let coordinator = Arc::new(FetchCoordinator::new(
      Arc::clone(&cache),
      Arc::new(monitor.clone()),
      config.fetch.clone(),
    ));
    monitor.start();
    info!("Sync context initialised");

    Ok(Self {
      inner: Arc::new(Inner {
        config,
        monitor,
        cache,
        coordinator,
        registry: Mutex::new(HashMap::new()),
        disposed: AtomicBool::new(false),
      }),
    })
  }

  /// Cancel every outstanding fetch, stop all timers and listeners. Cached
  /// data stays readable. Safe to call more than once.
  pub fn dispose(&self) {
    if self.inner.disposed.swap(true, Ordering::SeqCst) {
      return;
    }
    self.inner.coordinator.cancel_all();
    self.inner.monitor.dispose();
    let released = {
      let mut registry = self.inner.lock();
      let count = registry.len();
      registry.clear();
      count
    };
    info!(resources = released, "Sync context disposed");
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.disposed.load(Ordering::SeqCst)
  }

  /// Subscribe to `key`.
  ///
  /// The first subscription registers `fetch` and the options for the key;
  /// later subscriptions share them and their own `fetch` is ignored. Fails
  /// if the key is already registered with a different value type or the
  /// context was disposed.
  pub fn subscribe<T, F, Fut>(
    &self,
    key: &str,
    options: ResourceOptions,
    fetch: F,
  ) -> Result<SyncedResource<T>, SyncError>
  where
    T: Send + Sync + 'static,
    F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    if self.is_disposed() {
      return Err(SyncError::Unknown("sync context was disposed".to_string()));
    }

    let core = {
      let mut registry = self.inner.lock();
      match registry.get_mut(key) {
        Some(registration) => {
          let core = Arc::clone(&registration.core)
            .downcast::<ResourceCore<T>>()
            .map_err(|_| {
              SyncError::Config(format!(
                "resource {} is already registered with a different type",
                key
              ))
            })?;
          registration.handles += 1;
          core
        }
        None => {
          let ttl = options
            .ttl
            .unwrap_or_else(|| self.inner.config.fetch.default_ttl());
          let core = Arc::new(ResourceCore::new(
            key.to_string(),
            ttl,
            Arc::clone(&self.inner.coordinator),
            fetch,
          ));
          let task = spawn_recovery(Arc::clone(&core), &self.inner.monitor);
          let listener = self
            .inner
            .monitor
            .subscriptions()
            .track(format!("resource:{}", key), task);
          registry.insert(
            key.to_string(),
            Registration {
              core: Arc::clone(&core) as Arc<dyn Any + Send + Sync>,
              handles: 1,
              listener,
            },
          );
          debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Resource registered");
          core
        }
      }
    };

    let weak: Weak<Inner> = Arc::downgrade(&self.inner);
    let owned_key = key.to_string();
    let lease = Lease::new(move || {
      if let Some(inner) = weak.upgrade() {
        inner.release(&owned_key);
      }
    });

    let resource = SyncedResource::from_core(core, Some(lease));
    if options.refresh_on_mount {
      resource.mount();
    }
    Ok(resource)
  }

  /// Mark `keys` expired after a mutation and wake their subscribers.
  /// Cached values stay servable until the refetch lands; fetches already in
  /// flight for those keys are cancelled.
  pub fn invalidate<K: AsRef<str>>(&self, keys: &[K]) {
    for key in keys {
      self.inner.coordinator.invalidate(key.as_ref());
    }
  }

  pub fn invalidate_all(&self) {
    self.inner.coordinator.invalidate_all();
  }

  /// Write a value produced by a mutation directly into the cache. A fetch
  /// of `key` that is still in flight started before the mutation and is
  /// cancelled.
  pub fn set<T: Send + Sync + 'static>(&self, key: &str, value: T) {
    self.inner.coordinator.write(key, value);
  }

  pub fn handle_signal(&self, signal: HostSignal) {
    self.inner.monitor.handle_signal(signal);
  }

  pub fn monitor(&self) -> &ConnectionMonitor {
    &self.inner.monitor
  }

  pub fn cache(&self) -> &Arc<ResourceCache> {
    &self.inner.cache
  }

  pub fn coordinator(&self) -> &Arc<FetchCoordinator> {
    &self.inner.coordinator
  }

  pub fn config(&self) -> &SyncConfig {
    &self.inner.config
  }

  /// Keys with at least one live subscriber, sorted
  pub fn resource_keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.inner.lock().keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn subscriber_count(&self, key: &str) -> usize {
    self.inner.lock().get(key).map(|r| r.handles).unwrap_or(0)
  }
}

impl std::fmt::Debug for SyncContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SyncContext")
      .field("monitor", &self.inner.monitor)
      .field("resources", &self.resource_keys())
      .field("disposed", &self.is_disposed())
      .finish()
  }
}

/// Refresh a resource when the connection comes back or the host becomes
/// visible again, but only if its entry is stale or missing.
fn spawn_recovery<T: Send + Sync + 'static>(
  core: Arc<ResourceCore<T>>,
  monitor: &ConnectionMonitor,
) -> JoinHandle<()> {
  let mut events = monitor.events();
  let mut signals = monitor.signals();

  tokio::spawn(async move {
    loop {
      tokio::select! {
        event = events.recv() => match event {
          Ok(ConnectionEvent::Restored) => {
            core.refresh_if_stale().await;
          }
          Ok(_) => {}
          Err(RecvError::Lagged(skipped)) => {
            debug!(key = %core.key(), skipped, "Missed connection events");
          }
          Err(RecvError::Closed) => break,
        },
        signal = signals.recv() => match signal {
          Ok(HostSignal::Visible) => {
            core.refresh_if_stale().await;
          }
          Ok(_) | Err(RecvError::Lagged(_)) => {}
          Err(RecvError::Closed) => break,
        },
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  struct UpBackend;

  #[async_trait]
  impl Backend for UpBackend {
    async fn probe(&self) -> Result<(), SyncError> {
      Ok(())
    }
  }

  fn context() -> SyncContext {
    SyncContext::init(SyncConfig::default(), Arc::new(UpBackend)).unwrap()
  }

  fn numbers(
    ctx: &SyncContext,
    key: &str,
    calls: &Arc<AtomicU32>,
  ) -> SyncedResource<u32> {
    let calls = Arc::clone(calls);
    ctx
      .subscribe(key, ResourceOptions::default(), move |_| {
        let calls = Arc::clone(&calls);
        async move {
          tokio::time::sleep(Duration::from_millis(100)).await;
          Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
        }
      })
      .unwrap()
  }

  #[tokio::test(start_paused = true)]
  async fn test_init_rejects_invalid_config() {
    let mut config = SyncConfig::default();
    config.connection.max_attempts = 0;
    let err = SyncContext::init(config, Arc::new(UpBackend)).unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscribers_share_one_entry_and_fetch() {
    let ctx = context();
    let calls = Arc::new(AtomicU32::new(0));

    let a = numbers(&ctx, "clients", &calls);
    let b = numbers(&ctx, "clients", &calls);
    assert_eq!(ctx.subscriber_count("clients"), 2);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.data(), b.data());
    ctx.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_last_drop_cancels_fetch_and_keeps_cache() {
    let ctx = context();
    let calls = Arc::new(AtomicU32::new(0));

    let first = numbers(&ctx, "clients", &calls);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(first.data().as_deref(), Some(&1));

    let handle = first.refresh_in_background(true);
    let clone = first.clone();
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(first);
    assert_eq!(ctx.subscriber_count("clients"), 1);
    drop(clone);

    assert!(ctx.resource_keys().is_empty());
    assert!(matches!(
      handle.await.unwrap(),
      crate::fetch::RunOutcome::Cancelled
    ));
    assert_eq!(*ctx.cache().get::<u32>("clients").unwrap().value, 1);
    ctx.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_type_mismatch_is_rejected() {
    let ctx = context();
    let calls = Arc::new(AtomicU32::new(0));
    let _numbers = numbers(&ctx, "clients", &calls);

    let err = ctx
      .subscribe("clients", ResourceOptions::default().lazy(), |_| async {
        Ok::<_, SyncError>("text".to_string())
      })
      .unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
    ctx.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_marks_stale_and_wakes_subscribers() {
    let ctx = context();
    let calls = Arc::new(AtomicU32::new(0));
    let resource = numbers(&ctx, "clients", &calls);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(resource.is_fresh());

    let mut watcher = resource.clone();
    ctx.invalidate(&["clients", "unknown"]);
    let snap = watcher.changed().await;
    assert!(snap.is_stale);
    assert_eq!(snap.data.as_deref(), Some(&1));

    ctx.set("clients", 7u32);
    assert!(resource.is_fresh());
    assert_eq!(resource.data().as_deref(), Some(&7));
    ctx.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_visible_signal_refreshes_only_stale_resources() {
    let ctx = context();
    let calls = Arc::new(AtomicU32::new(0));
    let resource = numbers(&ctx, "clients", &calls);
    tokio::time::sleep(Duration::from_millis(200)).await;

    ctx.handle_signal(HostSignal::Visible);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    resource.invalidate();
    ctx.handle_signal(HostSignal::Visible);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(resource.is_fresh());
    ctx.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_dispose_stops_everything() {
    let ctx = context();
    let calls = Arc::new(AtomicU32::new(0));
    let resource = numbers(&ctx, "clients", &calls);

    tokio::time::sleep(Duration::from_millis(10)).await;
    ctx.dispose();
    ctx.dispose();

    assert!(ctx.is_disposed());
    assert!(ctx.monitor().subscriptions().is_empty());
    assert!(ctx.resource_keys().is_empty());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(resource.data().is_none());
    assert!(ctx
      .subscribe("other", ResourceOptions::default(), |_| async { Ok::<_, SyncError>(1u8) })
      .is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn test_set_during_fetch_is_not_overwritten() {
    let ctx = context();
    let calls = Arc::new(AtomicU32::new(0));
    let resource = numbers(&ctx, "clients", &calls);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(resource.snapshot().loading);
    ctx.set("clients", 42u32);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let snap = resource.snapshot();
    assert_eq!(snap.data.as_deref(), Some(&42));
    assert!(!snap.is_stale);
    assert!(!snap.loading);
    ctx.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_released_keys_are_forgotten() {
    let ctx = context();
    let calls = Arc::new(AtomicU32::new(0));

    let early = numbers(&ctx, "notifications:1", &calls);
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(early);
    // Released inside the throttle window, kept for now
    assert!(ctx.resource_keys().is_empty());
    assert_eq!(ctx.coordinator().keys(), vec!["notifications:1"]);

    let late = numbers(&ctx, "notifications:2", &calls);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
      ctx.coordinator().keys(),
      vec!["notifications:1", "notifications:2"]
    );
    drop(late);

    assert!(ctx.resource_keys().is_empty());
    assert!(ctx.coordinator().keys().is_empty());
    // Cached values outlive their bookkeeping
    assert_eq!(*ctx.cache().get::<u32>("notifications:2").unwrap().value, 2);

    let again = numbers(&ctx, "notifications:2", &calls);
    assert!(again.data().is_some());
    ctx.dispose();
  }
}
