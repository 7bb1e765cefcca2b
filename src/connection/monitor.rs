//! Backend reachability tracking and automatic reconnection.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::MonitorConfig;
use crate::error::SyncError;
use crate::fetch::Reachability;

use super::state::{
  ConnectionEvent, ConnectionState, ConnectionStatus, HostSignal, ReconnectPolicy, TriggerReason,
};
use super::subscription::{SubscriptionId, SubscriptionList};

/// Buffered notifications per receiver before it starts lagging
const EVENT_CAPACITY: usize = 64;

/// Instructions for the driver task, which owns every timer
#[derive(Debug)]
enum Command {
  Trigger(TriggerReason),
  Schedule(Duration),
  CancelRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeVerdict {
  Reachable,
  Unreachable,
  SessionExpired,
}

struct MonitorState {
  status: ConnectionStatus,
  visible: bool,
  hidden_since: Option<Instant>,
  disposed: bool,
}

/// Side effects collected under the state lock and released after it
#[derive(Default)]
struct Effects {
  events: Vec<ConnectionEvent>,
  commands: Vec<Command>,
}

struct Inner {
  backend: Arc<dyn Backend>,
  config: MonitorConfig,
  policy: ReconnectPolicy,
  state: Mutex<MonitorState>,
  status_tx: watch::Sender<ConnectionStatus>,
  events_tx: broadcast::Sender<ConnectionEvent>,
  signals_tx: broadcast::Sender<HostSignal>,
  commands_tx: mpsc::UnboundedSender<Command>,
  commands_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
  subscriptions: SubscriptionList,
}

/// Maintains a best-effort belief about backend reachability.
///
/// The monitor is the only writer of [`ConnectionStatus`]; everybody else
/// reads it synchronously through [`ConnectionMonitor::status`]. Probe
/// failures never surface as errors, they only move the state machine:
///
/// ```text
/// CONNECTED ──probe fails / offline──▶ DISCONNECTED ──▶ RECONNECTING
///     ▲                                    ▲               │
///     └────────────── probe ok ────────────┼───────────────┤
///                                          └── retry later ┘
/// ```
///
/// Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct ConnectionMonitor {
  inner: Arc<Inner>,
}

impl ConnectionMonitor {
  /// Create a monitor. Timers only run after [`ConnectionMonitor::start`].
  pub fn new(backend: Arc<dyn Backend>, config: MonitorConfig) -> Self {
    let status = ConnectionStatus::default();
    let (status_tx, _) = watch::channel(status);
    let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
    let (signals_tx, _) = broadcast::channel(EVENT_CAPACITY);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    Self {
      inner: Arc::new(Inner {
        backend,
        policy: ReconnectPolicy::from(&config),
        config,
        state: Mutex::new(MonitorState {
          status,
          visible: true,
          hidden_since: None,
          disposed: false,
        }),
        status_tx,
        events_tx,
        signals_tx,
        commands_tx,
        commands_rx: Mutex::new(Some(commands_rx)),
        subscriptions: SubscriptionList::new(),
      }),
    }
  }

  /// Spawn the driver task that runs periodic probes and scheduled
  /// reconnects. Returns `false` if it was already started.
  pub fn start(&self) -> bool {
    let commands = self
      .inner
      .commands_rx
      .lock()
      .unwrap_or_else(|poison| poison.into_inner())
      .take();
    let Some(commands) = commands else {
      return false;
    };

    let task = tokio::spawn(drive(
      Arc::downgrade(&self.inner),
      commands,
      self.inner.config.ping_interval(),
    ));
    self.inner.subscriptions.track("connection-driver", task);
    info!(
      ping_interval_ms = self.inner.config.ping_interval_ms,
      "Connection monitor started"
    );
    true
  }

  /// Stop every timer and listener. The monitor keeps its last status but
  /// ignores all further signals and reports.
  pub fn dispose(&self) {
    self.update(|st, _| st.disposed = true);
    let stopped = self.inner.subscriptions.cancel_all();
    debug!(stopped, "Connection monitor disposed");
  }

  pub fn status(&self) -> ConnectionStatus {
    *self.inner.status_tx.borrow()
  }

  pub fn state(&self) -> ConnectionState {
    self.status().state
  }

  pub fn config(&self) -> &MonitorConfig {
    &self.inner.config
  }

  pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
    self.inner.status_tx.subscribe()
  }

  /// Wait for the next status change and return the new status
  pub async fn changed(&self) -> ConnectionStatus {
    let mut rx = self.inner.status_tx.subscribe();
    // Cannot fail while `self` holds the sender
    let _ = rx.changed().await;
    let status = *rx.borrow();
    status
  }

  pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
    self.inner.events_tx.subscribe()
  }

  /// Host signals accepted by this monitor, re-broadcast for resources
  pub fn signals(&self) -> broadcast::Receiver<HostSignal> {
    self.inner.signals_tx.subscribe()
  }

  pub fn subscriptions(&self) -> &SubscriptionList {
    &self.inner.subscriptions
  }

  /// Probe the backend once and update the state machine.
  pub async fn probe(&self) -> bool {
    let result = self.run_probe().await;
    self.apply_probe(result) == ProbeVerdict::Reachable
  }

  /// Try to reconnect, scheduling the next attempt with exponential backoff
  /// on failure. No-op while an attempt is running or once attempts are
  /// exhausted.
  pub async fn attempt_reconnect(&self) {
    let attempt = self.update(|st, fx| {
      if st.disposed
        || st.status.state == ConnectionState::Reconnecting
        || self.inner.policy.exhausted(st.status.reconnect_attempt)
      {
        return None;
      }
      st.status.state = ConnectionState::Reconnecting;
      st.status.reconnect_attempt += 1;
      let attempt = st.status.reconnect_attempt;
      fx.events.push(ConnectionEvent::Reconnecting { attempt });
      Some(attempt)
    });
    let Some(attempt) = attempt else {
      return;
    };
    info!(attempt, "Attempting to reconnect");

    if self.inner.config.refresh_credentials {
      if let Err(e) = self.inner.backend.refresh_credentials().await {
        if e.is_unauthenticated() {
          self.update(|st, fx| session_expired(st, fx));
          return;
        }
        warn!(error = %e, "Failed to refresh credentials");
      }
    }

    let result = self.run_probe().await;
    if self.apply_probe(result) != ProbeVerdict::Unreachable {
      return;
    }

    self.update(|st, fx| {
      // Another path (offline signal, fetch success) already moved on
      if st.disposed || st.status.state != ConnectionState::Reconnecting {
        return;
      }
      st.status.state = ConnectionState::Disconnected;

      if self.inner.policy.exhausted(attempt) {
        st.status.exhausted = true;
        error!(attempts = attempt, "Could not reconnect, waiting for an external trigger");
        fx.events.push(ConnectionEvent::Exhausted { attempts: attempt });
      } else {
        let delay = self.inner.policy.delay_after(attempt);
        info!(
          next_attempt = attempt + 1,
          delay_ms = delay.as_millis() as u64,
          "Reconnect failed, retry scheduled"
        );
        fx.events.push(ConnectionEvent::RetryScheduled {
          attempt: attempt + 1,
          delay,
        });
        fx.commands.push(Command::Schedule(delay));
      }
    });
  }

  /// Manual "check now": resets the attempt counter and probes or
  /// reconnects immediately.
  pub async fn check_now(&self) -> ConnectionStatus {
    self.trigger(TriggerReason::Manual).await;
    self.status()
  }

  /// Feed one host environment signal to the monitor.
  ///
  /// `Offline` takes effect before this returns; triggers are executed by
  /// the driver task.
  pub fn handle_signal(&self, signal: HostSignal) {
    match signal {
      HostSignal::Offline => self.update(|st, fx| {
        if st.disposed {
          return;
        }
        let was = st.status.state;
        st.status.state = ConnectionState::Disconnected;
        fx.commands.push(Command::CancelRetry);
        if was == ConnectionState::Connected {
          warn!("Host reported network offline");
          fx.events.push(ConnectionEvent::Lost);
        }
      }),
      HostSignal::Online => self.send(Command::Trigger(TriggerReason::Online)),
      HostSignal::Hidden => self.update(|st, _| {
        st.visible = false;
        st.hidden_since.get_or_insert_with(Instant::now);
      }),
      HostSignal::Visible => {
        let interval = self.inner.config.ping_interval();
        let long_hidden = self.update(|st, _| {
          st.visible = true;
          st.hidden_since
            .take()
            .map(|since| since.elapsed() > interval)
            .unwrap_or(false)
        });
        if long_hidden {
          self.send(Command::Trigger(TriggerReason::Visible));
        }
      }
      HostSignal::CheckNow => self.send(Command::Trigger(TriggerReason::Manual)),
    }
    let _ = self.inner.signals_tx.send(signal);
  }

  /// Forward every signal of `signals` to [`ConnectionMonitor::handle_signal`]
  /// until the stream ends or the monitor is disposed.
  pub fn listen<S>(&self, signals: S) -> SubscriptionId
  where
    S: Stream<Item = HostSignal> + Send + 'static,
  {
    let weak = Arc::downgrade(&self.inner);
    let task = tokio::spawn(async move {
      let mut signals = Box::pin(signals);
      while let Some(signal) = signals.next().await {
        let Some(monitor) = upgrade(&weak) else {
          break;
        };
        monitor.handle_signal(signal);
      }
    });
    self.inner.subscriptions.track("host-signals", task)
  }

  pub fn unlisten(&self, id: SubscriptionId) -> bool {
    self.inner.subscriptions.cancel(id)
  }

  async fn trigger(&self, reason: TriggerReason) {
    let state = self.update(|st, fx| {
      if st.disposed {
        return None;
      }
      if st.status.state != ConnectionState::Reconnecting {
        st.status.reconnect_attempt = 0;
      }
      st.status.exhausted = false;
      fx.commands.push(Command::CancelRetry);
      Some(st.status.state)
    });
    debug!(?reason, ?state, "Connection check triggered");

    match state {
      Some(ConnectionState::Connected) => {
        self.probe().await;
      }
      Some(ConnectionState::Disconnected) => self.attempt_reconnect().await,
      Some(ConnectionState::Reconnecting) | None => {}
    }
  }

  fn should_ping(&self) -> bool {
    let st = self.lock();
    !st.disposed && st.visible && st.status.state == ConnectionState::Connected
  }

  async fn run_probe(&self) -> Result<(), SyncError> {
    let timeout = self.inner.config.probe_timeout();
    match tokio::time::timeout(timeout, self.inner.backend.probe()).await {
      Ok(result) => result,
      Err(_) => Err(SyncError::Timeout(timeout)),
    }
  }

  fn apply_probe(&self, result: Result<(), SyncError>) -> ProbeVerdict {
    self.update(|st, fx| {
      if !st.disposed {
        st.status.last_probe_at = Some(Instant::now());
      }
      match result {
        Ok(()) => {
          if !st.disposed {
            mark_connected(st, fx);
          }
          ProbeVerdict::Reachable
        }
        Err(e) if e.is_unauthenticated() => {
          if !st.disposed {
            session_expired(st, fx);
          }
          ProbeVerdict::SessionExpired
        }
        Err(e) => {
          debug!(error = %e, "Probe failed");
          if !st.disposed {
            st.status.consecutive_failures += 1;
            mark_lost(st, fx);
          }
          ProbeVerdict::Unreachable
        }
      }
    })
  }

  fn lock(&self) -> MutexGuard<'_, MonitorState> {
    self.inner.state.lock().unwrap_or_else(|poison| poison.into_inner())
  }

  /// Mutate state under the lock, publish the new status, then release
  /// collected events and driver commands.
  fn update<R>(&self, f: impl FnOnce(&mut MonitorState, &mut Effects) -> R) -> R {
    let mut fx = Effects::default();
    let result = {
      let mut st = self.lock();
      let before = st.status;
      let result = f(&mut st, &mut fx);
      if st.status != before {
        self.inner.status_tx.send_replace(st.status);
      }
      result
    };
    for event in fx.events {
      let _ = self.inner.events_tx.send(event);
    }
    for command in fx.commands {
      self.send(command);
    }
    result
  }

  fn send(&self, command: Command) {
    // Fails only when the driver is gone, which means we are shutting down
    let _ = self.inner.commands_tx.send(command);
  }
}

fn mark_connected(st: &mut MonitorState, fx: &mut Effects) {
  let was = st.status.state;
  st.status.state = ConnectionState::Connected;
  st.status.consecutive_failures = 0;
  st.status.reconnect_attempt = 0;
  st.status.exhausted = false;
  fx.commands.push(Command::CancelRetry);
  if was != ConnectionState::Connected {
    info!("Connection restored");
    fx.events.push(ConnectionEvent::Restored);
  }
}

fn mark_lost(st: &mut MonitorState, fx: &mut Effects) {
  if st.status.state != ConnectionState::Connected {
    return;
  }
  warn!(
    failures = st.status.consecutive_failures,
    "Connection lost"
  );
  st.status.state = ConnectionState::Disconnected;
  fx.events.push(ConnectionEvent::Lost);
  fx.commands.push(Command::Schedule(Duration::ZERO));
}

fn session_expired(st: &mut MonitorState, fx: &mut Effects) {
  warn!("Backend rejected the session");
  if st.status.state == ConnectionState::Reconnecting {
    st.status.state = ConnectionState::Disconnected;
  }
  fx.commands.push(Command::CancelRetry);
  fx.events.push(ConnectionEvent::SessionExpired);
}

impl Reachability for ConnectionMonitor {
  fn is_reachable(&self) -> bool {
    self.state().is_connected()
  }

  fn report_success(&self) {
    self.update(|st, fx| {
      if !st.disposed && st.status.state != ConnectionState::Connected {
        debug!("Data fetch succeeded while disconnected");
        mark_connected(st, fx);
      }
    });
  }

  fn report_failure(&self, error: &SyncError) {
    self.update(|st, fx| {
      if st.disposed {
        return;
      }
      if error.is_unauthenticated() {
        session_expired(st, fx);
      } else if error.is_connectivity() {
        st.status.consecutive_failures += 1;
        mark_lost(st, fx);
      }
    });
  }
}

impl std::fmt::Debug for ConnectionMonitor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectionMonitor")
      .field("status", &self.status())
      .finish_non_exhaustive()
  }
}

fn upgrade(inner: &Weak<Inner>) -> Option<ConnectionMonitor> {
  inner.upgrade().map(|inner| ConnectionMonitor { inner })
}

/// Timer loop. Holds only a weak reference so dropping every monitor handle
/// ends it.
async fn drive(inner: Weak<Inner>, mut commands: mpsc::UnboundedReceiver<Command>, period: Duration) {
  let mut ping = tokio::time::interval_at(Instant::now() + period, period);
  ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

  let retry = tokio::time::sleep(Duration::ZERO);
  tokio::pin!(retry);
  let mut retry_armed = false;

  loop {
    tokio::select! {
      command = commands.recv() => {
        let Some(command) = command else {
          break;
        };
        match command {
          Command::Schedule(delay) => {
            retry.as_mut().reset(Instant::now() + delay);
            retry_armed = true;
          }
          Command::CancelRetry => retry_armed = false,
          Command::Trigger(reason) => {
            let Some(monitor) = upgrade(&inner) else {
              break;
            };
            monitor.trigger(reason).await;
          }
        }
      }
      () = &mut retry, if retry_armed => {
        retry_armed = false;
        let Some(monitor) = upgrade(&inner) else {
          break;
        };
        monitor.attempt_reconnect().await;
      }
      _ = ping.tick() => {
        let Some(monitor) = upgrade(&inner) else {
          break;
        };
        if monitor.should_ping() {
          monitor.probe().await;
        }
      }
    }
  }
  debug!("Connection driver stopped");
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

  #[derive(Default)]
  struct FakeBackend {
    down: AtomicBool,
    unauthenticated: AtomicBool,
    refreshes: AtomicU32,
    probes: Mutex<Vec<Instant>>,
  }

  impl FakeBackend {
    fn down() -> Arc<Self> {
      let backend = Self::default();
      backend.down.store(true, Ordering::SeqCst);
      Arc::new(backend)
    }

    fn probe_count(&self) -> usize {
      self.probes.lock().unwrap().len()
    }
  }

  #[async_trait]
  impl Backend for FakeBackend {
    async fn probe(&self) -> Result<(), SyncError> {
      self.probes.lock().unwrap().push(Instant::now());
      if self.unauthenticated.load(Ordering::SeqCst) {
        return Err(SyncError::Unauthenticated("token expired".into()));
      }
      if self.down.load(Ordering::SeqCst) {
        return Err(SyncError::Transport("connection refused".into()));
      }
      Ok(())
    }

    async fn refresh_credentials(&self) -> Result<(), SyncError> {
      self.refreshes.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
      events.push(event);
    }
    events
  }

  #[tokio::test(start_paused = true)]
  async fn test_probe_failure_loses_and_success_restores() {
    let backend = FakeBackend::down();
    let monitor = ConnectionMonitor::new(backend.clone(), MonitorConfig::default());
    let mut events = monitor.events();

    assert!(!monitor.probe().await);
    let status = monitor.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.consecutive_failures, 1);
    assert!(status.last_probe_at.is_some());

    backend.down.store(false, Ordering::SeqCst);
    assert!(monitor.probe().await);
    let status = monitor.status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.reconnect_attempt, 0);

    assert_eq!(
      drain(&mut events),
      vec![ConnectionEvent::Lost, ConnectionEvent::Restored]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_signal_disconnects_without_probe() {
    let backend = Arc::new(FakeBackend::default());
    let monitor = ConnectionMonitor::new(backend.clone(), MonitorConfig::default());
    let mut events = monitor.events();

    monitor.handle_signal(HostSignal::Offline);

    assert_eq!(monitor.state(), ConnectionState::Disconnected);
    assert_eq!(backend.probe_count(), 0);
    assert_eq!(drain(&mut events), vec![ConnectionEvent::Lost]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_backoff_until_exhausted() {
    let backend = FakeBackend::down();
    let monitor = ConnectionMonitor::new(backend.clone(), MonitorConfig::default());
    let mut events = monitor.events();
    assert!(monitor.start());

    let start = Instant::now();
    monitor.check_now().await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(
      drain(&mut events),
      vec![
        ConnectionEvent::Lost,
        ConnectionEvent::Reconnecting { attempt: 1 },
        ConnectionEvent::RetryScheduled { attempt: 2, delay: Duration::from_millis(2000) },
        ConnectionEvent::Reconnecting { attempt: 2 },
        ConnectionEvent::RetryScheduled { attempt: 3, delay: Duration::from_millis(4000) },
        ConnectionEvent::Reconnecting { attempt: 3 },
        ConnectionEvent::RetryScheduled { attempt: 4, delay: Duration::from_millis(8000) },
        ConnectionEvent::Reconnecting { attempt: 4 },
        ConnectionEvent::RetryScheduled { attempt: 5, delay: Duration::from_millis(16000) },
        ConnectionEvent::Reconnecting { attempt: 5 },
        ConnectionEvent::Exhausted { attempts: 5 },
      ]
    );

    // Initial probe, then attempts 1..=5
    let offsets: Vec<u128> = backend
      .probes
      .lock()
      .unwrap()
      .iter()
      .map(|t| t.duration_since(start).as_millis())
      .collect();
    assert_eq!(offsets, vec![0, 0, 2000, 6000, 14000, 30000]);
    assert_eq!(backend.refreshes.load(Ordering::SeqCst), 5);

    let status = monitor.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(status.exhausted);
    assert_eq!(status.reconnect_attempt, 5);

    // Nothing else happens without an external trigger
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(backend.probe_count(), 6);

    backend.down.store(false, Ordering::SeqCst);
    monitor.handle_signal(HostSignal::Online);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let status = monitor.status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.reconnect_attempt, 0);
    assert!(!status.exhausted);
    assert_eq!(
      drain(&mut events),
      vec![
        ConnectionEvent::Reconnecting { attempt: 1 },
        ConnectionEvent::Restored
      ]
    );
    monitor.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_ping_detects_silent_disconnect() {
    let backend = Arc::new(FakeBackend::default());
    let monitor = ConnectionMonitor::new(backend.clone(), MonitorConfig::default());
    let mut events = monitor.events();
    monitor.start();

    tokio::time::sleep(Duration::from_millis(30_500)).await;
    assert_eq!(backend.probe_count(), 1);
    assert!(drain(&mut events).is_empty());

    backend.down.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;

    let events = drain(&mut events);
    assert_eq!(events[0], ConnectionEvent::Lost);
    assert_eq!(events[1], ConnectionEvent::Reconnecting { attempt: 1 });
    assert_ne!(monitor.state(), ConnectionState::Connected);
    monitor.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_pings_while_hidden_and_probe_on_long_hidden_return() {
    let backend = Arc::new(FakeBackend::default());
    let monitor = ConnectionMonitor::new(backend.clone(), MonitorConfig::default());
    monitor.start();

    monitor.handle_signal(HostSignal::Hidden);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(backend.probe_count(), 0);

    monitor.handle_signal(HostSignal::Visible);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.probe_count(), 1);

    // A short absence does not trigger an immediate probe
    monitor.handle_signal(HostSignal::Hidden);
    tokio::time::sleep(Duration::from_secs(5)).await;
    monitor.handle_signal(HostSignal::Visible);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.probe_count(), 1);
    monitor.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_reports_drive_the_state_machine() {
    let monitor = ConnectionMonitor::new(Arc::new(FakeBackend::default()), MonitorConfig::default());
    let mut events = monitor.events();

    monitor.report_failure(&SyncError::Unknown("bad payload".into()));
    assert!(monitor.is_reachable());

    monitor.report_failure(&SyncError::Timeout(Duration::from_secs(6)));
    assert!(!monitor.is_reachable());
    assert_eq!(monitor.status().consecutive_failures, 1);

    monitor.report_success();
    assert!(monitor.is_reachable());

    monitor.report_failure(&SyncError::Unauthenticated("expired".into()));
    assert!(monitor.is_reachable());

    assert_eq!(
      drain(&mut events),
      vec![
        ConnectionEvent::Lost,
        ConnectionEvent::Restored,
        ConnectionEvent::SessionExpired
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_unauthenticated_probe_bypasses_backoff() {
    let backend = Arc::new(FakeBackend::default());
    backend.unauthenticated.store(true, Ordering::SeqCst);
    let monitor = ConnectionMonitor::new(backend.clone(), MonitorConfig::default());
    let mut events = monitor.events();
    monitor.start();

    monitor.check_now().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(drain(&mut events), vec![ConnectionEvent::SessionExpired]);
    assert_eq!(backend.probe_count(), 1);
    assert_eq!(monitor.status().reconnect_attempt, 0);
    monitor.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_dispose_stops_timers_and_listeners() {
    let backend = Arc::new(FakeBackend::default());
    let monitor = ConnectionMonitor::new(backend.clone(), MonitorConfig::default());
    monitor.start();
    monitor.listen(futures::stream::pending());
    assert_eq!(monitor.subscriptions().len(), 2);

    monitor.dispose();
    assert!(monitor.subscriptions().is_empty());

    monitor.handle_signal(HostSignal::Offline);
    assert_eq!(monitor.state(), ConnectionState::Connected);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(backend.probe_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_listen_forwards_stream_signals() {
    let backend = Arc::new(FakeBackend::default());
    let monitor = ConnectionMonitor::new(backend.clone(), MonitorConfig::default());
    monitor.start();

    let (tx, rx) = mpsc::unbounded_channel();
    let id = monitor.listen(signal_stream(rx));
    tx.send(HostSignal::Offline).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(monitor.state(), ConnectionState::Disconnected);

    assert!(monitor.unlisten(id));
    monitor.dispose();
  }

  fn signal_stream(
    mut rx: mpsc::UnboundedReceiver<HostSignal>,
  ) -> impl Stream<Item = HostSignal> + Send + 'static {
    futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
  }
}
