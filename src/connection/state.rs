//! Connection state, notifications and reconnect backoff policy.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::MonitorConfig;

/// Belief about backend reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
  Connected,
  Disconnected,
  Reconnecting,
}

impl ConnectionState {
  pub fn is_connected(&self) -> bool {
    matches!(self, ConnectionState::Connected)
  }

  pub fn label(&self) -> &'static str {
    match self {
      ConnectionState::Connected => "connected",
      ConnectionState::Disconnected => "disconnected",
      ConnectionState::Reconnecting => "reconnecting",
    }
  }
}

impl std::fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.label())
  }
}

/// Snapshot of everything the monitor knows, published on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
  pub state: ConnectionState,
  pub last_probe_at: Option<Instant>,
  pub consecutive_failures: u32,
  /// Reset to 0 whenever the state becomes `Connected`
  pub reconnect_attempt: u32,
  /// Automatic retries stopped after `max_attempts`; only an external
  /// trigger (online, visibility, manual check) starts them again
  pub exhausted: bool,
}

impl Default for ConnectionStatus {
  fn default() -> Self {
    // Optimistic until the first probe says otherwise
    Self {
      state: ConnectionState::Connected,
      last_probe_at: None,
      consecutive_failures: 0,
      reconnect_attempt: 0,
      exhausted: false,
    }
  }
}

/// Notifications emitted by the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
  /// Backend reachable again after being disconnected
  Restored,
  /// Backend no longer reachable
  Lost,
  /// A reconnect attempt started
  Reconnecting { attempt: u32 },
  /// A reconnect attempt failed; `attempt` will run after `delay`
  RetryScheduled { attempt: u32, delay: Duration },
  /// Automatic retries gave up after `attempts` attempts
  Exhausted { attempts: u32 },
  /// The backend rejected the session; the host should re-authenticate
  SessionExpired,
}

/// Signals delivered by the host environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostSignal {
  Online,
  Offline,
  Visible,
  Hidden,
  /// Explicit "check now" request from the UI
  CheckNow,
}

/// Why an immediate probe/reconnect was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
  Online,
  Visible,
  Manual,
}

/// Exponential reconnect backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
  pub base_delay: Duration,
  pub max_attempts: u32,
}

impl ReconnectPolicy {
  /// Delay before the attempt that follows failed attempt `attempt`
  /// (1-based): `base_delay * 2^(attempt - 1)`.
  pub fn delay_after(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    self.base_delay.saturating_mul(1u32 << exponent)
  }

  pub fn exhausted(&self, attempt: u32) -> bool {
    attempt >= self.max_attempts
  }
}

impl From<&MonitorConfig> for ReconnectPolicy {
  fn from(config: &MonitorConfig) -> Self {
    Self {
      base_delay: config.base_delay(),
      max_attempts: config.max_attempts,
    }
  }
}
