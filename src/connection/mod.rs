//! Backend reachability: state machine, reconnect backoff and host signals.

mod monitor;
mod state;
mod subscription;

pub use monitor::ConnectionMonitor;
pub use state::{
  ConnectionEvent, ConnectionState, ConnectionStatus, HostSignal, ReconnectPolicy, TriggerReason,
};
pub use subscription::{Subscription, SubscriptionId, SubscriptionList};
