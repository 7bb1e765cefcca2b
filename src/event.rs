use std::time::Duration;

use resync::ConnectionEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

/// Host application events
#[derive(Debug)]
pub enum Event {
  /// One line typed on stdin
  Line(String),
  /// stdin closed
  Eof,
  /// Ctrl-C
  Interrupt,
  /// Connection notification from the monitor
  Connection(ConnectionEvent),
  /// A resource's data, error or loading state changed
  Resource { name: String, summary: String },
  /// Periodic tick
  Tick,
}

/// Merges stdin, Ctrl-C, connection notifications and a tick timer into one
/// event stream
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new(tick_rate: Duration, mut connection: broadcast::Receiver<ConnectionEvent>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let stdin_tx = tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      loop {
        let event = match lines.next_line().await {
          Ok(Some(line)) => Event::Line(line),
          Ok(None) | Err(_) => Event::Eof,
        };
        let eof = matches!(event, Event::Eof);
        if stdin_tx.send(event).is_err() || eof {
          break;
        }
      }
    });

    let signal_tx = tx.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = signal_tx.send(Event::Interrupt);
      }
    });

    let conn_tx = tx.clone();
    tokio::spawn(async move {
      loop {
        match connection.recv().await {
          Ok(event) => {
            if conn_tx.send(Event::Connection(event)).is_err() {
              break;
            }
          }
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });

    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for tasks that report back into the loop
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
