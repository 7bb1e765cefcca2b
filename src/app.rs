use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use resync::config::Config;
use resync::{
  ConnectionEvent, ConnectionStatus, HostSignal, HttpBackend, ResourceOptions, ResourceSnapshot,
  SyncContext, SyncedResource,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::commands::{self, Action, Input};
use crate::event::{Event, EventHandler};

/// How often stale resources are re-checked while the host is visible
const TICK_RATE: Duration = Duration::from_secs(1);

struct Tracked {
  name: String,
  resource: SyncedResource<Value>,
}

/// Console host: feeds typed commands to the sync context and prints what
/// it reports back
pub struct App {
  config: Config,
  ctx: SyncContext,
  resources: Vec<Tracked>,
  visible: bool,
  should_quit: bool,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let backend = Arc::new(HttpBackend::new(&config.backend)?);
    let ctx = SyncContext::init(config.sync.clone(), backend.clone())?;

    let resources = config
      .resources
      .iter()
      .map(|rc| -> Result<Tracked> {
        let backend = Arc::clone(&backend);
        let path = rc.path.clone();
        // Mounted from `run` once watchers are listening
        let options = ResourceOptions::default()
          .with_ttl(config.resource_ttl(rc))
          .lazy();
        let resource = ctx.subscribe(&rc.name, options, move |token| {
          let backend = Arc::clone(&backend);
          let path = path.clone();
          async move { backend.get_json::<Value>(&path, &token).await }
        })?;
        Ok(Tracked {
          name: rc.name.clone(),
          resource,
        })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      config,
      ctx,
      resources,
      visible: true,
      should_quit: false,
    })
  }

  pub async fn run(&mut self) -> Result<()> {
    let mut events = EventHandler::new(TICK_RATE, self.ctx.monitor().events());

    for tracked in &self.resources {
      spawn_watcher(&tracked.name, tracked.resource.clone(), events.sender());
      tracked.resource.mount();
    }
    println!(
      "resync: {} resource(s) against {}. Type 'help' for commands.",
      self.resources.len(),
      self.config.backend.url
    );

    while !self.should_quit {
      match events.next().await {
        Some(event) => self.handle_event(event).await,
        None => break,
      }
    }

    self.ctx.dispose();
    info!("Host stopped");
    Ok(())
  }

  async fn handle_event(&mut self, event: Event) {
    match event {
      Event::Line(line) => {
        if line.trim().is_empty() {
          return;
        }
        match commands::parse(&line) {
          Some(input) => self.execute(input).await,
          None => println!("Unknown command: {}. Type 'help' for commands.", line.trim()),
        }
      }
      Event::Eof | Event::Interrupt => self.should_quit = true,
      Event::Connection(event) => println!("* {}", describe_event(&event)),
      Event::Resource { name, summary } => println!("[{}] {}", name, summary),
      Event::Tick => self.refresh_stale(),
    }
  }

  /// Keep subscribed resources from going stale while someone is looking.
  /// Non-forced, so throttling and the offline check still apply.
  fn refresh_stale(&self) {
    if !self.visible || !self.ctx.monitor().state().is_connected() {
      return;
    }
    for tracked in &self.resources {
      if tracked.resource.mount() {
        debug!(resource = %tracked.name, "Refreshing expired resource");
      }
    }
  }

  async fn execute(&mut self, input: Input) {
    match input.action {
      Action::Signal(HostSignal::CheckNow) => {
        let status = self.ctx.monitor().check_now().await;
        println!("{}", describe_status(&status));
      }
      Action::Signal(signal) => {
        match signal {
          HostSignal::Visible => self.visible = true,
          HostSignal::Hidden => self.visible = false,
          _ => {}
        }
        self.ctx.handle_signal(signal);
      }
      Action::Refresh => self.refresh(input.argument.as_deref()),
      Action::Status => self.print_status(),
      Action::Help => println!("{}", commands::help_text()),
      Action::Quit => self.should_quit = true,
    }
  }

  fn refresh(&self, name: Option<&str>) {
    let targets: Vec<&Tracked> = match name {
      Some(name) => self.resources.iter().filter(|t| t.name == name).collect(),
      None => self.resources.iter().collect(),
    };
    if targets.is_empty() {
      println!("No resource named {}", name.unwrap_or_default());
      return;
    }
    for tracked in targets {
      drop(tracked.resource.refresh_in_background(true));
    }
  }

  fn print_status(&self) {
    println!("{}", describe_status(&self.ctx.monitor().status()));
    for tracked in &self.resources {
      println!(
        "  {:<16} {}",
        tracked.name,
        describe(&tracked.resource.snapshot(), age_of(&tracked.resource))
      );
    }
  }
}

fn spawn_watcher(name: &str, mut resource: SyncedResource<Value>, tx: mpsc::UnboundedSender<Event>) {
  let name = name.to_string();
  tokio::spawn(async move {
    loop {
      let snap = resource.changed().await;
      let summary = describe(&snap, age_of(&resource));
      if tx
        .send(Event::Resource {
          name: name.clone(),
          summary,
        })
        .is_err()
      {
        break;
      }
    }
  });
}

fn age_of(resource: &SyncedResource<Value>) -> Option<String> {
  resource.entry().map(|e| e.age_display())
}

fn describe_event(event: &ConnectionEvent) -> String {
  match event {
    ConnectionEvent::Restored => "connection restored".to_string(),
    ConnectionEvent::Lost => "connection lost".to_string(),
    ConnectionEvent::Reconnecting { attempt } => format!("reconnecting (attempt {})", attempt),
    ConnectionEvent::RetryScheduled { attempt, delay } => {
      format!("attempt {} in {:.1}s", attempt, delay.as_secs_f64())
    }
    ConnectionEvent::Exhausted { attempts } => format!(
      "could not reconnect after {} attempts, type 'check' to retry",
      attempts
    ),
    ConnectionEvent::SessionExpired => {
      "session expired, set RESYNC_API_TOKEN and type 'check'".to_string()
    }
  }
}

fn describe_status(status: &ConnectionStatus) -> String {
  let mut line = format!("connection: {}", status.state);
  if status.consecutive_failures > 0 {
    line.push_str(&format!(", {} failed probe(s)", status.consecutive_failures));
  }
  if status.reconnect_attempt > 0 {
    line.push_str(&format!(", attempt {}", status.reconnect_attempt));
  }
  if status.exhausted {
    line.push_str(", retries exhausted");
  }
  line
}

fn describe(snap: &ResourceSnapshot<Value>, age: Option<String>) -> String {
  let mut parts = Vec::new();
  match &snap.data {
    Some(value) => parts.push(summarize(value)),
    None if snap.loading => parts.push("loading...".to_string()),
    None => parts.push("no data".to_string()),
  }
  if snap.refreshing {
    parts.push("refreshing".to_string());
  }
  if snap.is_stale {
    parts.push("stale".to_string());
  }
  if let Some(age) = age {
    parts.push(age);
  }
  if let Some(error) = &snap.error {
    parts.push(format!("error: {}", error));
  }
  parts.join(", ")
}

fn summarize(value: &Value) -> String {
  match value {
    Value::Array(items) => format!("{} items", items.len()),
    Value::Object(fields) => format!("{} fields", fields.len()),
    other => other.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::Arc;

  fn snapshot(data: Option<Value>) -> ResourceSnapshot<Value> {
    ResourceSnapshot {
      data: data.map(Arc::new),
      loading: false,
      refreshing: false,
      error: None,
      is_stale: false,
      age: None,
    }
  }

  #[test]
  fn test_describe_loading_and_data() {
    let mut snap = snapshot(None);
    snap.loading = true;
    assert_eq!(describe(&snap, None), "loading...");

    let snap = snapshot(Some(json!([1, 2, 3])));
    assert_eq!(describe(&snap, Some("just now".into())), "3 items, just now");
  }

  #[test]
  fn test_describe_stale_with_error() {
    let mut snap = snapshot(Some(json!({"total": 4})));
    snap.is_stale = true;
    snap.error = Some("Request timed out after 6000ms".into());
    assert_eq!(
      describe(&snap, Some("2m ago".into())),
      "1 fields, stale, 2m ago, error: Request timed out after 6000ms"
    );
  }

  #[test]
  fn test_describe_events() {
    assert_eq!(
      describe_event(&ConnectionEvent::RetryScheduled {
        attempt: 3,
        delay: Duration::from_millis(4000)
      }),
      "attempt 3 in 4.0s"
    );
    assert!(describe_event(&ConnectionEvent::Exhausted { attempts: 5 }).contains("after 5 attempts"));
  }

  #[test]
  fn test_describe_status() {
    let status = ConnectionStatus {
      consecutive_failures: 2,
      reconnect_attempt: 1,
      ..ConnectionStatus::default()
    };
    assert_eq!(
      describe_status(&status),
      "connection: connected, 2 failed probe(s), attempt 1"
    );
  }
}
