mod app;
mod commands;
mod event;

use std::path::{Path, PathBuf};

use clap::Parser;
use color_eyre::Result;
use resync::config::Config;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "resync")]
#[command(about = "Keep backend resources in sync over an unreliable network")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./resync.yaml, then $XDG_CONFIG_HOME/resync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Backend base URL, overrides `backend.url`
  #[arg(short, long)]
  url: Option<String>,
}

/// Log to a daily file when `log_dir` is set, to stderr otherwise.
/// RUST_LOG controls the filter (default `resync=info`).
fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("resync=info"));

  match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)?;
      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "resync.log"));
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
      Ok(None)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(url) = args.url {
    config.backend.url = url;
  }

  // Flushes buffered log lines on drop
  let _guard = init_tracing(config.log_dir.as_deref())?;

  let mut app = app::App::new(config)?;
  app.run().await?;

  Ok(())
}
