mod cache;
mod classifier;
mod config;
mod db;
mod diagnostics;
mod event;
mod lifecycle;
mod logging;
mod net;
mod notify;
mod queue;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use url::Url;

use cache::{ResponseSource, SqliteStorage};
use config::Config;
use db::Database;
use event::{Event, EventOutcome, FetchDecision};
use net::{HttpNetwork, Network, Request, RequestMode, Response};
use notify::StdoutNotifier;
use worker::{SubmitOutcome, Worker};

type AppWorker = Worker<SqliteStorage, HttpNetwork>;

#[derive(Parser, Debug)]
#[command(name = "offline-shell")]
#[command(about = "Offline-resilience worker: versioned cache, network fallback and deferred submissions")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-shell/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// SQLite database path (overrides the config file)
  #[arg(long)]
  database: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-populate the static generation for the configured version
  Install,
  /// Delete stale generations and take over open clients
  Activate,
  /// Request a URL through the worker
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Treat the request as a top-level navigation
    #[arg(long)]
    navigate: bool,
    /// Send cross-origin requests in CORS mode instead of no-cors
    #[arg(long)]
    cors: bool,
    /// Extra request header, as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Submit a JSON payload, queueing it if the network is unreachable
  Submit { payload: String },
  /// Flush queued submissions (reconnect signal)
  Sync {
    /// Sync tag (default: the configured one)
    #[arg(long)]
    tag: Option<String>,
  },
  /// Show a push notification
  Push { text: Option<String> },
  /// Show generations, queued submissions and registrations
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override database if specified on command line
  let config = if let Some(database) = args.database {
    Config {
      database: Some(database),
      ..config
    }
  } else {
    config
  };

  let _log_guard = logging::init(args.verbose)?;

  let db_path = match &config.database {
    Some(path) => path.clone(),
    None => Database::default_path(&config.app)?,
  };
  let db = Arc::new(Database::open(&db_path)?);
  let network = HttpNetwork::new(&config)?;
  let worker = Worker::new(
    config,
    Arc::clone(&db),
    SqliteStorage::new(db),
    network,
    Arc::new(StdoutNotifier),
  )?;

  let result = run(&worker, args.command).await;

  // Background cache writes must land before the process exits
  worker.settle().await;

  result
}

async fn run(worker: &AppWorker, command: Command) -> Result<()> {
  match command {
    Command::Install => {
      let outcome = worker.handle(Event::Install).await?;
      if let EventOutcome::Installed(report) = outcome {
        println!("cached {} entries in {}", report.entries, report.generation);
        if report.skip_waiting {
          activate(worker).await?;
        }
      }
    }
    Command::Activate => activate(worker).await?,
    Command::Fetch {
      url,
      method,
      navigate,
      cors,
      headers,
      output,
    } => {
      register(worker).await;
      let mut request = build_request(worker.config(), &url, &method, navigate, cors)?;
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header '{}', expected \"Name: value\"", header))?;
        request = request.with_header(name.trim(), value.trim());
      }
      let response = fetch(worker, request).await?;
      write_body(&response, output)?;
    }
    Command::Submit { payload } => {
      register(worker).await;
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      match worker.submit(payload).await? {
        SubmitOutcome::Delivered(status) => println!("delivered ({})", status),
        SubmitOutcome::Queued(id) => println!(
          "offline, queued as #{} ({} pending)",
          id,
          worker.queue().len()?
        ),
      }
    }
    Command::Sync { tag } => {
      register(worker).await;
      let tag = tag.unwrap_or_else(|| worker.config().sync_tag.clone());
      match worker.handle(Event::Sync { tag }).await? {
        EventOutcome::Synced(report) => println!(
          "delivered {}, retained {}, dropped {}, deferred {}",
          report.delivered.len(),
          report.retained.len(),
          report.dropped.len(),
          report.deferred
        ),
        EventOutcome::SyncIgnored { tag } => println!("ignored sync tag '{}'", tag),
        _ => {}
      }
    }
    Command::Push { text } => {
      worker
        .handle(Event::Push {
          payload: text.map(String::into_bytes),
        })
        .await?;
    }
    Command::Status => print_status(worker)?,
  }

  Ok(())
}

/// Registration failures are logged, never acted on.
async fn register(worker: &AppWorker) {
  if let Err(e) = worker.register().await {
    error!(error = %format!("{:#}", e), "worker registration failed");
    eprintln!("warning: worker registration failed: {:#}", e);
  }
}

async fn activate(worker: &AppWorker) -> Result<()> {
  if let EventOutcome::Activated(report) = worker.handle(Event::Activate).await? {
    for name in &report.deleted {
      println!("deleted {}", name);
    }
    for name in &report.failed {
      eprintln!("warning: could not delete {}", name);
    }
    for version in &report.superseded {
      println!("superseded v{}", version);
    }
    println!("active: {}", report.kept.join(", "));
  }
  Ok(())
}

fn build_request(
  config: &Config,
  url: &str,
  method: &str,
  navigate: bool,
  cors: bool,
) -> Result<Request> {
  let url = match Url::parse(url) {
    Ok(url) => url,
    Err(_) => config.resolve(url)?,
  };
  let method = Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

  let mode = if navigate {
    RequestMode::Navigate
  } else if url.origin() == config.origin_url()?.origin() {
    RequestMode::SameOrigin
  } else if cors {
    RequestMode::Cors
  } else {
    RequestMode::NoCors
  };

  let mut request = Request::get(url).with_mode(mode);
  request.method = method;
  Ok(request)
}

async fn fetch(worker: &AppWorker, request: Request) -> Result<Response> {
  let url = request.url.clone();
  let outcome = match worker.handle(Event::Fetch(request.clone())).await? {
    EventOutcome::Fetch(decision) => decision,
    other => return Err(eyre!("Unexpected outcome for fetch: {:?}", other)),
  };

  match outcome {
    FetchDecision::Respond(served) => {
      let source = match served.source {
        ResponseSource::Cache => "cache",
        ResponseSource::Network => "network",
        ResponseSource::OfflineFallback => "offline fallback",
      };
      eprintln!("{} {} ({})", served.response.status, url, source);
      Ok(served.response)
    }
    FetchDecision::PassThrough(verdict) => {
      let response = worker.network().fetch(&request).await?;
      eprintln!("{} {} (not intercepted: {:?})", response.status, url, verdict);
      Ok(response)
    }
  }
}

fn write_body(response: &Response, output: Option<PathBuf>) -> Result<()> {
  match output {
    Some(path) => std::fs::write(&path, &response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e)),
    None => std::io::stdout()
      .lock()
      .write_all(&response.body)
      .map_err(|e| eyre!("Failed to write body: {}", e)),
  }
}

fn print_status(worker: &AppWorker) -> Result<()> {
  let status = worker.status()?;

  println!(
    "current: {} / {}",
    status.static_generation, status.dynamic_generation
  );
  for (name, count) in &status.generations {
    let marker = if *name == status.static_generation || *name == status.dynamic_generation {
      ""
    } else {
      " (stale)"
    };
    println!("  {:<32} {:>6} entries{}", name, count, marker);
  }

  println!("pending submissions: {}", status.pending_submissions);
  if status.background_tasks > 0 {
    println!("background writes in flight: {}", status.background_tasks);
  }
  for (version, state) in &status.registrations {
    let controller = if status.controller == Some(*version) {
      " [controller]"
    } else {
      ""
    };
    println!("  v{:<4} {}{}", version, state, controller);
  }

  for diagnostic in worker.diagnostics() {
    eprintln!(
      "{} {}: {}",
      diagnostic.at.format("%H:%M:%S"),
      diagnostic.context,
      diagnostic.message
    );
  }

  Ok(())
}
