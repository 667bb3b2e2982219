use std::path::PathBuf;
use std::time::Duration;

use bizsync::config::Config;
use bizsync::remote::types::{OutboundMessage, Resource};
use bizsync::request::ExecuteOptions;
use bizsync::{BusinessClient, MutationOutcome};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bizsync")]
#[command(about = "Cached, offline-tolerant client for the business backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./bizsync.yaml, then $XDG_CONFIG_HOME/bizsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(short, long)]
  verbose: bool,

  /// Print request statistics when done
  #[arg(long)]
  stats: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List rows of a table
  List {
    resource: Resource,
    /// Only rows for this client
    #[arg(long)]
    client: Option<String>,
    /// Appointments starting on or after this day
    #[arg(long)]
    from: Option<NaiveDate>,
  },
  /// Create a row from a JSON object
  Create { resource: Resource, data: String },
  /// Patch a row with a JSON object
  Update {
    resource: Resource,
    id: String,
    data: String,
  },
  Delete { resource: Resource, id: String },
  /// Revenue totals for an inclusive date range
  Revenue { from: NaiveDate, to: NaiveDate },
  /// Inspect or replay writes made while offline
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Send a chat message through the messaging provider
  Message { to: String, body: String },
  /// Open a payment checkout session
  Checkout {
    price_id: String,
    #[arg(long)]
    email: Option<String>,
  },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  List,
  Replay {
    /// Keep replaying on the configured interval until interrupted
    #[arg(long)]
    watch: bool,
  },
  /// Discard every queued write
  Clear {
    #[arg(long)]
    yes: bool,
  },
  /// Discard one queued write
  Abandon { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let client = BusinessClient::new(&config)?;
  info!(command = ?args.command, "starting");

  let result = run(&client, &config, args.command).await;

  if args.stats {
    eprintln!("{}", client.coordinator().stats());
  }
  client.shutdown().await;
  result
}

async fn run(client: &BusinessClient, config: &Config, command: Command) -> Result<()> {
  match command {
    Command::List {
      resource,
      client: client_id,
      from,
    } => {
      let options = ExecuteOptions::new();
      let client_id = client_id.as_deref();
      match resource {
        Resource::Clients => print_rows(client.list_clients(options).await?),
        Resource::Appointments => {
          print_rows(client.list_appointments(client_id, from, options).await?)
        }
        Resource::Payments => print_rows(client.list_payments(client_id, options).await?),
        Resource::Inventory => print_rows(client.list_inventory(options).await?),
      }
    }
    Command::Create { resource, data } => {
      print_outcome(client.create(resource, parse_json(&data)?).await?)
    }
    Command::Update { resource, id, data } => {
      print_outcome(client.update(resource, &id, parse_json(&data)?).await?)
    }
    Command::Delete { resource, id } => print_outcome(client.delete(resource, &id).await?),
    Command::Revenue { from, to } => {
      let summary = client
        .revenue_summary(from, to, ExecuteOptions::new())
        .await?;
      println!("{} to {}", summary.from, summary.to);
      println!(
        "  total:        {}",
        bizsync::remote::types::format_cents(summary.total_cents)
      );
      println!("  payments:     {}", summary.payment_count);
      println!("  appointments: {}", summary.appointment_count);
    }
    Command::Queue { action } => run_queue(client, config, action).await?,
    Command::Message { to, body } => {
      let response = client.send_message(&OutboundMessage { to, body }).await?;
      println!("{}", serde_json::to_string_pretty(&response)?);
    }
    Command::Checkout { price_id, email } => {
      let session = client.checkout(&price_id, email).await?;
      println!("{}", session.url);
    }
  }
  Ok(())
}

async fn run_queue(client: &BusinessClient, config: &Config, action: QueueAction) -> Result<()> {
  let coordinator = client.coordinator();
  match action {
    QueueAction::List => {
      let pending = coordinator.queue().pending();
      if pending.is_empty() {
        println!("No queued writes.");
      }
      for mutation in pending {
        println!("{mutation}");
      }
    }
    QueueAction::Replay { watch: false } => match coordinator.replay().await {
      Some(report) => println!(
        "applied {}, failed {}, held {}, abandoned {}, dropped {}, {} still queued",
        report.applied,
        report.failed,
        report.held,
        report.abandoned,
        report.dropped,
        report.remaining
      ),
      None => println!("A replay is already running."),
    },
    QueueAction::Replay { watch: true } => {
      let secs = config.queue.replay_interval_secs.unwrap_or(30);
      coordinator.spawn_replay_loop(Duration::from_secs(secs));
      println!("Replaying every {secs}s, press Ctrl-C to stop.");
      tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    }
    QueueAction::Clear { yes } => {
      if !yes {
        return Err(eyre!(
          "Refusing to discard {} queued writes without --yes",
          coordinator.queue().len()
        ));
      }
      println!("Discarded {} queued writes.", coordinator.queue().clear_queue());
    }
    QueueAction::Abandon { id } => {
      if !coordinator.queue().abandon(&id) {
        return Err(eyre!("No queued write with id {}", id));
      }
      println!("Abandoned {id}.");
    }
  }
  Ok(())
}

fn init_logging(verbose: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("BIZSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  if verbose {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    return Ok(None);
  }

  let log_dir = Config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;
  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "bizsync.log"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
  Ok(Some(guard))
}

fn parse_json(data: &str) -> Result<Value> {
  let value: Value = serde_json::from_str(data).map_err(|e| eyre!("Invalid JSON: {}", e))?;
  if !value.is_object() {
    return Err(eyre!("Expected a JSON object, got {}", value));
  }
  Ok(value)
}

fn print_rows<T: std::fmt::Display>(rows: Vec<T>) {
  if rows.is_empty() {
    println!("No rows.");
  }
  for row in rows {
    println!("{row}");
  }
}

fn print_outcome(outcome: MutationOutcome) {
  match outcome {
    MutationOutcome::Applied(row) => {
      println!("{}", serde_json::to_string_pretty(&row).unwrap_or_else(|_| row.to_string()))
    }
    MutationOutcome::Queued { id, reason } => {
      println!("Backend unreachable ({reason}). Queued as {id}, it will be replayed later.")
    }
    MutationOutcome::Deferred { id } => {
      println!("Earlier writes to this record are still queued. Queued as {id} behind them.")
    }
  }
}
