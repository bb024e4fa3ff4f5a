use clap::{Parser, Subcommand};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde::Serialize;
use std::path::PathBuf;

use novelcache::config::Config;
use novelcache::db::{Database, QueueCounts};
use novelcache::sync::UNFINISHED_PRIORITY;
use novelcache::telemetry;
use novelcache::types::PendingEntry;

#[derive(Parser, Debug)]
#[command(name = "novelcache")]
#[command(about = "Maintenance tool for the novel cache store")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./novelcache.yaml or $XDG_CONFIG_HOME/novelcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Database file, overriding the configured store path
  #[arg(long)]
  db: Option<PathBuf>,

  /// Log level or filter directive, overriding RUST_LOG and the config
  #[arg(long)]
  log_level: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show store statistics
  Stats,
  /// Delete chapters not updated for the given number of days
  Cleanup {
    #[arg(long, default_value_t = 30)]
    days: u32,
  },
  /// Compact the database file
  Vacuum,
  /// Print a book and its chapters as JSON
  Export {
    book_id: String,
    /// Leave chapter bodies out
    #[arg(long)]
    no_content: bool,
  },
  /// Show the daily sync queue
  Queue,
  /// Add every unfinished book to the daily sync queue
  EnqueueUnfinished,
  /// Remove completed and failed entries from the daily sync queue
  ClearQueue,
}

#[derive(Serialize)]
struct QueueReport {
  #[serde(flatten)]
  counts: QueueCounts,
  entries: Vec<PendingEntry>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(path) = args.db {
    config.store.path = Some(path);
  }

  let _guard = telemetry::init(&config.logging, args.log_level.as_deref())?;
  match &config.source {
    Some(path) => tracing::debug!(path = %path.display(), "Loaded configuration"),
    None => tracing::debug!("No configuration file found, using defaults"),
  }

  let db = Database::open(&config.store.resolve_path()?, config.store.busy_timeout())?;
  let finished = config.origin.finished_status.clone();

  match args.command {
    Command::Stats => {
      let stats = db.run(|db| db.database_stats()).await?;
      print_json(&stats)?;
    }
    Command::Cleanup { days } => {
      let deleted = db.run(move |db| db.cleanup_stale_chapters(days)).await?;
      println!("Deleted {} chapters older than {} days", deleted, days);
    }
    Command::Vacuum => {
      db.run(|db| db.vacuum()).await?;
      println!("Vacuumed {}", db.path().display());
    }
    Command::Export { book_id, no_content } => {
      let id = book_id.clone();
      let export = db
        .run(move |db| db.export_book(&id, !no_content))
        .await?
        .ok_or_else(|| eyre!("Book {} not found", book_id))?;
      print_json(&export)?;
    }
    Command::Queue => {
      let report = db
        .run(|db| {
          Ok(QueueReport {
            counts: db.queue_counts()?,
            entries: db.pending_entries()?,
          })
        })
        .await?;
      print_json(&report)?;
    }
    Command::EnqueueUnfinished => {
      let added = db
        .run(move |db| {
          let ids = db.unfinished_book_ids(&finished)?;
          db.enqueue_pending(&ids, UNFINISHED_PRIORITY)
        })
        .await?;
      println!("Added {} unfinished books to the sync queue", added);
    }
    Command::ClearQueue => {
      let deleted = db.run(|db| db.clear_finished_entries()).await?;
      println!("Removed {} finished entries from the sync queue", deleted);
    }
  }

  Ok(())
}
