use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use futures::StreamExt;
use lazy_data_cache::cache::{CacheSnapshot, RefreshOrderPolicy, SqliteDatabase};
use lazy_data_cache::config::Config;
use lazy_data_cache::logging;
use lazy_data_cache::remote::{open_collection, RemoteCache};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ldc")]
#[command(about = "Lazily fetch and cache paginated JSON collections")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ldc/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also write logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load the next page
  More { collection: String },
  /// Load every remaining page
  All { collection: String },
  /// Reload from the first page
  Refresh {
    collection: String,
    /// Take the fetched order instead of keeping the cached one
    #[arg(long)]
    replace: bool,
  },
  /// Forget cached items and the page cursor
  Invalidate { collection: String },
  /// Print cached items without fetching
  Show { collection: String },
  /// List persisted caches
  Caches,
}

/// Summary line printed after every command.
#[derive(Serialize)]
struct Summary<'a> {
  collection: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  loaded: Option<bool>,
  items: usize,
  total_size: Option<u32>,
  state: String,
  is_completed: bool,
  last_updated: Option<DateTime<Utc>>,
}

impl<'a> Summary<'a> {
  fn new(collection: &'a str, snapshot: &CacheSnapshot<Value>, loaded: Option<bool>) -> Self {
    let last_updated = match snapshot.last_updated {
      0 => None,
      millis => DateTime::from_timestamp_millis(millis),
    };
    Self {
      collection,
      loaded,
      items: snapshot.items.len(),
      total_size: snapshot.total_size,
      state: snapshot.state.to_string(),
      is_completed: snapshot.is_completed,
      last_updated,
    }
  }
}

fn print_line(value: &impl Serialize) -> Result<()> {
  println!("{}", serde_json::to_string(value)?);
  Ok(())
}

/// Drive `all_data` until the collection is exhausted or a fetch fails.
async fn load_all(cache: Arc<RemoteCache>) {
  let mut all = cache.all_data();
  let mut completed = Box::pin(cache.is_completed());
  let mut state = Box::pin(cache.state());

  loop {
    tokio::select! {
      Some(items) = all.next() => {
        info!(cache = %cache.debug_name(), items = items.len(), "Loaded items");
      }
      Some(done) = completed.next() => {
        if done {
          break;
        }
      }
      Some(current) = state.next() => {
        if !current.is_normal() {
          break;
        }
      }
      else => break,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log, args.verbose)?;

  let db = SqliteDatabase::open(config.database.as_deref())?;

  let name = match &args.command {
    Command::Caches => {
      for (description, updated_at) in db.list()? {
        print_line(&serde_json::json!({
          "description": description,
          "updated_at": updated_at,
        }))?;
      }
      return Ok(());
    }
    Command::More { collection }
    | Command::All { collection }
    | Command::Refresh { collection, .. }
    | Command::Invalidate { collection }
    | Command::Show { collection } => collection.as_str(),
  };

  let cache = Arc::new(open_collection(&db, name, config.collection(name)?)?);

  let loaded = match &args.command {
    Command::More { .. } => Some(cache.request_more().await?),
    Command::All { .. } => {
      load_all(Arc::clone(&cache)).await;
      None
    }
    Command::Refresh { replace, .. } => {
      let policy = if *replace {
        RefreshOrderPolicy::Replace
      } else {
        RefreshOrderPolicy::KeepOrderAppendLast
      };
      Some(cache.refresh(policy).await?)
    }
    Command::Invalidate { .. } => {
      cache.invalidate().await?;
      None
    }
    Command::Show { .. } | Command::Caches => None,
  };

  let snapshot = cache.snapshot();
  if matches!(args.command, Command::Show { .. }) {
    for item in &snapshot.items {
      print_line(item)?;
    }
  }
  print_line(&Summary::new(name, &snapshot, loaded))?;

  Ok(())
}
