use bytes::Bytes;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use dreamsw::config::Config;
use dreamsw::db::Database;
use dreamsw::engine::{Engine, EngineAction, EngineEvent};
use dreamsw::http::{CacheMode, Method, Request};
use dreamsw::network::{HttpNetwork, Network};
use dreamsw::queue::NewMutation;

#[derive(Parser, Debug)]
#[command(name = "dreamsw")]
#[command(about = "Offline response cache and mutation replay engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/dreamsw/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also write logs to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Seed the static generation from the configured URL list
  Install,
  /// Purge stale generations and start intercepting
  Activate,
  /// Run a request through the engine
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: Method,
    /// Header as "name: value"; may repeat
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
    /// Treat as a page load
    #[arg(long)]
    navigate: bool,
    /// Answer from the cache only
    #[arg(long)]
    only_if_cached: bool,
  },
  /// Replay queued mutations
  Sync {
    /// Sync tag (default: first configured tag)
    #[arg(short, long)]
    tag: Option<String>,
    /// Fire the periodic sync tag instead
    #[arg(long)]
    periodic: bool,
  },
  /// Show cache generations, queue counts and last sync
  Status,
  /// Inspect or edit the mutation queue
  Queue {
    #[command(subcommand)]
    command: QueueCommand,
  },
  /// Delete every cache generation
  Clear,
  /// Render a push payload as a notification
  Push {
    /// JSON payload, e.g. '{"title":"Hi","url":"/inbox"}'
    data: Option<String>,
  },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  List,
  /// Queue a mutation for the next sync
  Add {
    url: String,
    #[arg(short = 'X', long, default_value = "POST")]
    method: Method,
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Drop every queued mutation
  Purge,
}

#[derive(Serialize)]
struct StatusReport {
  phase: String,
  cache: dreamsw::cache::CacheStatus,
  queue: dreamsw::queue::QueueCounts,
  last_sync: Option<chrono::DateTime<chrono::Utc>>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let json =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", json);
  Ok(())
}

fn parse_header(raw: &str) -> Result<(String, String)> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| eyre!("Invalid header '{}', expected 'name: value'", raw))?;
  Ok((name.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = dreamsw::logging::init(args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let db = match &config.database {
    Some(path) => Database::open(path)?,
    None => Database::open_default()?,
  };
  let db = Arc::new(db);
  let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(&config)?);
  let engine = Engine::new(config, Arc::clone(&db), Arc::clone(&network))?;

  match args.command {
    Command::Install => {
      if let EngineAction::Installed(report) = engine.handle(EngineEvent::Install).await {
        print_json(&report)?;
      }
    }
    Command::Activate => {
      if let EngineAction::Activated { purged } = engine.handle(EngineEvent::Activate).await {
        print_json(&purged)?;
      }
    }
    Command::Fetch {
      url,
      method,
      headers,
      data,
      navigate,
      only_if_cached,
    } => {
      let mut request = Request::new(method, engine.config().resolve(&url)?);
      if navigate {
        request = Request {
          method,
          ..Request::navigate(request.url)
        };
      }
      for raw in &headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(&name, value);
      }
      if let Some(data) = data {
        request = request.with_body(data);
      }
      if only_if_cached {
        request = request.with_cache_mode(CacheMode::OnlyIfCached);
      }

      match engine.handle(EngineEvent::Fetch(request.clone())).await {
        EngineAction::Respond(result) => {
          eprintln!("{} ({:?})", result.data.status, result.source);
          for (name, value) in &result.data.headers {
            eprintln!("{}: {}", name, value);
          }
          println!("{}", String::from_utf8_lossy(&result.data.body));
        }
        _ => {
          eprintln!("not intercepted, fetching directly");
          let response = network
            .fetch(request)
            .await
            .map_err(|e| eyre!("Fetch failed: {}", e))?;
          eprintln!("{}", response.status);
          println!("{}", String::from_utf8_lossy(&response.body));
        }
      }
    }
    Command::Sync { tag, periodic } => {
      let sync = &engine.config().sync;
      let event = if periodic {
        EngineEvent::PeriodicSync {
          tag: tag.unwrap_or_else(|| sync.periodic_tag.clone()),
        }
      } else {
        let tag = tag
          .or_else(|| sync.tags.first().cloned())
          .ok_or_else(|| eyre!("No sync tag configured"))?;
        EngineEvent::Sync { tag }
      };
      match engine.handle(event).await {
        EngineAction::Synced(report) => print_json(&report)?,
        _ => eprintln!("sync tag not handled"),
      }
    }
    Command::Status => {
      let report = StatusReport {
        phase: engine.lifecycle().await.phase.to_string(),
        cache: engine.cache().status()?,
        queue: engine.queue().count_by_status()?,
        last_sync: db.last_sync()?,
      };
      print_json(&report)?;
    }
    Command::Queue { command } => match command {
      QueueCommand::List => print_json(&engine.queue().list()?)?,
      QueueCommand::Add { url, method, data } => {
        let queued = engine.queue().enqueue(NewMutation {
          url: engine.config().resolve(&url)?,
          method,
          headers: Default::default(),
          body: data.map(Bytes::from),
        })?;
        print_json(&queued)?;
      }
      QueueCommand::Purge => {
        let purged = engine.queue().purge()?;
        println!("purged {} mutation(s)", purged);
      }
    },
    Command::Clear => {
      let cleared = engine.cache().clear()?;
      print_json(&cleared)?;
    }
    Command::Push { data } => {
      let event = EngineEvent::Push(data.map(Bytes::from));
      if let EngineAction::ShowNotification(notification) = engine.handle(event).await {
        print_json(&notification)?;
      }
    }
  }

  engine.tasks().wait_idle().await;
  Ok(())
}
