mod agent;
mod cache;
mod config;
mod http;
mod logging;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::agent::{FetchOutcome, Lifecycle, OfflineAgent};
use crate::cache::{CacheSource, CacheStorage, MemoryStorage, SqliteStorage};
use crate::http::{HttpNetwork, Network, Request, Response};

#[derive(Parser, Debug)]
#[command(name = "offline-agent")]
#[command(about = "Offline caching agent: network-first for pages, cache-first for assets")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-agent/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin of the application, e.g. http://127.0.0.1:5001
  #[arg(long, global = true)]
  origin: Option<String>,

  /// Name of the current store
  #[arg(long, global = true)]
  cache_name: Option<String>,

  /// Keep stores in memory for the duration of this command only
  #[arg(long, global = true)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch and store the core assets
  Install,
  /// Delete stores belonging to other versions
  Activate,
  /// Route a request through the agent
  Fetch {
    /// Path (resolved against the origin) or absolute URL
    target: String,

    /// Request method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Accept header sent with the request
    #[arg(short, long, default_value = "*/*")]
    accept: String,

    /// Write the response body to FILE instead of stdout
    #[arg(short, long, value_name = "FILE")]
    out: Option<PathBuf>,
  },
  /// List retained stores and their entries
  Stores,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override from command line
  let config = config.with_origin_override(args.origin);
  let config = if let Some(cache_name) = args.cache_name {
    config::Config {
      cache_name,
      ..config
    }
  } else {
    config
  };

  let _log_guard = logging::init(&config.log)?;

  let agent_config = config.agent()?;
  let network = HttpNetwork::new(&config.network)?;

  if args.ephemeral {
    let agent = OfflineAgent::new(agent_config, Arc::new(MemoryStorage::new()), network);
    run(args.command, &agent).await
  } else {
    let storage = SqliteStorage::open(&config.database_path()?)?;
    let agent = OfflineAgent::new(agent_config, Arc::new(storage), network);
    run(args.command, &agent).await
  }
}

async fn run<S: CacheStorage, N: Network>(command: Command, agent: &OfflineAgent<S, N>) -> Result<()> {
  match command {
    Command::Install => {
      let outcome = agent.on_install().await?;
      println!("installed {} ({} assets)", outcome.store_name, outcome.cached.len());
      for key in &outcome.cached {
        println!("  {}", key);
      }
      if outcome.skip_waiting {
        println!("ready to take control without waiting");
      }
    }
    Command::Activate => {
      let outcome = agent.on_activate().await?;
      if outcome.deleted.is_empty() {
        println!("activated {}, no stale stores", agent.config().store_name);
      } else {
        println!(
          "activated {}, deleted {}",
          agent.config().store_name,
          outcome.deleted.join(", ")
        );
      }
      if outcome.claim_clients {
        println!("controlling all open pages");
      }
    }
    Command::Fetch {
      target,
      method,
      accept,
      out,
    } => {
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

      let result = fetch(agent, &target, method, &accept, out.as_deref()).await;
      // Let background writes land before the process exits
      agent.settle().await;
      result?;
    }
    Command::Stores => {
      let storage = agent.storage();
      for name in storage.store_names()? {
        let marker = if name == agent.config().store_name {
          " (current)"
        } else {
          ""
        };
        let keys = storage.keys(&name)?;
        println!("{}{} - {} entries", name, marker, keys.len());
        for key in keys {
          println!("  {}", key);
        }
      }
    }
  }

  Ok(())
}

async fn fetch<S: CacheStorage, N: Network>(
  agent: &OfflineAgent<S, N>,
  target: &str,
  method: Method,
  accept: &str,
  out: Option<&Path>,
) -> Result<()> {
  let url = agent.config().resolve(target)?;
  let request = Request::new(method, url).with_header("Accept", accept);

  let (source, cached_at, response) = match agent.on_fetch(&request).await? {
    FetchOutcome::Respond(result) => (Some(result.source), result.cached_at, result.data),
    FetchOutcome::PassThrough => (None, None, agent.network().fetch(&request).await?),
  };

  let label = source
    .map(|s| s.to_string())
    .unwrap_or_else(|| "pass-through".to_string());
  let stored = cached_at
    .map(|at| format!(", stored {}", at.format("%Y-%m-%d %H:%M:%S")))
    .unwrap_or_default();
  eprintln!(
    "{:<12} {} {} ({} bytes{})",
    label,
    response.status,
    request.url,
    response.body.len(),
    stored
  );
  if source == Some(CacheSource::Fallback) {
    eprintln!("{:<12} served the root document in place of {}", "", request.url);
  }

  match out {
    Some(path) => {
      let file =
        File::create(path).map_err(|e| eyre!("Failed to create {}: {}", path.display(), e))?;
      write_body(&response, file)
    }
    None => write_body(&response, std::io::stdout().lock()),
  }
}

/// Write a response body to `writer` and flush it.
fn write_body(response: &Response, mut writer: impl Write) -> Result<()> {
  writer
    .write_all(&response.body)
    .map_err(|e| eyre!("Failed to write response body: {}", e))?;
  writer
    .flush()
    .map_err(|e| eyre!("Failed to flush response body: {}", e))
}
