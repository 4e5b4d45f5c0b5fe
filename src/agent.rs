//! The offline cache agent and its lifecycle hooks.
//!
//! A host drives the agent through [`Lifecycle`]: `on_install` once per
//! version, `on_activate` after a successful install, then `on_fetch` for
//! every request a page makes.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::http::{cache_key, Network, Request, Response};

/// Everything the agent needs to know about the application it serves.
#[derive(Debug, Clone)]
pub struct AgentConfig {
  /// Origin the agent belongs to. Requests to any other origin pass through.
  pub origin: Url,
  /// Name of the current store
  pub store_name: String,
  /// Paths stored at install time, relative to `origin`
  pub core_assets: Vec<String>,
}

impl AgentConfig {
  pub fn new(origin: Url, store_name: String, core_assets: Vec<String>) -> Result<Self> {
    if !matches!(origin.scheme(), "http" | "https") || !origin.has_host() {
      return Err(eyre!("Origin must be an http(s) URL with a host: {}", origin));
    }
    if store_name.trim().is_empty() {
      return Err(eyre!("Store name must not be empty"));
    }

    let config = Self {
      origin,
      store_name,
      core_assets,
    };
    // Every core asset must resolve inside our own origin
    config.core_asset_keys()?;

    Ok(config)
  }

  /// Resolve a path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }

  /// Store key of the root document, the last-resort offline page.
  pub fn root_key(&self) -> Result<String> {
    Ok(cache_key(&self.resolve("/")?))
  }

  /// Store keys of the core assets, in list order.
  pub fn core_asset_keys(&self) -> Result<Vec<String>> {
    self
      .core_assets
      .iter()
      .map(|path| {
        let url = self.resolve(path)?;
        if url.origin() != self.origin.origin() {
          return Err(eyre!("Core asset {} is not on origin {}", url, self.origin));
        }
        Ok(cache_key(&url))
      })
      .collect()
  }
}

/// Caching strategy for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Documents: prefer fresh content, fall back to the store
  NetworkFirst,
  /// Everything else: prefer the store, fetch on a miss
  CacheFirst,
}

impl Strategy {
  pub fn for_request(request: &Request) -> Self {
    if request.accepts_html() {
      Strategy::NetworkFirst
    } else {
      Strategy::CacheFirst
    }
  }
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
  pub store_name: String,
  /// Keys written to the store
  pub cached: Vec<String>,
  /// Take control without waiting for older instances to finish
  pub skip_waiting: bool,
}

/// Result of a successful activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
  /// Stores removed because they belong to another version
  pub deleted: Vec<String>,
  /// Start controlling already-open pages immediately
  pub claim_clients: bool,
}

/// What the host should do with an intercepted request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// Not ours: let the request continue to the network untouched
  PassThrough,
  /// Answer the page with this response
  Respond(CacheResult<Response>),
}

/// Lifecycle hooks a host invokes on the agent.
pub trait Lifecycle {
  fn on_install(&self) -> impl Future<Output = Result<InstallOutcome>> + Send;

  fn on_activate(&self) -> impl Future<Output = Result<ActivateOutcome>> + Send;

  fn on_fetch(&self, request: &Request) -> impl Future<Output = Result<FetchOutcome>> + Send;
}

/// Offline cache agent over a storage backend and a network.
pub struct OfflineAgent<S: CacheStorage, N: Network> {
  config: AgentConfig,
  cache: CacheLayer<S>,
  network: N,
}

impl<S: CacheStorage, N: Network> OfflineAgent<S, N> {
  pub fn new(config: AgentConfig, storage: Arc<S>, network: N) -> Self {
    let cache = CacheLayer::new(storage, config.store_name.clone());
    Self {
      config,
      cache,
      network,
    }
  }

  pub fn config(&self) -> &AgentConfig {
    &self.config
  }

  pub fn storage(&self) -> &Arc<S> {
    self.cache.storage()
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  /// Wait for background store writes to finish.
  pub async fn settle(&self) {
    self.cache.settle().await
  }
}

impl<S: CacheStorage, N: Network> Lifecycle for OfflineAgent<S, N> {
  async fn on_install(&self) -> Result<InstallOutcome> {
    let store_name = self.cache.store_name();
    let keys = self.config.core_asset_keys()?;
    info!(store = store_name, assets = keys.len(), "Installing");

    let network = &self.network;
    self
      .cache
      .add_all(&keys, |key| async move {
        let url = Url::parse(&key).map_err(|e| eyre!("Invalid asset URL {}: {}", key, e))?;
        network.fetch(&Request::get(url)).await
      })
      .await
      .map_err(|e| e.wrap_err(format!("Install of {} failed", store_name)))?;

    info!(store = store_name, "Installed");
    Ok(InstallOutcome {
      store_name: store_name.to_string(),
      cached: keys,
      skip_waiting: true,
    })
  }

  async fn on_activate(&self) -> Result<ActivateOutcome> {
    let deleted = self.cache.purge_other_stores().await?;
    info!(
      store = self.cache.store_name(),
      deleted = ?deleted,
      "Activated"
    );

    Ok(ActivateOutcome {
      deleted,
      claim_clients: true,
    })
  }

  async fn on_fetch(&self, request: &Request) -> Result<FetchOutcome> {
    if !request.is_get() {
      debug!(method = %request.method, url = %request.url, "Passing through non-GET request");
      return Ok(FetchOutcome::PassThrough);
    }
    if !request.is_same_origin(&self.config.origin) {
      debug!(url = %request.url, "Passing through cross-origin request");
      return Ok(FetchOutcome::PassThrough);
    }

    let key = request.cache_key();
    let strategy = Strategy::for_request(request);
    debug!(key, ?strategy, "Intercepting");

    let result = match strategy {
      Strategy::NetworkFirst => {
        let root = self.config.root_key()?;
        self
          .cache
          .network_first(&key, &root, || self.network.fetch(request))
          .await?
      }
      Strategy::CacheFirst => {
        self
          .cache
          .cache_first(&key, || self.network.fetch(request))
          .await?
      }
    };

    debug!(key, source = %result.source, status = result.data.status, "Responding");
    Ok(FetchOutcome::Respond(result))
  }
}
