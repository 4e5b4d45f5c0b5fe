//! Cache layer that orchestrates caching strategies with network fetching.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::CacheResult;
use crate::http::Response;

/// Cache layer bound to one named store.
///
/// Reads go straight to storage. Writes that follow a successful network
/// fetch run in the background so they never delay the response.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  store_name: String,
  /// Background writes not yet joined
  writes: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer over `store_name` in the given storage backend.
  pub fn new(storage: Arc<S>, store_name: impl Into<String>) -> Self {
    Self {
      storage,
      store_name: store_name.into(),
      writes: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn store_name(&self) -> &str {
    &self.store_name
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Try the network - on success, store a copy in the background and return it
  /// 2. On network failure, return the stored entry for `key`
  /// 3. Otherwise return the stored entry for `fallback_key`
  /// 4. If neither is stored, the original network error surfaces
  pub async fn network_first<F, Fut>(
    &self,
    key: &str,
    fallback_key: &str,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match fetcher().await {
      Ok(response) => {
        self.store_in_background(key, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        debug!(key, error = %err, "Network failed, falling back to cache");

        if let Some(cached) = self.storage.get(&self.store_name, key)? {
          return Ok(CacheResult::offline(cached.response, cached.cached_at));
        }

        if fallback_key != key {
          if let Some(cached) = self.storage.get(&self.store_name, fallback_key)? {
            debug!(key, fallback_key, "Serving fallback document");
            return Ok(CacheResult::fallback(cached.response, cached.cached_at));
          }
        }

        Err(err.wrap_err(format!("No cached response for {}", key)))
      }
    }
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check the store - if present, return it without touching the network
  /// 2. Otherwise fetch, store a copy in the background and return it
  /// 3. A network failure on a miss is returned as-is
  pub async fn cache_first<F, Fut>(&self, key: &str, fetcher: F) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    if let Some(cached) = self.storage.get(&self.store_name, key)? {
      debug!(key, "Cache hit");
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    debug!(key, "Cache miss");
    let response = fetcher().await?;
    self.store_in_background(key, &response);
    Ok(CacheResult::from_network(response))
  }

  /// Fetch every key and store all responses in one atomic write.
  ///
  /// Fetches run concurrently. Any failure, including a non-2xx or partial
  /// response, aborts the whole batch before anything is written.
  pub async fn add_all<F, Fut>(&self, keys: &[String], fetcher: F) -> Result<()>
  where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    self.storage.open_store(&self.store_name)?;

    let fetches = keys.iter().map(|key| {
      let fetch = fetcher(key.clone());
      async move {
        let response = fetch.await?;
        if !response.is_ok() || response.is_partial() {
          return Err(eyre!("{} returned status {}", key, response.status));
        }
        Ok((key.clone(), response))
      }
    });

    let entries = try_join_all(fetches).await?;
    self.storage.put_all(&self.store_name, &entries)
  }

  /// Delete every store except this layer's own.
  ///
  /// Deletions run concurrently on the blocking pool. Returns the deleted names.
  pub async fn purge_other_stores(&self) -> Result<Vec<String>> {
    let stale: Vec<String> = self
      .storage
      .store_names()?
      .into_iter()
      .filter(|name| *name != self.store_name)
      .collect();

    let deletions = stale.into_iter().map(|name| {
      let storage = Arc::clone(&self.storage);
      tokio::task::spawn_blocking(move || storage.delete_store(&name).map(|_| name))
    });

    try_join_all(deletions)
      .await
      .map_err(|e| eyre!("Store deletion task failed: {}", e))?
      .into_iter()
      .collect()
  }

  /// Write a copy of `response` under `key` without waiting for it.
  ///
  /// Failures are logged and otherwise ignored.
  fn store_in_background(&self, key: &str, response: &Response) {
    if response.is_partial() {
      warn!(key, "Not caching partial response");
      return;
    }

    let storage = Arc::clone(&self.storage);
    let store_name = self.store_name.clone();
    let key = key.to_string();
    let copy = response.clone();

    let mut writes = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
    // Reap finished writes so the set does not grow unbounded
    while writes.try_join_next().is_some() {}
    writes.spawn_blocking(move || match storage.put(&store_name, &key, &copy) {
      Ok(()) => debug!(key, store = store_name, "Stored response"),
      Err(e) => warn!(key, store = store_name, error = %e, "Failed to store response"),
    });
  }

  /// Wait for all background writes started so far.
  pub async fn settle(&self) {
    let mut pending = std::mem::take(&mut *self.writes.lock().unwrap_or_else(PoisonError::into_inner));
    while let Some(joined) = pending.join_next().await {
      if let Err(e) = joined {
        warn!(error = %e, "Background cache write did not complete");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage, SqliteStorage};
  use std::sync::atomic::{AtomicU32, Ordering};

  const STORE: &str = "training-app-v1";
  const ROOT: &str = "http://app.test/";
  const PAGE: &str = "http://app.test/plans";

  fn layer() -> CacheLayer<MemoryStorage> {
    CacheLayer::new(Arc::new(MemoryStorage::new()), STORE)
  }

  fn offline() -> Result<Response> {
    Err(eyre!("connection refused"))
  }

  #[tokio::test]
  async fn test_network_first_success_stores_copy() {
    let cache = layer();

    let result = cache
      .network_first(PAGE, ROOT, || async { Ok(Response::new(200, "plans")) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"plans");

    cache.settle().await;
    let stored = cache.storage().get(STORE, PAGE).unwrap().unwrap();
    assert_eq!(stored.response, result.data);
  }

  #[tokio::test]
  async fn test_network_first_offline_serves_same_key() {
    let cache = layer();
    let storage = cache.storage();
    storage.put(STORE, PAGE, &Response::new(200, "stale plans")).unwrap();
    storage.put(STORE, ROOT, &Response::new(200, "home")).unwrap();

    let result = cache.network_first(PAGE, ROOT, || async { offline() }).await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body, b"stale plans");
    assert!(result.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_network_first_offline_falls_back_to_root() {
    let cache = layer();
    cache.storage().put(STORE, ROOT, &Response::new(200, "home")).unwrap();

    let result = cache.network_first(PAGE, ROOT, || async { offline() }).await.unwrap();
    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(result.data.body, b"home");
  }

  #[tokio::test]
  async fn test_network_first_offline_empty_store_fails() {
    let cache = layer();

    let err = cache
      .network_first(PAGE, ROOT, || async { offline() })
      .await
      .unwrap_err();
    assert!(format!("{:?}", err).contains("connection refused"));
  }

  #[tokio::test]
  async fn test_network_first_ignores_other_stores() {
    let cache = layer();
    cache.storage().put("training-app-v0", PAGE, &Response::new(200, "old")).unwrap();

    assert!(cache.network_first(PAGE, ROOT, || async { offline() }).await.is_err());
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let cache = layer();
    let key = "http://app.test/static/mobile.css";
    cache.storage().put(STORE, key, &Response::new(200, "css")).unwrap();

    let calls = AtomicU32::new(0);
    let counter = &calls;
    let result = cache
      .cache_first(key, || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(200, "fresh css"))
      })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"css");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let cache = layer();
    let key = "http://app.test/static/app.js";

    let result = cache
      .cache_first(key, || async { Ok(Response::new(200, "js")) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);

    cache.settle().await;
    assert!(cache.storage().get(STORE, key).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_cache_first_miss_offline_fails_without_fallback() {
    let cache = layer();
    cache.storage().put(STORE, ROOT, &Response::new(200, "home")).unwrap();

    let result = cache
      .cache_first("http://app.test/static/app.js", || async { offline() })
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_partial_response_is_returned_but_not_stored() {
    let cache = layer();
    let key = "http://app.test/static/video.mp4";

    let result = cache
      .cache_first(key, || async { Ok(Response::new(206, "part")) })
      .await
      .unwrap();
    assert_eq!(result.data.status, 206);

    cache.settle().await;
    assert!(cache.storage().get(STORE, key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_add_all_is_atomic() {
    let cache = layer();
    let keys = vec![ROOT.to_string(), "http://app.test/static/mobile.css".to_string()];

    let result = cache
      .add_all(&keys, |key| async move {
        if key.ends_with(".css") {
          Ok(Response::new(404, "missing"))
        } else {
          Ok(Response::new(200, "home"))
        }
      })
      .await;
    assert!(result.is_err());
    assert!(cache.storage().keys(STORE).unwrap().is_empty());

    cache
      .add_all(&keys, |_| async { Ok(Response::new(200, "ok")) })
      .await
      .unwrap();
    assert_eq!(cache.storage().keys(STORE).unwrap(), keys);
  }

  #[tokio::test]
  async fn test_add_all_rejects_partial_response() {
    let cache = layer();
    let keys = vec!["http://app.test/static/mobile.css".to_string()];

    let err = cache
      .add_all(&keys, |_| async { Ok(Response::new(206, "part")) })
      .await
      .unwrap_err();
    assert!(err.to_string().contains("206"));
    assert!(cache.storage().keys(STORE).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_background_writes_land_in_sqlite() {
    let cache = CacheLayer::new(Arc::new(SqliteStorage::open_in_memory().unwrap()), STORE);

    for path in ["plans", "history", "settings"] {
      let key = format!("http://app.test/{}", path);
      cache
        .network_first(&key, ROOT, || async { Ok(Response::new(200, path)) })
        .await
        .unwrap();
    }

    cache.settle().await;
    assert_eq!(cache.storage().keys(STORE).unwrap().len(), 3);
    let stored = cache.storage().get(STORE, "http://app.test/history").unwrap().unwrap();
    assert_eq!(stored.response.body, b"history");
  }

  #[tokio::test]
  async fn test_purge_other_stores() {
    let cache = layer();
    let storage = cache.storage();
    storage.put("training-app-v0", ROOT, &Response::new(200, "v0")).unwrap();
    storage.put("other", ROOT, &Response::new(200, "x")).unwrap();
    storage.put(STORE, ROOT, &Response::new(200, "v1")).unwrap();

    let mut deleted = cache.purge_other_stores().await.unwrap();
    deleted.sort();
    assert_eq!(deleted, vec!["other".to_string(), "training-app-v0".to_string()]);
    assert_eq!(storage.store_names().unwrap(), vec![STORE.to_string()]);
    assert!(storage.get(STORE, ROOT).unwrap().is_some());
  }
}
