//! Result types shared by the caching strategies.

use chrono::{DateTime, Utc};

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a stored entry served without touching the network.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result served from the root document in place of the requested one.
  pub fn fallback(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live response from the network
  Network,
  /// Stored entry, network never consulted
  Cache,
  /// Network failed, serving the stored entry for the same request
  Offline,
  /// Network failed and nothing stored for the request, serving the root document
  Fallback,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheSource::Network => write!(f, "network"),
      CacheSource::Cache => write!(f, "cache"),
      CacheSource::Offline => write!(f, "offline"),
      CacheSource::Fallback => write!(f, "fallback"),
    }
  }
}
