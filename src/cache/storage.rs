//! Cache storage trait, an in-memory implementation and the SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::http::Response;

/// A single stored response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// The stored response
  pub response: Response,
  /// When the response was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores, each mapping request keys to
/// responses. Writes to an existing key overwrite it.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the named store if it does not exist yet.
  fn open_store(&self, store: &str) -> Result<()>;

  /// Get the entry stored under `key` in `store`.
  fn get(&self, store: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Store a response, creating the store if needed.
  fn put(&self, store: &str, key: &str, response: &Response) -> Result<()>;

  /// Store several responses at once. Either all are written or none are.
  fn put_all(&self, store: &str, entries: &[(String, Response)]) -> Result<()>;

  /// Delete a whole store. Returns false if it did not exist.
  fn delete_store(&self, store: &str) -> Result<bool>;

  /// Names of all retained stores.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Keys held by a store, sorted.
  fn keys(&self, store: &str) -> Result<Vec<String>>;
}

/// Storage held entirely in memory. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
  stores: RwLock<BTreeMap<String, BTreeMap<String, CachedEntry>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStorage for MemoryStorage {
  fn open_store(&self, store: &str) -> Result<()> {
    let mut stores = self
      .stores
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    stores.entry(store.to_string()).or_default();
    Ok(())
  }

  fn get(&self, store: &str, key: &str) -> Result<Option<CachedEntry>> {
    let stores = self
      .stores
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(stores.get(store).and_then(|entries| entries.get(key)).cloned())
  }

  fn put(&self, store: &str, key: &str, response: &Response) -> Result<()> {
    let mut stores = self
      .stores
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    stores.entry(store.to_string()).or_default().insert(
      key.to_string(),
      CachedEntry {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn put_all(&self, store: &str, entries: &[(String, Response)]) -> Result<()> {
    // A single write lock makes the batch atomic for readers
    let mut stores = self
      .stores
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let now = Utc::now();
    let target = stores.entry(store.to_string()).or_default();
    for (key, response) in entries {
      target.insert(
        key.clone(),
        CachedEntry {
          response: response.clone(),
          cached_at: now,
        },
      );
    }
    Ok(())
  }

  fn delete_store(&self, store: &str) -> Result<bool> {
    let mut stores = self
      .stores
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(stores.remove(store).is_some())
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let stores = self
      .stores
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(stores.keys().cloned().collect())
  }

  fn keys(&self, store: &str) -> Result<Vec<String>> {
    let stores = self
      .stores
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      stores
        .get(store)
        .map(|entries| entries.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-agent").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per named store
CREATE TABLE IF NOT EXISTS stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by a digest of the request URL
CREATE TABLE IF NOT EXISTS entries (
    store_name TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_name, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_store ON entries(store_name);
"#;

const INSERT_STORE: &str = "INSERT OR IGNORE INTO stores (name) VALUES (?)";

const UPSERT_ENTRY: &str =
  "INSERT OR REPLACE INTO entries (store_name, entry_key, url, status, headers, body, cached_at)
   VALUES (?, ?, ?, ?, ?, ?, datetime('now'))";

impl CacheStorage for SqliteStorage {
  fn open_store(&self, store: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(INSERT_STORE, params![store])
      .map_err(|e| eyre!("Failed to create store {}: {}", store, e))?;

    Ok(())
  }

  fn get(&self, store: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE store_name = ? AND entry_key = ?",
        params![store, entry_key(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntry {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, store: &str, key: &str, response: &Response) -> Result<()> {
    self.put_all(store, &[(key.to_string(), response.clone())])
  }

  fn put_all(&self, store: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(INSERT_STORE, params![store])
      .map_err(|e| eyre!("Failed to create store {}: {}", store, e))?;

    for (key, response) in entries {
      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers for {}: {}", key, e))?;

      tx.execute(
        UPSERT_ENTRY,
        params![
          store,
          entry_key(key),
          key,
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete_store(&self, store: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE store_name = ?", params![store])
      .map_err(|e| eyre!("Failed to delete entries of store {}: {}", store, e))?;
    let removed = tx
      .execute("DELETE FROM stores WHERE name = ?", params![store])
      .map_err(|e| eyre!("Failed to delete store {}: {}", store, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn keys(&self, store: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT url FROM entries WHERE store_name = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![store], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", store, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry url: {}", e))?;

    Ok(keys)
  }
}

/// SHA256 of the request key, for stable fixed-length primary keys.
fn entry_key(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
