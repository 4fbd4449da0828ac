//! Persistent store trait plus in-memory and SQLite implementations.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::save::{CacheSave, CURRENT_SCHEMA_VERSION};

/// A pure function from the current save to the next one.
pub type Transform<'a, T> = Box<dyn FnOnce(&CacheSave<T>) -> CacheSave<T> + Send + 'a>;

/// Observable, transactionally updatable holder of a cache's last durable save.
pub trait PersistentStore<T>: Send + Sync {
  /// Receiver of the current save. It changes only after a successful write.
  fn data(&self) -> watch::Receiver<Arc<CacheSave<T>>>;

  /// Applies `transform` to the current save and persists the result.
  ///
  /// Each call is atomic: if the returned future is dropped or fails, the
  /// stored save is either the old one or the new one, never a mix.
  fn update_data<'a>(&'a self, transform: Transform<'a, T>)
    -> BoxFuture<'a, Result<Arc<CacheSave<T>>>>;
}

/// Store that keeps the save in memory only. Used when persistence is not configured.
pub struct MemoryStore<T> {
  data: watch::Sender<Arc<CacheSave<T>>>,
  lock: tokio::sync::Mutex<()>,
}

impl<T> MemoryStore<T> {
  pub fn new(initial: CacheSave<T>) -> Self {
    let (data, _) = watch::channel(Arc::new(initial));
    Self {
      data,
      lock: tokio::sync::Mutex::new(()),
    }
  }
}

impl<T> Default for MemoryStore<T> {
  fn default() -> Self {
    Self::new(CacheSave::empty())
  }
}

impl<T: Send + Sync + 'static> PersistentStore<T> for MemoryStore<T> {
  fn data(&self) -> watch::Receiver<Arc<CacheSave<T>>> {
    self.data.subscribe()
  }

  fn update_data<'a>(
    &'a self,
    transform: Transform<'a, T>,
  ) -> BoxFuture<'a, Result<Arc<CacheSave<T>>>> {
    Box::pin(async move {
      let _guard = self.lock.lock().await;
      let current = self.data.borrow().clone();
      let next = Arc::new(transform(&current));
      self.data.send_replace(Arc::clone(&next));
      Ok(next)
    })
  }
}

/// Identity of a persisted cache.
pub trait StoreKey {
  /// Stable, fixed-length row key.
  fn cache_hash(&self) -> String;

  /// Human readable description stored next to the row.
  fn description(&self) -> String;
}

impl StoreKey for str {
  fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    self.to_string()
  }
}

impl StoreKey for String {
  fn cache_hash(&self) -> String {
    self.as_str().cache_hash()
  }

  fn description(&self) -> String {
    self.clone()
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One serialized save per cache
CREATE TABLE IF NOT EXISTS cache_saves (
    cache_key TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    data BLOB NOT NULL,
    schema_version INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite database holding the saves of any number of caches.
#[derive(Clone)]
pub struct SqliteDatabase {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
  /// Open the database at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private database that lives as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("ldc").join("cache.db"))
  }

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

  /// Store for the cache identified by `key`, loaded with its last save.
  pub fn store<T, K>(&self, key: &K) -> Result<SqliteStore<T>>
  where
    T: Serialize + DeserializeOwned,
    K: StoreKey + ?Sized,
  {
    let cache_key = key.cache_hash();
    let initial = self.load::<T>(&cache_key)?;
    let (data, _) = watch::channel(Arc::new(initial));

    Ok(SqliteStore {
      conn: Arc::clone(&self.conn),
      cache_key,
      description: key.description(),
      data,
      write_lock: tokio::sync::Mutex::new(()),
      _marker: PhantomData,
    })
  }

  /// Descriptions and update times of every persisted cache.
  pub fn list(&self) -> Result<Vec<(String, String)>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT description, updated_at FROM cache_saves ORDER BY description")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<(String, String)>>>()
      .map_err(|e| eyre!("Failed to read cache row: {}", e))?;

    Ok(rows)
  }

  fn load<T: DeserializeOwned>(&self, cache_key: &str) -> Result<CacheSave<T>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, u32)> = conn
      .query_row(
        "SELECT data, schema_version FROM cache_saves WHERE cache_key = ?",
        params![cache_key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache save: {}", e))?;

    let Some((data, version)) = row else {
      return Ok(CacheSave::empty());
    };

    if version > CURRENT_SCHEMA_VERSION {
      warn!(
        cache_key,
        version, "Cache save written by a newer version, starting empty"
      );
      return Ok(CacheSave::empty());
    }

    match serde_json::from_slice(&data) {
      Ok(save) => Ok(save),
      Err(e) => {
        warn!(cache_key, error = %e, "Unreadable cache save, starting empty");
        Ok(CacheSave::empty())
      }
    }
  }
}

/// Store backed by one row of a [`SqliteDatabase`].
pub struct SqliteStore<T> {
  conn: Arc<Mutex<Connection>>,
  cache_key: String,
  description: String,
  data: watch::Sender<Arc<CacheSave<T>>>,
  /// Serializes transforms of this row
  write_lock: tokio::sync::Mutex<()>,
  _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize> SqliteStore<T> {
  fn write(&self, save: &CacheSave<T>) -> Result<()> {
    let data =
      serde_json::to_vec(save).map_err(|e| eyre!("Failed to serialize cache save: {}", e))?;

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_saves (cache_key, description, data, schema_version, updated_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![self.cache_key, self.description, data, save.schema_version],
      )
      .map_err(|e| eyre!("Failed to store cache save: {}", e))?;

    Ok(())
  }
}

impl<T> PersistentStore<T> for SqliteStore<T>
where
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
  fn data(&self) -> watch::Receiver<Arc<CacheSave<T>>> {
    self.data.subscribe()
  }

  fn update_data<'a>(
    &'a self,
    transform: Transform<'a, T>,
  ) -> BoxFuture<'a, Result<Arc<CacheSave<T>>>> {
    Box::pin(async move {
      let _guard = self.write_lock.lock().await;
      // No await from here on: the row and the channel change together or not at all.
      let current = self.data.borrow().clone();
      let next = transform(&current);
      self.write(&next)?;
      debug!(
        cache = %self.description,
        items = next.items.len(),
        "Persisted cache save"
      );
      let next = Arc::new(next);
      self.data.send_replace(Arc::clone(&next));
      Ok(next)
    })
  }
}
