//! Wiring of configured collections into persisted caches.

use color_eyre::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::client::CollectionClient;
use crate::cache::{FetchResult, LazyDataCache, SqliteDatabase, StoreKey};
use crate::config::{CollectionConfig, Config};

/// Cache over a remote JSON collection, keyed by [`item_key`].
pub type RemoteCache = LazyDataCache<Value, String>;

/// Identity of a configured collection in the database.
#[derive(Clone, Debug)]
pub struct CollectionKey {
  name: String,
  url: String,
  description: Option<String>,
}

impl CollectionKey {
  pub fn new(name: &str, config: &CollectionConfig) -> Self {
    Self {
      name: name.to_string(),
      url: config.url.clone(),
      description: config.description.clone(),
    }
  }
}

impl StoreKey for CollectionKey {
  fn cache_hash(&self) -> String {
    let input = format!("collection:{}:{}", self.name, normalize_url(&self.url));

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    match &self.description {
      Some(description) => format!("{}: {}", self.name, description),
      None => format!("{} ({})", self.name, self.url),
    }
  }
}

/// Normalize a url for consistent hashing.
fn normalize_url(url: &str) -> &str {
  url.trim().trim_end_matches('/')
}

/// Identity of a JSON item: the `key_field` value if present, else the item itself.
pub fn item_key(key_field: Option<&str>, item: &Value) -> String {
  match key_field.and_then(|field| item.get(field)) {
    Some(Value::String(s)) => s.clone(),
    Some(other) => other.to_string(),
    None => item.to_string(),
  }
}

/// Open the persisted cache of collection `name`.
pub fn open_collection(
  db: &SqliteDatabase,
  name: &str,
  config: &CollectionConfig,
) -> Result<RemoteCache> {
  let client = CollectionClient::new(config, Config::get_api_token())?;
  let store = db.store::<Value, _>(&CollectionKey::new(name, config))?;
  let key_field = config.key_field.clone();

  let cache = LazyDataCache::new(
    move || {
      let source = client.paged_source();
      async move { FetchResult::Success(source) }
    },
    move |item: &Value| item_key(key_field.as_deref(), item),
  )
  .with_store(store)
  .with_debug_name(name);

  Ok(cache)
}
