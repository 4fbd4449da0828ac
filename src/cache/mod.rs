//! Lazily populated, durably cached view of a remote paginated collection.
//!
//! This module provides the cache engine:
//! - Fetches pages only when asked to, and merges them by identity key
//! - Persists every commit before readers can observe it
//! - Resumes from the last persisted page after a restart
//! - Reports fetch failures as observable state while keeping cached data

mod layer;
mod merge;
mod mutator;
mod save;
mod storage;
mod traits;

pub use layer::{CacheSnapshot, LazyDataCache};
pub use merge::{distinct_by_key, merge, RefreshOrderPolicy};
pub use mutator::{transaction, Mutator};
pub use save::{CacheSave, CURRENT_SCHEMA_VERSION};
pub use storage::{
  MemoryStore, PersistentStore, SqliteDatabase, SqliteStore, StoreKey, Transform,
};
pub use traits::{ApiFailure, CacheState, ErrorCause, FetchResult};
