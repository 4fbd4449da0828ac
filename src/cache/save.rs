//! The durable snapshot of a cache.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Schema version written with every save.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// The single unit of persisted truth for one cache.
///
/// Every field has a default so saves written by older versions still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSave<T> {
  /// Materialized, deduplicated items in display order
  pub items: Vec<T>,
  /// Last completed page of the source that produced `items`
  pub page: Option<u32>,
  /// Best-known remote total
  pub total_size: Option<u32>,
  /// Milliseconds since the epoch of the last commit
  pub timestamp: i64,
  pub schema_version: u32,
}

impl<T> Default for CacheSave<T> {
  fn default() -> Self {
    Self {
      items: Vec::new(),
      page: None,
      total_size: None,
      timestamp: 0,
      schema_version: CURRENT_SCHEMA_VERSION,
    }
  }
}

impl<T> CacheSave<T> {
  /// The save a cache starts from when nothing was ever persisted.
  pub fn empty() -> Self {
    Self::default()
  }

  /// A save stamped with the current time.
  pub fn new(items: Vec<T>, page: Option<u32>, total_size: Option<u32>) -> Self {
    Self {
      items,
      page,
      total_size,
      timestamp: Utc::now().timestamp_millis(),
      schema_version: CURRENT_SCHEMA_VERSION,
    }
  }

  /// Page to fast-forward a freshly created source to, if any.
  pub fn resume_page(&self) -> Option<u32> {
    self.page.filter(|page| *page != 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_missing_fields_default() {
    let save: CacheSave<i32> = serde_json::from_str(r#"{"items":[1,2]}"#).unwrap();
    assert_eq!(save.items, vec![1, 2]);
    assert_eq!(save.page, None);
    assert_eq!(save.total_size, None);
    assert_eq!(save.timestamp, 0);
    assert_eq!(save.schema_version, CURRENT_SCHEMA_VERSION);
  }

  #[test]
  fn test_unknown_fields_ignored() {
    let save: CacheSave<i32> =
      serde_json::from_str(r#"{"items":[],"page":3,"future_field":"x"}"#).unwrap();
    assert_eq!(save.page, Some(3));
  }

  #[test]
  fn test_resume_page_skips_zero() {
    assert_eq!(CacheSave::<i32>::new(vec![], Some(0), None).resume_page(), None);
    assert_eq!(CacheSave::<i32>::new(vec![], Some(3), None).resume_page(), Some(3));
    assert_eq!(CacheSave::<i32>::empty().resume_page(), None);
  }

  #[test]
  fn test_new_is_stamped() {
    let save = CacheSave::new(vec![1], None, None);
    assert!(save.timestamp > 0);
  }
}
