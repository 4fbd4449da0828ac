//! Serde types matching the paged collection endpoint.

use serde::Deserialize;
use serde_json::Value;

use crate::paging::Paged;

/// One page as served by a collection endpoint.
///
/// `hasMore` may be omitted, in which case a non-empty page is assumed to be
/// followed by another one.
#[derive(Debug, Deserialize)]
pub struct ApiPage {
  #[serde(default)]
  pub items: Vec<Value>,
  #[serde(rename = "hasMore")]
  pub has_more: Option<bool>,
  pub total: Option<u32>,
}

impl ApiPage {
  /// `None` for an empty page, which ends the collection.
  pub fn into_paged(self) -> Option<Paged<Value>> {
    if self.items.is_empty() {
      return None;
    }
    let has_more = self.has_more.unwrap_or(true);
    let paged = Paged::new(self.items, has_more);
    Some(match self.total {
      Some(total) => paged.with_total(total),
      None => paged,
    })
  }
}
