//! Merge strategies combining freshly fetched items with a previous snapshot.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// How a freshly fetched list combines with the cached one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshOrderPolicy {
  /// Keep existing items where they are, append unseen items at the end.
  ///
  /// Used for every page appended by `request_more`, and the safe choice for
  /// background refreshes of a list the user is looking at.
  #[default]
  KeepOrderAppendLast,
  /// Take the fetched order as is.
  Replace,
}

/// Removes later items whose key was already seen. Order is preserved.
pub fn distinct_by_key<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
  K: Hash + Eq,
  F: Fn(&T) -> K,
{
  let mut seen = HashSet::with_capacity(items.len());
  items.into_iter().filter(|item| seen.insert(key(item))).collect()
}

/// Merges `fetched` into `existing` according to `policy`.
pub fn merge<T, K, F>(policy: RefreshOrderPolicy, existing: &[T], fetched: Vec<T>, key: F) -> Vec<T>
where
  T: Clone,
  K: Hash + Eq,
  F: Fn(&T) -> K,
{
  match policy {
    RefreshOrderPolicy::Replace => distinct_by_key(fetched, key),
    RefreshOrderPolicy::KeepOrderAppendLast => keep_order_append_last(existing, fetched, key),
  }
}

/// Existing items keep their position; a fetched item with the same key
/// replaces the value in place. Unseen fetched items go last, in fetched order.
///
/// Items that no longer appear in `fetched` are kept.
fn keep_order_append_last<T, K, F>(existing: &[T], fetched: Vec<T>, key: F) -> Vec<T>
where
  T: Clone,
  K: Hash + Eq,
  F: Fn(&T) -> K,
{
  let existing = distinct_by_key(existing.to_vec(), &key);
  let positions: HashMap<K, usize> = existing
    .iter()
    .enumerate()
    .map(|(index, item)| (key(item), index))
    .collect();

  let mut merged = existing;
  let mut appended = Vec::new();
  let mut seen_appended = HashSet::new();

  for item in fetched {
    let k = key(&item);
    match positions.get(&k) {
      Some(&index) => merged[index] = item,
      None => {
        if seen_appended.insert(k) {
          appended.push(item);
        }
      }
    }
  }

  merged.extend(appended);
  merged
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, Clone, PartialEq)]
  struct Subject {
    id: u32,
    title: &'static str,
  }

  fn subject(id: u32, title: &'static str) -> Subject {
    Subject { id, title }
  }

  #[test]
  fn test_distinct_keeps_first() {
    let items = vec![1, 2, 1, 3, 2];
    assert_eq!(distinct_by_key(items, |v| *v), vec![1, 2, 3]);
  }

  #[test]
  fn test_replace_takes_fetched_order() {
    let merged = merge(
      RefreshOrderPolicy::Replace,
      &['a', 'b', 'c'],
      vec!['c', 'd'],
      |v| *v,
    );
    assert_eq!(merged, vec!['c', 'd']);
  }

  #[test]
  fn test_replace_deduplicates() {
    let merged = merge(
      RefreshOrderPolicy::Replace,
      &['a'],
      vec!['c', 'd', 'c'],
      |v| *v,
    );
    assert_eq!(merged, vec!['c', 'd']);
  }

  #[test]
  fn test_keep_order_appends_unseen() {
    let merged = merge(
      RefreshOrderPolicy::KeepOrderAppendLast,
      &['a', 'b', 'c'],
      vec!['c', 'd', 'a'],
      |v| *v,
    );
    assert_eq!(merged, vec!['a', 'b', 'c', 'd']);
  }

  #[test]
  fn test_keep_order_new_items_follow_fetched_order() {
    let merged = merge(
      RefreshOrderPolicy::KeepOrderAppendLast,
      &['a'],
      vec!['e', 'a', 'd', 'e'],
      |v| *v,
    );
    assert_eq!(merged, vec!['a', 'e', 'd']);
  }

  #[test]
  fn test_keep_order_updates_in_place() {
    let existing = vec![subject(1, "old"), subject(2, "two")];
    let fetched = vec![subject(3, "three"), subject(1, "new")];
    let merged = merge(
      RefreshOrderPolicy::KeepOrderAppendLast,
      &existing,
      fetched,
      |s| s.id,
    );
    assert_eq!(
      merged,
      vec![subject(1, "new"), subject(2, "two"), subject(3, "three")]
    );
  }

  #[test]
  fn test_keep_order_with_empty_existing() {
    let merged = merge(
      RefreshOrderPolicy::KeepOrderAppendLast,
      &[],
      vec![3, 1, 3],
      |v| *v,
    );
    assert_eq!(merged, vec![3, 1]);
  }
}
