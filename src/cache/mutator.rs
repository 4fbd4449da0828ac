//! Direct edits of cached items, for one cache or several at once.
//!
//! Edits go through a [`Mutator`], which only exists while the owning cache's
//! lock is held. The edited items are committed with
//! [`RefreshOrderPolicy::Replace`](super::RefreshOrderPolicy::Replace)
//! semantics once the action returns.

use color_eyre::{eyre::eyre, Result};
use std::hash::Hash;

use super::layer::LazyDataCache;

/// Write access to the items of one cache, scoped to its lock.
pub struct Mutator<'a, T> {
  items: &'a mut Vec<T>,
}

impl<'a, T> Mutator<'a, T> {
  fn new(items: &'a mut Vec<T>) -> Self {
    Self { items }
  }

  /// Replace the items with `f(items)`. This is the only way to edit them.
  pub fn update(&mut self, f: impl FnOnce(Vec<T>) -> Vec<T>) {
    let items = std::mem::take(self.items);
    *self.items = f(items);
  }
}

impl<T, K> LazyDataCache<T, K>
where
  T: Clone + Send + Sync + 'static,
  K: Hash + Eq + 'static,
{
  /// Edit the cached items under the cache lock without touching the network.
  ///
  /// Do not call `mutate` or [`transaction`] on the same cache from `action`.
  pub async fn mutate<R>(&self, action: impl FnOnce(&mut Mutator<'_, T>) -> R) -> Result<R> {
    let session = self.lock_session().await;
    let mut items = self.cached_items();
    let result = action(&mut Mutator::new(&mut items));
    self.commit_mutation(&session, items).await?;
    Ok(result)
  }
}

/// Edit several caches atomically, e.g. to move an item from one to another.
///
/// Locks are taken in ascending cache id order regardless of the order of
/// `caches`, so concurrent transactions over the same caches cannot deadlock.
/// `action` receives one mutator per cache, in the order given. Listing a
/// cache twice is an error.
pub async fn transaction<T, K, R>(
  caches: &[&LazyDataCache<T, K>],
  action: impl FnOnce(&mut [Mutator<'_, T>]) -> R,
) -> Result<R>
where
  T: Clone + Send + Sync + 'static,
  K: Hash + Eq + 'static,
{
  let mut order: Vec<usize> = (0..caches.len()).collect();
  order.sort_by_key(|&index| caches[index].id());
  if order
    .windows(2)
    .any(|pair| caches[pair[0]].id() == caches[pair[1]].id())
  {
    return Err(eyre!("A cache was listed twice in one transaction"));
  }

  let mut guards = Vec::with_capacity(caches.len());
  for &index in &order {
    guards.push((index, caches[index].lock_session().await));
  }

  let mut staged: Vec<Vec<T>> = caches.iter().map(|cache| cache.cached_items()).collect();
  let result = {
    let mut mutators: Vec<Mutator<'_, T>> = staged.iter_mut().map(Mutator::new).collect();
    action(&mut mutators)
  };

  for (index, session) in &guards {
    let items = std::mem::take(&mut staged[*index]);
    caches[*index].commit_mutation(session, items).await?;
  }

  // Release in reverse acquisition order
  while let Some(guard) = guards.pop() {
    drop(guard);
  }

  Ok(result)
}
