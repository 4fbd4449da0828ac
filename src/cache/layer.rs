//! Cache layer that orchestrates paged fetching, merging and persistence.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use super::merge::{merge, RefreshOrderPolicy};
use super::save::CacheSave;
use super::storage::{MemoryStore, PersistentStore};
use super::traits::{CacheState, FetchResult};
use crate::paging::PagedSource;

type SourceFactory<T> =
  Box<dyn Fn() -> BoxFuture<'static, FetchResult<Arc<dyn PagedSource<T>>>> + Send + Sync>;

type KeyFn<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Live fetch session. Never persisted.
enum SourceInfo<T> {
  Success(Arc<dyn PagedSource<T>>),
  Failed(CacheState),
}

/// State guarded by the cache lock.
pub(crate) struct Session<T> {
  info: Option<SourceInfo<T>>,
  first_load: bool,
}

impl<T> Session<T> {
  fn source(&self) -> Option<&Arc<dyn PagedSource<T>>> {
    match &self.info {
      Some(SourceInfo::Success(source)) => Some(source),
      _ => None,
    }
  }

  fn state(&self) -> CacheState {
    match &self.info {
      Some(SourceInfo::Failed(state)) => state.clone(),
      _ => CacheState::Normal,
    }
  }
}

/// What readers see of the last commit. Items and total travel together.
struct Committed<T> {
  save: Arc<CacheSave<T>>,
  remote_total: Option<u32>,
}

impl<T> Clone for Committed<T> {
  fn clone(&self) -> Self {
    Self {
      save: Arc::clone(&self.save),
      remote_total: self.remote_total,
    }
  }
}

impl<T> Committed<T> {
  fn total_size(&self) -> Option<u32> {
    self.remote_total.or(self.save.total_size)
  }
}

#[derive(Debug, Clone, Default)]
struct SessionStatus {
  state: CacheState,
  finished: bool,
  in_flight: bool,
  /// Bumped whenever the session is reset by `invalidate` or `refresh`
  epoch: u64,
}

impl SessionStatus {
  fn is_completed(&self) -> bool {
    self.finished && !self.in_flight
  }
}

/// Point-in-time view of a cache.
#[derive(Debug, Clone)]
pub struct CacheSnapshot<T> {
  pub items: Vec<T>,
  pub total_size: Option<u32>,
  pub state: CacheState,
  pub is_completed: bool,
  pub last_updated: i64,
}

/// A remote paginated collection, fetched lazily and cached durably.
///
/// Pages are only requested through [`request_more`](Self::request_more),
/// [`refresh`](Self::refresh) and [`all_data`](Self::all_data). Every mutation
/// runs under one lock, and readers only see data after the store has
/// persisted it.
pub struct LazyDataCache<T, K> {
  id: u64,
  debug_name: String,
  create_source: SourceFactory<T>,
  key: KeyFn<T, K>,
  store: Arc<dyn PersistentStore<T>>,
  session: Mutex<Session<T>>,
  committed: watch::Sender<Committed<T>>,
  status: watch::Sender<SessionStatus>,
}

impl<T> LazyDataCache<T, T>
where
  T: Clone + Hash + Eq + Send + Sync + 'static,
{
  /// Cache whose items are their own identity.
  pub fn by_value<F, Fut, S>(create_source: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult<S>> + Send + 'static,
    S: PagedSource<T> + 'static,
  {
    Self::new(create_source, T::clone)
  }
}

impl<T, K> LazyDataCache<T, K>
where
  T: Clone + Send + Sync + 'static,
  K: Hash + Eq + 'static,
{
  /// Create a cache backed by an in-memory store.
  ///
  /// `create_source` is called whenever a new fetch session starts. `key`
  /// projects the identity used to deduplicate items.
  pub fn new<F, Fut, S, KF>(create_source: F, key: KF) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult<S>> + Send + 'static,
    S: PagedSource<T> + 'static,
    KF: Fn(&T) -> K + Send + Sync + 'static,
  {
    let store: Arc<dyn PersistentStore<T>> = Arc::new(MemoryStore::default());
    let (committed, _) = watch::channel(Self::initial_commit(store.as_ref()));
    let (status, _) = watch::channel(SessionStatus::default());
    let id = NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed);

    Self {
      id,
      debug_name: format!("cache-{}", id),
      create_source: Box::new(move || {
        let fut = create_source();
        async move { fut.await.map(|s| Arc::new(s) as Arc<dyn PagedSource<T>>) }.boxed()
      }),
      key: Arc::new(key),
      store,
      session: Mutex::new(Session {
        info: None,
        first_load: true,
      }),
      committed,
      status,
    }
  }

  /// Use `store` for persistence instead of memory.
  pub fn with_store(mut self, store: impl PersistentStore<T> + 'static) -> Self {
    self.store = Arc::new(store);
    self
      .committed
      .send_replace(Self::initial_commit(self.store.as_ref()));
    self
  }

  /// Name used in log output.
  pub fn with_debug_name(mut self, name: impl Into<String>) -> Self {
    self.debug_name = name.into();
    self
  }

  fn initial_commit(store: &dyn PersistentStore<T>) -> Committed<T> {
    let save = store.data().borrow().clone();
    Committed {
      save,
      remote_total: None,
    }
  }

  /// Stable identity, used to order locks across caches.
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn debug_name(&self) -> &str {
    &self.debug_name
  }

  // ==========================================================================
  // Read surface
  // ==========================================================================

  /// Cached items, re-emitted after every commit. Never triggers a fetch.
  pub fn cached_data(&self) -> impl Stream<Item = Vec<T>> + Send + 'static {
    WatchStream::new(self.committed.subscribe()).map(|c| c.save.items.clone())
  }

  /// Remote total if the current session knows it, else the persisted one.
  pub fn total_size(&self) -> impl Stream<Item = Option<u32>> + Send + 'static {
    WatchStream::new(self.committed.subscribe()).map(|c| c.total_size())
  }

  /// Commit time in milliseconds since the epoch.
  pub fn last_updated(&self) -> impl Stream<Item = i64> + Send + 'static {
    WatchStream::new(self.committed.subscribe()).map(|c| c.save.timestamp)
  }

  pub fn state(&self) -> impl Stream<Item = CacheState> + Send + 'static {
    WatchStream::new(self.status.subscribe()).map(|s| s.state)
  }

  /// True once the source is exhausted and no fetch is running.
  pub fn is_completed(&self) -> impl Stream<Item = bool> + Send + 'static {
    WatchStream::new(self.status.subscribe()).map(|s| s.is_completed())
  }

  /// Items of the last commit.
  pub fn cached_items(&self) -> Vec<T> {
    self.committed.borrow().save.items.clone()
  }

  pub fn snapshot(&self) -> CacheSnapshot<T> {
    let committed = self.committed.borrow().clone();
    let status = self.status.borrow().clone();
    CacheSnapshot {
      items: committed.save.items.clone(),
      total_size: committed.total_size(),
      state: status.state.clone(),
      is_completed: status.is_completed(),
      last_updated: committed.save.timestamp,
    }
  }

  /// Emits the cache, then loads page after page until the source is exhausted,
  /// emitting the accumulated items after each one.
  ///
  /// Never ends. After an `invalidate` or `refresh` it loads again from the
  /// new session. A failed page stops loading until the session is reset or
  /// the failure is cleared by a successful `request_more` elsewhere.
  pub fn all_data(self: &Arc<Self>) -> BoxStream<'static, Vec<T>> {
    let cache = Arc::clone(self);
    let driver = async move {
      let mut status = cache.status.subscribe();
      loop {
        let epoch = status.borrow_and_update().epoch;
        loop {
          match cache.request_more().await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) => {
              warn!(cache = %cache.debug_name, error = %e, "Failed to load more data");
              break;
            }
          }
        }

        let failed = !status.borrow_and_update().state.is_normal();

        // Wait for a session reset or a recovery before loading again
        loop {
          if status.changed().await.is_err() {
            return;
          }
          let resume = {
            let current = status.borrow_and_update();
            current.epoch != epoch || (failed && current.state.is_normal())
          };
          if resume {
            break;
          }
        }
      }
    };

    let driver = stream::once(driver).filter_map(|()| async { None::<Vec<T>> });
    stream::select(self.cached_data(), driver).boxed()
  }

  // ==========================================================================
  // Mutations
  // ==========================================================================

  /// Load the next page and append it to the cache.
  ///
  /// Returns `false` when the source is exhausted or the fetch failed; the
  /// failure is reported through [`state`](Self::state). `Err` is returned
  /// only if the store could not persist the page.
  ///
  /// Dropping the returned future after the page arrived but before it was
  /// committed rewinds the source, so the same page is fetched next time.
  pub async fn request_more(&self) -> Result<bool> {
    let mut session = self.session.lock().await;

    if session.first_load {
      session.first_load = false;
      let save = self.store.data().borrow().clone();
      info!(
        cache = %self.debug_name,
        page = ?save.page,
        total_size = ?save.total_size,
        items = save.items.len(),
        "Initialize cache with save"
      );
    }

    let existing = session.source().cloned();
    let source = match existing {
      Some(source) if source.is_finished() => return Ok(false),
      Some(source) => source,
      None => match self.open_source(&mut session).await {
        Some(source) => source,
        None => return Ok(false),
      },
    };

    let in_flight = InFlight::start(&self.status);
    let fetched = fetch_page(source.as_ref()).await;

    match fetched {
      FetchResult::Success(None) => {
        drop(in_flight);
        self.publish_session(&session);
        Ok(false)
      }
      FetchResult::Success(Some(items)) => {
        let mut rewind = RewindOnDrop::arm(source.as_ref());
        self
          .commit(
            Some(source.as_ref()),
            RefreshOrderPolicy::KeepOrderAppendLast,
            move |_| items,
          )
          .await?;
        rewind.disarm();
        drop(in_flight);
        self.publish_session(&session);
        Ok(true)
      }
      FetchResult::ApiError(reason) => {
        warn!(cache = %self.debug_name, %reason, "Failed to fetch page");
        session.info = Some(SourceInfo::Failed(CacheState::ApiError(reason)));
        drop(in_flight);
        self.publish_session(&session);
        Ok(false)
      }
      FetchResult::UnknownError(cause) => {
        warn!(cache = %self.debug_name, error = %cause, "Failed to fetch page");
        session.info = Some(SourceInfo::Failed(CacheState::UnknownError(cause)));
        drop(in_flight);
        self.publish_session(&session);
        Ok(false)
      }
    }
  }

  /// Start a new session, fast-forwarded to the persisted page.
  ///
  /// A creation failure is recorded in the session and `None` returned.
  async fn open_source(&self, session: &mut Session<T>) -> Option<Arc<dyn PagedSource<T>>> {
    match catch_panic((self.create_source)()).await {
      FetchResult::Success(source) => {
        let resume_page = self.store.data().borrow().resume_page();
        if let Some(page) = resume_page {
          debug!(cache = %self.debug_name, page, "Resuming source from persisted page");
          source.skip_to_page(page);
        }
        session.info = Some(SourceInfo::Success(Arc::clone(&source)));
        self.publish_session(session);
        Some(source)
      }
      failure => {
        let state = failure.into_result().err().unwrap_or_default();
        warn!(cache = %self.debug_name, %state, "Failed to create source");
        session.info = Some(SourceInfo::Failed(state));
        self.publish_session(session);
        None
      }
    }
  }

  /// Reload from the first page with a brand-new source.
  ///
  /// The cache is only replaced if the first page was fetched. On failure the
  /// previous items and session stay as they were, the failure is published
  /// through [`state`](Self::state) and `false` is returned. The next
  /// successful `request_more` clears it.
  pub async fn refresh(&self, order_policy: RefreshOrderPolicy) -> Result<bool> {
    let mut session = self.session.lock().await;
    session.first_load = false;

    let in_flight = InFlight::start(&self.status);

    let source = match catch_panic((self.create_source)()).await.into_result() {
      Ok(source) => source,
      Err(state) => {
        warn!(cache = %self.debug_name, %state, "Refresh failed to create source");
        self.status.send_modify(|s| s.state = state);
        return Ok(false);
      }
    };

    let items = match fetch_page(source.as_ref()).await.into_result() {
      Ok(items) => items.unwrap_or_default(),
      Err(state) => {
        warn!(cache = %self.debug_name, %state, "Refresh failed to fetch first page");
        self.status.send_modify(|s| s.state = state);
        return Ok(false);
      }
    };

    self
      .commit(Some(source.as_ref()), order_policy, move |_| items)
      .await?;

    session.info = Some(SourceInfo::Success(source));
    drop(in_flight);
    self.status.send_modify(|s| s.epoch += 1);
    self.publish_session(&session);
    info!(cache = %self.debug_name, policy = ?order_policy, "Refreshed cache");
    Ok(true)
  }

  /// Drop the session and reset the persisted save to empty. No network access.
  pub async fn invalidate(&self) -> Result<()> {
    let mut session = self.session.lock().await;
    session.info = None;
    session.first_load = false;

    let saved = self
      .store
      .update_data(Box::new(|_| CacheSave::new(Vec::new(), None, None)))
      .await?;
    self.committed.send_replace(Committed {
      save: saved,
      remote_total: None,
    });

    self.status.send_modify(|s| s.epoch += 1);
    self.publish_session(&session);
    debug!(cache = %self.debug_name, "Invalidated cache");
    Ok(())
  }

  // ==========================================================================
  // Internals shared with the mutator
  // ==========================================================================

  pub(crate) async fn lock_session(&self) -> MutexGuard<'_, Session<T>> {
    self.session.lock().await
  }

  /// Commit items edited through a mutator. Caller holds the lock.
  pub(crate) async fn commit_mutation(&self, session: &Session<T>, items: Vec<T>) -> Result<()> {
    let source = session.source().map(|s| s.as_ref());
    self
      .commit(source, RefreshOrderPolicy::Replace, move |_| items)
      .await
  }

  /// Merge `block`'s output into the save, persist it, then publish it.
  ///
  /// Must be called with the lock held.
  async fn commit<F>(
    &self,
    source: Option<&dyn PagedSource<T>>,
    policy: RefreshOrderPolicy,
    block: F,
  ) -> Result<()>
  where
    F: FnOnce(&[T]) -> Vec<T> + Send + 'static,
  {
    let remote_page = source.map(|s| s.current_page());
    let remote_total = source.and_then(|s| s.total_size());
    let key = Arc::clone(&self.key);

    let saved = self
      .store
      .update_data(Box::new(move |save| {
        let fetched = block(save.items.as_slice());
        let items = merge(policy, &save.items, fetched, |item| key(item));
        let base_total = remote_total.or(save.total_size);
        let total_size = match policy {
          RefreshOrderPolicy::Replace => {
            base_total.map(|total| adjust_total(total, save.items.len(), items.len()))
          }
          RefreshOrderPolicy::KeepOrderAppendLast => base_total,
        };
        CacheSave::new(items, remote_page.or(save.page), total_size)
      }))
      .await?;

    debug!(
      cache = %self.debug_name,
      items = saved.items.len(),
      page = ?saved.page,
      "Committed cache save"
    );
    // The adjusted total is persisted, readers must not see the raw remote one
    let remote_total = match policy {
      RefreshOrderPolicy::Replace => None,
      RefreshOrderPolicy::KeepOrderAppendLast => remote_total,
    };
    self.committed.send_replace(Committed {
      save: saved,
      remote_total,
    });
    Ok(())
  }

  fn publish_session(&self, session: &Session<T>) {
    let state = session.state();
    let finished = session.source().is_some_and(|s| s.is_finished());
    self.status.send_modify(|s| {
      s.state = state;
      s.finished = finished;
    });
  }
}

/// Shift `total` by the change in local size.
fn adjust_total(total: u32, old_len: usize, new_len: usize) -> u32 {
  let delta = new_len as i64 - old_len as i64;
  u32::try_from((i64::from(total) + delta).max(0)).unwrap_or(u32::MAX)
}

async fn fetch_page<T>(source: &dyn PagedSource<T>) -> FetchResult<Option<Vec<T>>> {
  catch_panic(source.next_page()).await
}

/// Report a panicking fetch capability as an unknown error.
async fn catch_panic<R, Fut>(fut: Fut) -> FetchResult<R>
where
  Fut: Future<Output = FetchResult<R>>,
{
  match AssertUnwindSafe(fut).catch_unwind().await {
    Ok(result) => result,
    Err(panic) => FetchResult::unknown(eyre!("Fetch panicked: {}", panic_message(&*panic))),
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.as_str()
  } else {
    "unknown panic"
  }
}

/// Marks a fetch as running until dropped.
struct InFlight<'a> {
  status: &'a watch::Sender<SessionStatus>,
}

impl<'a> InFlight<'a> {
  fn start(status: &'a watch::Sender<SessionStatus>) -> Self {
    status.send_modify(|s| s.in_flight = true);
    Self { status }
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.status.send_modify(|s| s.in_flight = false);
  }
}

/// Steps the source back one page unless disarmed, for pages that were
/// fetched but never committed.
struct RewindOnDrop<'a, T> {
  source: &'a dyn PagedSource<T>,
  armed: bool,
}

impl<'a, T> RewindOnDrop<'a, T> {
  fn arm(source: &'a dyn PagedSource<T>) -> Self {
    Self {
      source,
      armed: true,
    }
  }

  fn disarm(&mut self) {
    self.armed = false;
  }
}

impl<T> Drop for RewindOnDrop<'_, T> {
  fn drop(&mut self) {
    if self.armed {
      debug!("Page was not committed, rewinding source");
      self.source.back_to_previous();
    }
  }
}
