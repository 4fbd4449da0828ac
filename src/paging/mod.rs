//! Paged fetch capability consumed by the cache.
//!
//! A [`PagedSource`] is a stateful cursor over a remote collection. The cache
//! drives it one page at a time and may rewind it by one step when a fetched
//! page could not be committed.

use futures::future::BoxFuture;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Mutex;

use crate::cache::FetchResult;

/// One page returned by a page fetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Paged<T> {
  pub items: Vec<T>,
  /// Whether another page follows this one
  pub has_more: bool,
  /// Remote total, if the page reports one
  pub total: Option<u32>,
}

impl<T> Paged<T> {
  pub fn new(items: Vec<T>, has_more: bool) -> Self {
    Self {
      items,
      has_more,
      total: None,
    }
  }

  pub fn with_total(mut self, total: u32) -> Self {
    self.total = Some(total);
    self
  }
}

/// Stateful cursor over a remote paginated collection.
pub trait PagedSource<T>: Send + Sync {
  /// Fetch the next page, or `Success(None)` once the source is exhausted.
  ///
  /// If the returned future is dropped before it resolves, the page counter
  /// must be left untouched.
  fn next_page(&self) -> BoxFuture<'_, FetchResult<Option<Vec<T>>>>;

  fn is_finished(&self) -> bool;

  /// Number of pages consumed so far.
  fn current_page(&self) -> u32;

  fn total_size(&self) -> Option<u32>;

  /// Move the cursor to `page` without fetching anything.
  fn skip_to_page(&self, page: u32);

  /// Undo the last advance, if there was one. Clears `finished`.
  fn back_to_previous(&self);
}

#[derive(Debug, Default)]
struct Cursor {
  /// Pages consumed so far
  page: u32,
  finished: bool,
  total: Option<u32>,
}

type PageFetcher<T> =
  Box<dyn Fn(u32) -> BoxFuture<'static, FetchResult<Option<Paged<T>>>> + Send + Sync>;

/// [`PagedSource`] that fetches pages by number.
///
/// The fetcher receives `first_page + current_page()` and returns
/// `Success(None)` or a page with `has_more == false` to end the collection.
pub struct PageBasedSource<T> {
  fetcher: PageFetcher<T>,
  first_page: u32,
  cursor: Mutex<Cursor>,
  /// Only one fetch at a time
  fetch_lock: tokio::sync::Mutex<()>,
}

impl<T: Send + 'static> PageBasedSource<T> {
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult<Option<Paged<T>>>> + Send + 'static,
  {
    Self::with_first_page(0, fetcher)
  }

  /// Source for an API whose first page is numbered `first_page`.
  pub fn with_first_page<F, Fut>(first_page: u32, fetcher: F) -> Self
  where
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult<Option<Paged<T>>>> + Send + 'static,
  {
    Self {
      fetcher: Box::new(move |page| -> BoxFuture<'static, _> { Box::pin(fetcher(page)) }),
      first_page,
      cursor: Mutex::new(Cursor::default()),
      fetch_lock: tokio::sync::Mutex::new(()),
    }
  }
}

impl<T> PageBasedSource<T> {
  fn cursor(&self) -> std::sync::MutexGuard<'_, Cursor> {
    // The cursor holds plain counters, a poisoned lock still has valid data.
    self.cursor.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl<T: Send + 'static> PagedSource<T> for PageBasedSource<T> {
  fn next_page(&self) -> BoxFuture<'_, FetchResult<Option<Vec<T>>>> {
    Box::pin(async move {
      let _guard = self.fetch_lock.lock().await;

      let page = {
        let cursor = self.cursor();
        if cursor.finished {
          return FetchResult::Success(None);
        }
        cursor.page
      };

      let paged = match (self.fetcher)(self.first_page + page).await {
        FetchResult::Success(paged) => paged,
        FetchResult::ApiError(reason) => return FetchResult::ApiError(reason),
        FetchResult::UnknownError(cause) => return FetchResult::UnknownError(cause),
      };

      // No await below: a dropped future never leaves a half-advanced cursor.
      let mut cursor = self.cursor();
      match paged {
        None => {
          cursor.finished = true;
          FetchResult::Success(None)
        }
        Some(paged) => {
          if let Some(total) = paged.total {
            cursor.total = Some(total);
          }
          cursor.page += 1;
          if !paged.has_more {
            cursor.finished = true;
          }
          FetchResult::Success(Some(paged.items))
        }
      }
    })
  }

  fn is_finished(&self) -> bool {
    self.cursor().finished
  }

  fn current_page(&self) -> u32 {
    self.cursor().page
  }

  fn total_size(&self) -> Option<u32> {
    self.cursor().total
  }

  fn skip_to_page(&self, page: u32) {
    self.cursor().page = page;
  }

  fn back_to_previous(&self) {
    let mut cursor = self.cursor();
    if cursor.page == 0 {
      return;
    }
    cursor.finished = false;
    cursor.page -= 1;
  }
}

/// [`PagedSource`] whose whole collection arrives in a single fetch.
pub struct SinglePageSource<T> {
  inner: PageBasedSource<T>,
}

impl<T: Send + 'static> SinglePageSource<T> {
  pub fn new<F, Fut>(fetch_all: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult<Vec<T>>> + Send + 'static,
  {
    let inner = PageBasedSource::new(move |_page| {
      let fut = fetch_all();
      async move {
        fut.await.map(|items| {
          let total = u32::try_from(items.len()).unwrap_or(u32::MAX);
          Some(Paged::new(items, false).with_total(total))
        })
      }
    });
    Self { inner }
  }
}

impl<T: Send + 'static> PagedSource<T> for SinglePageSource<T> {
  fn next_page(&self) -> BoxFuture<'_, FetchResult<Option<Vec<T>>>> {
    self.inner.next_page()
  }

  fn is_finished(&self) -> bool {
    self.inner.is_finished()
  }

  fn current_page(&self) -> u32 {
    self.inner.current_page()
  }

  fn total_size(&self) -> Option<u32> {
    self.inner.total_size()
  }

  fn skip_to_page(&self, page: u32) {
    self.inner.skip_to_page(page)
  }

  fn back_to_previous(&self) {
    self.inner.back_to_previous()
  }
}

/// [`PagedSource`] whose items are converted by a function.
///
/// Cursor, total and rewind are those of the wrapped source.
pub struct MappedSource<S, F, T> {
  inner: S,
  transform: F,
  _marker: PhantomData<fn(T)>,
}

impl<S, F, T> MappedSource<S, F, T> {
  pub fn new(inner: S, transform: F) -> Self {
    Self {
      inner,
      transform,
      _marker: PhantomData,
    }
  }
}

impl<S, F, T, R> PagedSource<R> for MappedSource<S, F, T>
where
  S: PagedSource<T>,
  F: Fn(T) -> R + Send + Sync,
  R: 'static,
{
  fn next_page(&self) -> BoxFuture<'_, FetchResult<Option<Vec<R>>>> {
    Box::pin(async move {
      // No await after the inner fetch, the conversion cannot be interrupted.
      self
        .inner
        .next_page()
        .await
        .map(|page| page.map(|items| items.into_iter().map(&self.transform).collect()))
    })
  }

  fn is_finished(&self) -> bool {
    self.inner.is_finished()
  }

  fn current_page(&self) -> u32 {
    self.inner.current_page()
  }

  fn total_size(&self) -> Option<u32> {
    self.inner.total_size()
  }

  fn skip_to_page(&self, page: u32) {
    self.inner.skip_to_page(page)
  }

  fn back_to_previous(&self) {
    self.inner.back_to_previous()
  }
}

/// Adapters available on every [`PagedSource`].
pub trait PagedSourceExt<T>: PagedSource<T> + Sized {
  /// Convert every fetched item with `transform`.
  fn map<R, F>(self, transform: F) -> MappedSource<Self, F, T>
  where
    F: Fn(T) -> R + Send + Sync,
  {
    MappedSource::new(self, transform)
  }
}

impl<T, S: PagedSource<T>> PagedSourceExt<T> for S {}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ApiFailure;

  fn three_pages() -> PageBasedSource<u32> {
    PageBasedSource::new(|page| async move {
      match page {
        0 => FetchResult::Success(Some(Paged::new(vec![1, 2], true).with_total(5))),
        1 => FetchResult::Success(Some(Paged::new(vec![3, 4], true))),
        2 => FetchResult::Success(Some(Paged::new(vec![5], false))),
        _ => FetchResult::Success(None),
      }
    })
  }

  fn items(result: FetchResult<Option<Vec<u32>>>) -> Option<Vec<u32>> {
    match result {
      FetchResult::Success(items) => items,
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_pages_in_order() {
    let source = three_pages();
    assert_eq!(items(source.next_page().await), Some(vec![1, 2]));
    assert_eq!(source.current_page(), 1);
    assert_eq!(source.total_size(), Some(5));
    assert_eq!(items(source.next_page().await), Some(vec![3, 4]));
    assert!(!source.is_finished());
    assert_eq!(items(source.next_page().await), Some(vec![5]));
    assert!(source.is_finished());
    assert_eq!(items(source.next_page().await), None);
    assert_eq!(source.current_page(), 3);
  }

  #[tokio::test]
  async fn test_none_marks_finished() {
    let source = PageBasedSource::<u32>::new(|_| async { FetchResult::Success(None) });
    assert_eq!(items(source.next_page().await), None);
    assert!(source.is_finished());
    assert_eq!(source.current_page(), 0);
  }

  #[tokio::test]
  async fn test_back_to_previous_refetches() {
    let source = three_pages();
    source.next_page().await;
    source.next_page().await;
    source.next_page().await;
    assert!(source.is_finished());

    source.back_to_previous();
    assert!(!source.is_finished());
    assert_eq!(source.current_page(), 2);
    assert_eq!(items(source.next_page().await), Some(vec![5]));
  }

  #[test]
  fn test_back_to_previous_at_start_is_noop() {
    let source = three_pages();
    source.back_to_previous();
    assert_eq!(source.current_page(), 0);
  }

  #[tokio::test]
  async fn test_one_based_numbering() {
    let source = PageBasedSource::with_first_page(1, |page| async move {
      FetchResult::Success(Some(Paged::new(vec![page], true)))
    });
    assert_eq!(items(source.next_page().await), Some(vec![1]));
    source.skip_to_page(3);
    assert_eq!(items(source.next_page().await), Some(vec![4]));
    assert_eq!(source.current_page(), 4);
  }

  #[tokio::test]
  async fn test_skip_to_page() {
    let source = three_pages();
    source.skip_to_page(2);
    assert_eq!(items(source.next_page().await), Some(vec![5]));
  }

  #[tokio::test]
  async fn test_failure_keeps_cursor() {
    let source = PageBasedSource::<u32>::new(|_| async {
      FetchResult::ApiError(ApiFailure::ServiceUnavailable)
    });
    assert!(matches!(
      source.next_page().await,
      FetchResult::ApiError(ApiFailure::ServiceUnavailable)
    ));
    assert_eq!(source.current_page(), 0);
    assert!(!source.is_finished());
  }

  #[tokio::test]
  async fn test_dropped_fetch_keeps_cursor() {
    let source = PageBasedSource::<u32>::new(|_| async {
      futures::future::pending::<()>().await;
      FetchResult::Success(None)
    });
    let result =
      tokio::time::timeout(std::time::Duration::from_millis(10), source.next_page()).await;
    assert!(result.is_err());
    assert_eq!(source.current_page(), 0);
  }

  #[tokio::test]
  async fn test_mapped_source_passes_cursor_through() {
    let source = three_pages().map(|v: u32| format!("#{}", v));

    match source.next_page().await {
      FetchResult::Success(Some(items)) => assert_eq!(items, vec!["#1", "#2"]),
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(source.current_page(), 1);
    assert_eq!(source.total_size(), Some(5));

    source.back_to_previous();
    assert_eq!(source.current_page(), 0);
    match source.next_page().await {
      FetchResult::Success(Some(items)) => assert_eq!(items, vec!["#1", "#2"]),
      other => panic!("unexpected {:?}", other),
    }

    source.skip_to_page(2);
    match source.next_page().await {
      FetchResult::Success(Some(items)) => assert_eq!(items, vec!["#5"]),
      other => panic!("unexpected {:?}", other),
    }
    assert!(source.is_finished());
  }

  #[tokio::test]
  async fn test_mapped_source_keeps_failures() {
    let source = PageBasedSource::<u32>::new(|_| async {
      FetchResult::ApiError(ApiFailure::Unauthorized)
    })
    .map(|v: u32| v * 2);
    assert!(matches!(
      source.next_page().await,
      FetchResult::ApiError(ApiFailure::Unauthorized)
    ));
    assert_eq!(source.current_page(), 0);
  }

  #[tokio::test]
  async fn test_single_page_source() {
    let source = SinglePageSource::new(|| async { FetchResult::Success(vec![1, 2, 3]) });
    assert_eq!(items(source.next_page().await), Some(vec![1, 2, 3]));
    assert!(source.is_finished());
    assert_eq!(source.total_size(), Some(3));
    assert_eq!(items(source.next_page().await), None);
  }
}
