//! Core types for the caching system: fetch outcomes and observable state.

use color_eyre::eyre::Report;
use std::fmt;
use std::sync::Arc;

/// A classified failure reported by a remote fetch capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiFailure {
  /// The remote could not be reached (DNS, connect, timeout)
  NetworkError,
  /// The remote answered with a server-side error
  ServiceUnavailable,
  /// Credentials were missing or rejected
  Unauthorized,
}

impl fmt::Display for ApiFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ApiFailure::NetworkError => f.write_str("network error"),
      ApiFailure::ServiceUnavailable => f.write_str("service unavailable"),
      ApiFailure::Unauthorized => f.write_str("unauthorized"),
    }
  }
}

/// Cause attached to an unclassified failure. Shared so states stay cheap to clone.
pub type ErrorCause = Arc<Report>;

/// Outcome of a call into a fetch capability.
///
/// Failures are values, never panics or errors crossing the cache boundary.
#[derive(Debug, Clone)]
pub enum FetchResult<T> {
  Success(T),
  ApiError(ApiFailure),
  UnknownError(ErrorCause),
}

impl<T> FetchResult<T> {
  pub fn unknown(report: impl Into<Report>) -> Self {
    FetchResult::UnknownError(Arc::new(report.into()))
  }

  pub fn is_success(&self) -> bool {
    matches!(self, FetchResult::Success(_))
  }

  pub fn map<R>(self, f: impl FnOnce(T) -> R) -> FetchResult<R> {
    match self {
      FetchResult::Success(value) => FetchResult::Success(f(value)),
      FetchResult::ApiError(reason) => FetchResult::ApiError(reason),
      FetchResult::UnknownError(cause) => FetchResult::UnknownError(cause),
    }
  }

  /// Splits a failure off into the state it should be reported as.
  pub fn into_result(self) -> Result<T, CacheState> {
    match self {
      FetchResult::Success(value) => Ok(value),
      FetchResult::ApiError(reason) => Err(CacheState::ApiError(reason)),
      FetchResult::UnknownError(cause) => Err(CacheState::UnknownError(cause)),
    }
  }
}

/// Externally observable state of a cache's fetch session.
#[derive(Debug, Clone, Default)]
pub enum CacheState {
  #[default]
  Normal,
  ApiError(ApiFailure),
  UnknownError(ErrorCause),
}

impl CacheState {
  pub fn is_normal(&self) -> bool {
    matches!(self, CacheState::Normal)
  }

  pub fn api_failure(&self) -> Option<ApiFailure> {
    match self {
      CacheState::ApiError(reason) => Some(*reason),
      _ => None,
    }
  }
}

impl PartialEq for CacheState {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (CacheState::Normal, CacheState::Normal) => true,
      (CacheState::ApiError(a), CacheState::ApiError(b)) => a == b,
      (CacheState::UnknownError(a), CacheState::UnknownError(b)) => Arc::ptr_eq(a, b),
      _ => false,
    }
  }
}

impl fmt::Display for CacheState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CacheState::Normal => f.write_str("normal"),
      CacheState::ApiError(reason) => write!(f, "api error: {}", reason),
      CacheState::UnknownError(cause) => write!(f, "unknown error: {}", cause),
    }
  }
}
