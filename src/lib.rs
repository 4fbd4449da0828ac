//! Lazily fetched, persistently cached paginated collections.

pub mod cache;
pub mod config;
pub mod logging;
pub mod paging;
pub mod remote;
