//! HTTP paged JSON collections.
//!
//! An endpoint answers `GET <url>?<page_param>=<n>` with
//! `{"items": [...], "hasMore": bool, "total": n}`.

mod api_types;
mod client;
mod collection;

pub use api_types::ApiPage;
pub use client::CollectionClient;
pub use collection::{item_key, open_collection, CollectionKey, RemoteCache};
