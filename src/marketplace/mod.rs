//! Marketplace API access
//!
//! The sync engine only talks to the marketplace through [`MarketplaceApi`],
//! so tests can swap the HTTP client for an in-memory feed.

mod client;

pub use client::MarketplaceClient;

use crate::error::Result;
use crate::models::{Page, RecordKind, SyncCursor};
use async_trait::async_trait;

/// Source of paginated record feeds, ordered by ascending update time
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    /// Fetch the page of `kind` records that follows `cursor`
    async fn fetch_page(
        &self,
        kind: RecordKind,
        cursor: &SyncCursor,
        page_size: usize,
    ) -> Result<Page>;
}
