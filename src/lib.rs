//! Shop Sync - marketplace seller data in a local SQLite file
//!
//! Pulls shop, listing, order and sale-event records from the marketplace API,
//! reconciles them into a local store page by page, and reports on the synced
//! sales data.

pub mod config;
pub mod engine;
pub mod error;
pub mod marketplace;
pub mod models;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod store;

pub use engine::{SyncEngine, DEFAULT_PAGE_SIZE};
pub use error::{Result, SyncError};
pub use marketplace::{MarketplaceApi, MarketplaceClient};
pub use models::{
    IncompleteReason, LocalRecord, Page, PageCounts, Payload, RecordKind, RemoteRecord,
    SyncCursor, SyncResult, SyncState,
};
pub use retry::RetryPolicy;
