//! In-memory marketplace used by the integration tests
//!
//! Serves each kind's records as a changes feed ordered by `updated_at`.
//! Continuation tokens are plain offsets (`off:<n>`), so a token handed out
//! at the end of the feed resumes there and only returns later additions.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use serde_json::json;
use shop_sync::{
    store, MarketplaceApi, Page, Payload, RecordKind, RemoteRecord, Result, RetryPolicy,
    SyncCursor, SyncEngine, SyncError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Produces the error injected for a failing request
pub type ErrorFactory = fn() -> SyncError;

pub fn transient() -> SyncError {
    SyncError::TransientNetwork("connection reset by peer".to_string())
}

pub fn rate_limited() -> SyncError {
    SyncError::RateLimited {
        retry_after: Some(std::time::Duration::from_secs(1)),
    }
}

pub fn unauthorized() -> SyncError {
    SyncError::auth("token revoked")
}

#[derive(Default)]
pub struct FakeMarketplace {
    feeds: Mutex<HashMap<RecordKind, Vec<RemoteRecord>>>,
    /// offset -> (remaining failures, error)
    failures: Mutex<HashMap<(RecordKind, usize), (usize, ErrorFactory)>>,
    calls: AtomicUsize,
    /// When set, every fetch announces itself on `entered` and waits for `release`
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
    /// Answer the last page with `next_token: None`
    no_final_token: bool,
}

impl FakeMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    /// A marketplace whose fetches block until `release` is notified
    pub fn gated(entered: Arc<Notify>, release: Arc<Notify>) -> Self {
        Self {
            gate: Some((entered, release)),
            ..Self::default()
        }
    }

    /// A marketplace that ends its feed without a continuation token
    pub fn without_final_token() -> Self {
        Self {
            no_final_token: true,
            ..Self::default()
        }
    }

    /// Append `count` records with ids `<prefix><n>`, one minute apart
    pub fn seed(&self, kind: RecordKind, prefix: &str, count: usize) {
        let start = self.len(kind);
        let mut feeds = self.feeds.lock().unwrap();
        let feed = feeds.entry(kind).or_default();
        for seq in start..start + count {
            feed.push(record(
                kind,
                &format!("{}{}", prefix, seq),
                seq as i64,
                json!({ "title": format!("item {}", seq) }),
            ));
        }
    }

    /// Append a record to the end of the feed
    pub fn push(&self, record: RemoteRecord) {
        self.feeds
            .lock()
            .unwrap()
            .entry(record.kind)
            .or_default()
            .push(record);
    }

    pub fn len(&self, kind: RecordKind) -> usize {
        self.feeds
            .lock()
            .unwrap()
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Fail the request for the page starting at `offset` `times` times
    pub fn fail_at(&self, kind: RecordKind, offset: usize, times: usize, error: ErrorFactory) {
        self.failures
            .lock()
            .unwrap()
            .insert((kind, offset), (times, error));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn offset_for(&self, kind: RecordKind, cursor: &SyncCursor) -> usize {
        if let Some(token) = &cursor.token {
            return token
                .strip_prefix("off:")
                .and_then(|n| n.parse().ok())
                .expect("fake marketplace only understands its own tokens");
        }
        let feeds = self.feeds.lock().unwrap();
        let feed = feeds.get(&kind).map(Vec::as_slice).unwrap_or(&[]);
        match cursor.updated_after {
            Some(after) => feed.iter().take_while(|r| r.updated_at <= after).count(),
            None => 0,
        }
    }
}

#[async_trait]
impl MarketplaceApi for FakeMarketplace {
    async fn fetch_page(
        &self,
        kind: RecordKind,
        cursor: &SyncCursor,
        page_size: usize,
    ) -> Result<Page> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }

        let offset = self.offset_for(kind, cursor);

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some((remaining, error)) = failures.get_mut(&(kind, offset)) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error());
                }
            }
        }

        let feeds = self.feeds.lock().unwrap();
        let feed = feeds.get(&kind).map(Vec::as_slice).unwrap_or(&[]);
        let end = (offset + page_size).min(feed.len());
        let records = feed[offset.min(end)..end].to_vec();

        let has_more = end < feed.len();
        let next_token = if !has_more && self.no_final_token {
            None
        } else {
            Some(format!("off:{}", end))
        };
        Ok(Page {
            records,
            next_token,
            has_more,
        })
    }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

/// Build a remote record updated `minutes` after the base time
pub fn record(kind: RecordKind, id: &str, minutes: i64, payload: serde_json::Value) -> RemoteRecord {
    let payload: Payload = match payload {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    };
    RemoteRecord {
        id: id.to_string(),
        kind,
        updated_at: base_time() + chrono::Duration::minutes(minutes),
        deleted: false,
        payload,
    }
}

pub fn memory_db() -> Arc<Mutex<Connection>> {
    let conn = Connection::open_in_memory().unwrap();
    store::init_schema(&conn).unwrap();
    Arc::new(Mutex::new(conn))
}

/// Engine over `api` with an in-memory store, no retry delays and the given page size
pub fn engine_with(api: Arc<FakeMarketplace>, page_size: usize, attempts: usize) -> SyncEngine {
    SyncEngine::new(api, memory_db())
        .with_page_size(page_size)
        .with_retry_policy(RetryPolicy::immediate(attempts))
}
