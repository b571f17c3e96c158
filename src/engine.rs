//! Sync engine: pulls record feeds from the marketplace into the local store
//!
//! One session per record kind at a time. Each page is fetched (with retries),
//! then committed together with the advanced cursor in one transaction. A
//! session that stops early always leaves the cursor at the last committed page.

use crate::error::{Result, SyncError};
use crate::marketplace::MarketplaceApi;
use crate::models::{IncompleteReason, Page, RecordKind, SyncCursor, SyncResult};
use crate::retry::RetryPolicy;
use crate::store;
use chrono::Utc;
use futures::future::join_all;
use rusqlite::Connection;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::sleep;

/// Default number of records requested per page
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Phase of a running session, used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Fetching,
    Persisting,
}

/// Marks a kind as busy for as long as it lives
struct SessionGuard<'a> {
    active: &'a Mutex<HashSet<RecordKind>>,
    kind: RecordKind,
}

impl<'a> SessionGuard<'a> {
    fn acquire(active: &'a Mutex<HashSet<RecordKind>>, kind: RecordKind) -> Result<Self> {
        let mut set = active.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(kind) {
            return Err(SyncError::SyncInProgress(kind));
        }
        Ok(Self { active, kind })
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.kind);
    }
}

/// Keeps the local store in step with the marketplace
pub struct SyncEngine {
    api: Arc<dyn MarketplaceApi>,
    db: Arc<Mutex<Connection>>,
    policy: RetryPolicy,
    page_size: usize,
    active: Mutex<HashSet<RecordKind>>,
}

impl SyncEngine {
    pub fn new(api: Arc<dyn MarketplaceApi>, db: Arc<Mutex<Connection>>) -> Self {
        Self {
            api,
            db,
            policy: RetryPolicy::default(),
            page_size: DEFAULT_PAGE_SIZE,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Shared handle to the store
    pub fn db(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    /// Whether a session for `kind` is running right now
    pub fn is_syncing(&self, kind: RecordKind) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&kind)
    }

    /// Sync `kind` starting after `since`.
    ///
    /// `since` must be the zero cursor or a cursor previously returned for
    /// the same kind. Retry exhaustion yields `Ok` with `incomplete` set;
    /// fatal errors yield `Err`, with earlier pages of the call still committed.
    pub async fn sync(&self, kind: RecordKind, since: SyncCursor) -> Result<SyncResult> {
        self.run_session(kind, since, None).await
    }

    /// Like [`SyncEngine::sync`], stopping at the next page boundary once `cancel` is set
    pub async fn sync_with_cancel(
        &self,
        kind: RecordKind,
        since: SyncCursor,
        cancel: &AtomicBool,
    ) -> Result<SyncResult> {
        self.run_session(kind, since, Some(cancel)).await
    }

    /// Resume `kind` from the cursor stored in the database
    pub async fn sync_from_stored(
        &self,
        kind: RecordKind,
        cancel: Option<&AtomicBool>,
    ) -> Result<SyncResult> {
        let cursor = {
            let conn = self.db.lock().map_err(|_| SyncError::StorePoisoned)?;
            store::load_cursor(&conn, kind)?
        };
        self.run_session(kind, cursor, cancel).await
    }

    /// Run one session per kind concurrently; results come back in input order
    pub async fn sync_kinds(
        &self,
        kinds: &[RecordKind],
        full: bool,
        cancel: Option<&AtomicBool>,
    ) -> Vec<(RecordKind, Result<SyncResult>)> {
        let sessions = kinds.iter().map(|&kind| async move {
            let result = if full {
                self.run_session(kind, SyncCursor::zero(kind), cancel).await
            } else {
                self.sync_from_stored(kind, cancel).await
            };
            (kind, result)
        });
        join_all(sessions).await
    }

    async fn run_session(
        &self,
        kind: RecordKind,
        since: SyncCursor,
        cancel: Option<&AtomicBool>,
    ) -> Result<SyncResult> {
        if since.kind != kind {
            return Err(SyncError::InvalidCursor {
                expected: kind,
                found: since.kind,
            });
        }

        let _guard = SessionGuard::acquire(&self.active, kind)?;
        log::info!(
            "Starting {} sync ({})",
            kind,
            if since.is_zero() { "full" } else { "incremental" }
        );

        let mut result = SyncResult::new(since);
        let mut state = SessionState::Idle;

        loop {
            if cancel.map(|c| c.load(Ordering::Relaxed)).unwrap_or(false) {
                log::warn!(
                    "{} sync cancelled after {} page(s)",
                    kind,
                    result.pages
                );
                result.incomplete = Some(IncompleteReason::Cancelled);
                break;
            }

            state = transition(kind, state, SessionState::Fetching);
            let page_number = result.pages + 1;
            let page = match self.fetch_with_retry(kind, &result.cursor, page_number).await {
                Ok(page) => page,
                Err(err) if err.is_retryable() => {
                    log::warn!(
                        "{} sync incomplete: giving up on page {}: {}",
                        kind,
                        page_number,
                        err
                    );
                    result.incomplete = Some(IncompleteReason::RetriesExhausted {
                        page: page_number,
                        last_error: err.to_string(),
                    });
                    break;
                }
                Err(err) => {
                    log::error!("{} sync failed on page {}: {}", kind, page_number, err);
                    return Err(err);
                }
            };

            if page.has_more
                && (page.next_token.is_none() || page.next_token == result.cursor.token)
            {
                log::error!("{} page {} has more results but no new cursor", kind, page_number);
                return Err(SyncError::invalid_record(format!(
                    "{} page {} does not advance the cursor",
                    kind, page_number
                )));
            }

            state = transition(kind, state, SessionState::Persisting);
            self.commit(&mut result, &page)?;

            if !page.has_more {
                break;
            }
        }

        transition(kind, state, SessionState::Idle);
        log::info!(
            "Finished {} sync: {} created, {} updated, {} unchanged, {} deleted, {} conflicts over {} page(s){}",
            kind,
            result.created,
            result.updated,
            result.unchanged,
            result.deleted,
            result.conflicts,
            result.pages,
            if result.is_complete() { "" } else { " (incomplete)" }
        );
        Ok(result)
    }

    /// Fetch one page, retrying transient failures and rate limits
    async fn fetch_with_retry(
        &self,
        kind: RecordKind,
        cursor: &SyncCursor,
        page_number: usize,
    ) -> Result<Page> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.api.fetch_page(kind, cursor, self.page_size).await {
                Ok(page) => return Ok(page),
                Err(err) if self.policy.should_retry(attempt, &err) => {
                    let delay = self.policy.delay_for(attempt, &err);
                    log::warn!(
                        "{} page {} attempt {}/{} failed: {} (retrying in {:?})",
                        kind,
                        page_number,
                        attempt,
                        self.policy.max_attempts,
                        err,
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Persist a page and move the session cursor past it
    fn commit(&self, result: &mut SyncResult, page: &Page) -> Result<()> {
        let mut conn = self.db.lock().map_err(|_| SyncError::StorePoisoned)?;
        let (counts, next) = store::commit_page(&mut conn, &result.cursor, page, Utc::now())
            .map_err(|err| {
                log::error!("Failed to commit {} page: {}", result.kind, err);
                err
            })?;
        result.absorb(&counts);
        result.cursor = next;
        Ok(())
    }
}

fn transition(kind: RecordKind, from: SessionState, to: SessionState) -> SessionState {
    if from != to {
        log::debug!("{} session {:?} -> {:?}", kind, from, to);
    }
    to
}
