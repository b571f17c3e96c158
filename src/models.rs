//! Record, cursor and result types shared by the sync engine and the store

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Attribute map carried by every record
pub type Payload = Map<String, Value>;

/// Kinds of marketplace data mirrored locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Shop,
    Listing,
    Order,
    SaleEvent,
}

impl RecordKind {
    /// All kinds, in the order a full sync walks them
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Shop,
        RecordKind::Listing,
        RecordKind::Order,
        RecordKind::SaleEvent,
    ];

    /// Name used in the database and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Shop => "shop",
            RecordKind::Listing => "listing",
            RecordKind::Order => "order",
            RecordKind::SaleEvent => "sale_event",
        }
    }

    /// Collection path segment on the marketplace API
    pub fn collection(&self) -> &'static str {
        match self {
            RecordKind::Shop => "shops",
            RecordKind::Listing => "listings",
            RecordKind::Order => "orders",
            RecordKind::SaleEvent => "sale-events",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "shop" | "shops" => Ok(RecordKind::Shop),
            "listing" | "listings" => Ok(RecordKind::Listing),
            "order" | "orders" => Ok(RecordKind::Order),
            "sale_event" | "sale_events" | "sale" | "sales" => Ok(RecordKind::SaleEvent),
            other => Err(format!(
                "unknown record kind '{}' (expected shop, listing, order or sale_event)",
                other
            )),
        }
    }
}

/// A record as delivered by the marketplace. Only lives for the duration of a fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub id: String,
    pub kind: RecordKind,
    pub updated_at: DateTime<Utc>,
    /// Tombstone: the marketplace removed this record
    pub deleted: bool,
    pub payload: Payload,
}

impl RemoteRecord {
    /// Build a record from one element of a page's `results` array.
    ///
    /// `id` may be a string or an integer. `updated_at` must be RFC 3339.
    /// Everything else except `deleted` goes into the payload.
    pub fn from_json(kind: RecordKind, value: Value) -> Result<Self> {
        let mut object = match value {
            Value::Object(map) => map,
            other => {
                return Err(SyncError::invalid_record(format!(
                    "{} record is not an object: {}",
                    kind, other
                )))
            }
        };

        let id = match object.remove("id") {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(SyncError::invalid_record(format!(
                    "{} record has unusable id: {}",
                    kind, other
                )))
            }
            None => {
                return Err(SyncError::invalid_record(format!(
                    "{} record without id",
                    kind
                )))
            }
        };

        let updated_at = match object.remove("updated_at") {
            Some(Value::String(s)) => parse_timestamp(&s).ok_or_else(|| {
                SyncError::invalid_record(format!(
                    "{} {} has bad updated_at '{}'",
                    kind, id, s
                ))
            })?,
            _ => {
                return Err(SyncError::invalid_record(format!(
                    "{} {} without updated_at",
                    kind, id
                )))
            }
        };

        let deleted = matches!(object.remove("deleted"), Some(Value::Bool(true)));

        Ok(Self {
            id,
            kind,
            updated_at,
            deleted,
            payload: object,
        })
    }
}

/// Local sync status of a mirrored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Seller staged a local edit that has not been pushed yet
    Pending,
    /// Mirrors the last fetched remote version
    Synced,
    /// Marketplace deleted a record that had a pending local edit
    Conflict,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
            SyncState::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncState::Pending),
            "synced" => Ok(SyncState::Synced),
            "conflict" => Ok(SyncState::Conflict),
            other => Err(format!("unknown sync state '{}'", other)),
        }
    }
}

/// A record as stored locally
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalRecord {
    pub id: String,
    pub kind: RecordKind,
    pub updated_at: DateTime<Utc>,
    pub payload: Payload,
    pub sync_state: SyncState,
    pub first_synced_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

impl LocalRecord {
    /// First local copy of a remote record
    pub fn from_remote(remote: &RemoteRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: remote.id.clone(),
            kind: remote.kind,
            updated_at: remote.updated_at,
            payload: remote.payload.clone(),
            sync_state: SyncState::Synced,
            first_synced_at: now,
            last_synced_at: now,
        }
    }
}

/// Sync progress for one record kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub kind: RecordKind,
    /// Marketplace continuation token; resumes right after the last committed page
    pub token: Option<String>,
    /// Highest `updated_at` among committed records
    pub updated_after: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncCursor {
    /// Cursor that requests a full resync
    pub fn zero(kind: RecordKind) -> Self {
        Self {
            kind,
            token: None,
            updated_after: None,
            last_synced_at: None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.token.is_none() && self.updated_after.is_none() && self.last_synced_at.is_none()
    }

    /// Move past a committed page. Never moves `updated_after` backwards.
    ///
    /// A final page without a token clears the token, so the next session
    /// resumes from `updated_after` instead of re-reading that page.
    pub fn advance(
        &mut self,
        next_token: Option<&str>,
        has_more: bool,
        max_updated_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        match next_token {
            Some(token) => self.token = Some(token.to_string()),
            None if !has_more => self.token = None,
            None => {}
        }
        self.updated_after = match (self.updated_after, max_updated_at) {
            (Some(current), Some(seen)) => Some(current.max(seen)),
            (current, seen) => current.or(seen),
        };
        self.last_synced_at = Some(now);
    }
}

/// One batch returned by a single paginated call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RemoteRecord>,
    /// Token that resumes after this page
    pub next_token: Option<String>,
    pub has_more: bool,
}

/// Why a sync session stopped before reaching the end of the feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteReason {
    /// Page number `page` (1-based within the session) kept failing
    RetriesExhausted { page: usize, last_error: String },
    /// Caller asked to stop
    Cancelled,
}

impl fmt::Display for IncompleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncompleteReason::RetriesExhausted { page, last_error } => {
                write!(f, "page {} failed after retries: {}", page, last_error)
            }
            IncompleteReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one sync session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub kind: RecordKind,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub conflicts: usize,
    /// Pages committed in this session
    pub pages: usize,
    /// Last committed cursor; safe to resume from
    pub cursor: SyncCursor,
    pub incomplete: Option<IncompleteReason>,
}

impl SyncResult {
    pub fn new(cursor: SyncCursor) -> Self {
        Self {
            kind: cursor.kind,
            created: 0,
            updated: 0,
            unchanged: 0,
            deleted: 0,
            conflicts: 0,
            pages: 0,
            cursor,
            incomplete: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.incomplete.is_none()
    }

    /// Records created, updated or deleted
    pub fn changed(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    /// Add the counts of one committed page
    pub fn absorb(&mut self, counts: &PageCounts) {
        self.created += counts.created;
        self.updated += counts.updated;
        self.unchanged += counts.unchanged;
        self.deleted += counts.deleted;
        self.conflicts += counts.conflicts;
        self.pages += 1;
    }

    /// Turn a partial result into `SyncError::SyncIncomplete`
    pub fn ensure_complete(self) -> Result<Self> {
        match self.incomplete {
            None => Ok(self),
            Some(reason) => Err(SyncError::SyncIncomplete {
                kind: self.kind,
                reason,
            }),
        }
    }
}

/// Per-page upsert counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCounts {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub conflicts: usize,
}

/// Parse an RFC 3339 timestamp into UTC
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
pub use tests::make_remote;
