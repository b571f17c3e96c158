//! Local SQLite store for mirrored records and sync cursors
//!
//! Uses parameterized queries exclusively (no SQL string concatenation).
//! A page of records and the cursor that points past it are written in a
//! single transaction, so the cursor can never run ahead of stored data.

use crate::error::{Result, SyncError};
use crate::models::{
    parse_timestamp, LocalRecord, Page, PageCounts, RecordKind, RemoteRecord, SyncCursor,
    SyncState,
};
use crate::reconcile::{classify, reconcile, Change};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;

/// Open (or create) the database file and make sure the schema exists
pub fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::Config(format!(
                    "cannot create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
            log::info!("Created directory: {}", parent.display());
        }
    }

    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    log::info!("Opened database: {}", path.display());
    Ok(conn)
}

/// Initialize the database schema
///
/// Creates tables if they don't exist:
/// - `local_records`: one row per (kind, id), payload stored as JSON text
/// - `sync_cursors`: one row per kind
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_records (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            payload TEXT NOT NULL,
            sync_state TEXT NOT NULL,
            first_synced_at TEXT NOT NULL,
            last_synced_at TEXT NOT NULL,
            PRIMARY KEY (kind, id)
        );

        CREATE INDEX IF NOT EXISTS idx_local_records_updated ON local_records(kind, updated_at);
        CREATE INDEX IF NOT EXISTS idx_local_records_state ON local_records(sync_state);

        CREATE TABLE IF NOT EXISTS sync_cursors (
            kind TEXT PRIMARY KEY,
            token TEXT,
            updated_after TEXT,
            last_synced_at TEXT
        );
        ",
    )?;

    log::debug!("Database schema initialized");
    Ok(())
}

/// Fixed-width UTC timestamps so that text comparison matches time order
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn read_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(raw)
        .ok_or_else(|| SyncError::invalid_record(format!("stored {} '{}' is not RFC 3339", column, raw)))
}

/// Persist one fetched page and advance the cursor, atomically.
///
/// Records are applied in ascending `(updated_at, id)` order. On any error
/// the transaction is rolled back and neither records nor cursor change.
/// Returns the per-page counts and the cursor now stored for the kind's session.
pub fn commit_page(
    conn: &mut Connection,
    cursor: &SyncCursor,
    page: &Page,
    now: DateTime<Utc>,
) -> Result<(PageCounts, SyncCursor)> {
    let tx = conn.transaction()?;

    let mut records: Vec<&RemoteRecord> = page.records.iter().collect();
    records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));

    let mut counts = PageCounts::default();
    for record in &records {
        if record.kind != cursor.kind {
            return Err(SyncError::invalid_record(format!(
                "{} {} delivered in a {} page",
                record.kind, record.id, cursor.kind
            )));
        }
        apply_record_tx(&tx, record, now, &mut counts)?;
    }

    let mut next = cursor.clone();
    next.advance(
        page.next_token.as_deref(),
        page.has_more,
        records.iter().map(|r| r.updated_at).max(),
        now,
    );
    save_cursor_tx(&tx, &next)?;

    tx.commit()?;

    log::debug!(
        "Committed {} page: {} created, {} updated, {} unchanged, {} deleted, {} conflicts",
        cursor.kind,
        counts.created,
        counts.updated,
        counts.unchanged,
        counts.deleted,
        counts.conflicts
    );
    Ok((counts, next))
}

fn apply_record_tx(
    tx: &Transaction<'_>,
    remote: &RemoteRecord,
    now: DateTime<Utc>,
    counts: &mut PageCounts,
) -> Result<()> {
    let existing = get_record(tx, remote.kind, &remote.id)?;

    if remote.deleted {
        match existing {
            None => {
                log::debug!("Tombstone for unknown {} {}, ignored", remote.kind, remote.id);
            }
            Some(local) if local.sync_state == SyncState::Synced => {
                tx.execute(
                    "DELETE FROM local_records WHERE kind = ?1 AND id = ?2",
                    params![remote.kind.as_str(), &remote.id],
                )?;
                counts.deleted += 1;
            }
            Some(local) => {
                // keep the row so the pending edit is not lost
                if local.sync_state == SyncState::Pending {
                    set_state_tx(tx, remote.kind, &remote.id, SyncState::Conflict, now)?;
                    counts.conflicts += 1;
                }
                log::warn!(
                    "{} {} deleted remotely but has local changes, marked conflict",
                    remote.kind,
                    remote.id
                );
            }
        }
        return Ok(());
    }

    let merged = match (existing.as_ref(), classify(existing.as_ref(), remote)) {
        (None, _) => {
            counts.created += 1;
            LocalRecord::from_remote(remote, now)
        }
        (Some(_), Change::Unchanged) => {
            // same version as stored; leaves a pending edit in place
            counts.unchanged += 1;
            return Ok(());
        }
        (Some(local), _) => {
            counts.updated += 1;
            reconcile(local, remote, now)
        }
    };

    write_record_tx(tx, &merged)
}

fn write_record_tx(tx: &Transaction<'_>, record: &LocalRecord) -> Result<()> {
    let payload = serde_json::to_string(&record.payload)?;
    let mut stmt = tx.prepare_cached(
        "INSERT INTO local_records
         (kind, id, updated_at, payload, sync_state, first_synced_at, last_synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(kind, id) DO UPDATE SET
             updated_at = excluded.updated_at,
             payload = excluded.payload,
             sync_state = excluded.sync_state,
             last_synced_at = excluded.last_synced_at",
    )?;
    stmt.execute(params![
        record.kind.as_str(),
        &record.id,
        format_timestamp(record.updated_at),
        payload,
        record.sync_state.as_str(),
        format_timestamp(record.first_synced_at),
        format_timestamp(record.last_synced_at),
    ])?;
    Ok(())
}

fn set_state_tx(
    conn: &Connection,
    kind: RecordKind,
    id: &str,
    state: SyncState,
    now: DateTime<Utc>,
) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE local_records SET sync_state = ?3, last_synced_at = ?4
         WHERE kind = ?1 AND id = ?2",
        params![kind.as_str(), id, state.as_str(), format_timestamp(now)],
    )?)
}

/// Store a cursor. `updated_after` (and with it the token) never moves backwards.
fn save_cursor_tx(conn: &Connection, cursor: &SyncCursor) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_cursors (kind, token, updated_after, last_synced_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(kind) DO UPDATE SET
             token = CASE
                 WHEN sync_cursors.updated_after IS NULL
                      OR excluded.updated_after >= sync_cursors.updated_after
                 THEN excluded.token ELSE sync_cursors.token END,
             updated_after = CASE
                 WHEN sync_cursors.updated_after IS NULL
                      OR excluded.updated_after >= sync_cursors.updated_after
                 THEN excluded.updated_after ELSE sync_cursors.updated_after END,
             last_synced_at = excluded.last_synced_at",
        params![
            cursor.kind.as_str(),
            &cursor.token,
            cursor.updated_after.map(format_timestamp),
            cursor.last_synced_at.map(format_timestamp),
        ],
    )?;
    Ok(())
}

/// Load the stored cursor for a kind, or the zero cursor if it never synced
pub fn load_cursor(conn: &Connection, kind: RecordKind) -> Result<SyncCursor> {
    let row: Option<(Option<String>, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT token, updated_after, last_synced_at FROM sync_cursors WHERE kind = ?1",
            params![kind.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((token, updated_after, last_synced_at)) = row else {
        return Ok(SyncCursor::zero(kind));
    };

    Ok(SyncCursor {
        kind,
        token,
        updated_after: updated_after
            .as_deref()
            .map(|s| read_timestamp("updated_after", s))
            .transpose()?,
        last_synced_at: last_synced_at
            .as_deref()
            .map(|s| read_timestamp("last_synced_at", s))
            .transpose()?,
    })
}

/// Columns of a `local_records` row before conversion
struct RawRecord {
    id: String,
    updated_at: String,
    payload: String,
    sync_state: String,
    first_synced_at: String,
    last_synced_at: String,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            updated_at: row.get(1)?,
            payload: row.get(2)?,
            sync_state: row.get(3)?,
            first_synced_at: row.get(4)?,
            last_synced_at: row.get(5)?,
        })
    }

    fn into_record(self, kind: RecordKind) -> Result<LocalRecord> {
        Ok(LocalRecord {
            kind,
            updated_at: read_timestamp("updated_at", &self.updated_at)?,
            payload: serde_json::from_str(&self.payload)?,
            sync_state: self
                .sync_state
                .parse()
                .map_err(SyncError::InvalidRecord)?,
            first_synced_at: read_timestamp("first_synced_at", &self.first_synced_at)?,
            last_synced_at: read_timestamp("last_synced_at", &self.last_synced_at)?,
            id: self.id,
        })
    }
}

const RECORD_COLUMNS: &str =
    "id, updated_at, payload, sync_state, first_synced_at, last_synced_at";

/// Get a single record by kind and id
pub fn get_record(conn: &Connection, kind: RecordKind, id: &str) -> Result<Option<LocalRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM local_records WHERE kind = ?1 AND id = ?2",
        RECORD_COLUMNS
    ))?;
    let raw = stmt
        .query_row(params![kind.as_str(), id], RawRecord::from_row)
        .optional()?;
    raw.map(|r| r.into_record(kind)).transpose()
}

/// All records of a kind, oldest update first
pub fn list_records(conn: &Connection, kind: RecordKind) -> Result<Vec<LocalRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM local_records WHERE kind = ?1 ORDER BY updated_at ASC, id ASC",
        RECORD_COLUMNS
    ))?;
    let raws: rusqlite::Result<Vec<RawRecord>> = stmt
        .query_map(params![kind.as_str()], RawRecord::from_row)?
        .collect();
    raws?.into_iter().map(|r| r.into_record(kind)).collect()
}

/// Number of stored records of a kind
pub fn count_records(conn: &Connection, kind: RecordKind) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM local_records WHERE kind = ?1",
        params![kind.as_str()],
        |row| row.get(0),
    )?)
}

/// Per kind and sync state row counts, for status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCount {
    pub kind: RecordKind,
    pub state: SyncState,
    pub count: i64,
}

/// Count records grouped by kind and sync state
pub fn record_counts_by_state(conn: &Connection) -> Result<Vec<StateCount>> {
    let mut stmt = conn.prepare(
        "SELECT kind, sync_state, COUNT(*) FROM local_records
         GROUP BY kind, sync_state ORDER BY kind, sync_state",
    )?;
    let rows: rusqlite::Result<Vec<(String, String, i64)>> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect();

    rows?
        .into_iter()
        .map(|(kind, state, count)| {
            Ok(StateCount {
                kind: kind.parse().map_err(SyncError::InvalidRecord)?,
                state: state.parse().map_err(SyncError::InvalidRecord)?,
                count,
            })
        })
        .collect()
}

/// Flag a record as carrying an unpushed local edit.
///
/// Returns false if no such record exists.
pub fn mark_pending(conn: &Connection, kind: RecordKind, id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE local_records SET sync_state = ?3 WHERE kind = ?1 AND id = ?2",
        params![kind.as_str(), id, SyncState::Pending.as_str()],
    )?;
    Ok(changed > 0)
}

/// Manually remove one record. Returns false if it did not exist.
pub fn purge_record(conn: &Connection, kind: RecordKind, id: &str) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM local_records WHERE kind = ?1 AND id = ?2",
        params![kind.as_str(), id],
    )?;
    if removed > 0 {
        log::info!("Purged {} {}", kind, id);
    }
    Ok(removed > 0)
}

/// Remove every record of a kind and reset its cursor, so the next sync is a full one
pub fn purge_kind(conn: &mut Connection, kind: RecordKind) -> Result<usize> {
    let tx = conn.transaction()?;
    let removed = tx.execute(
        "DELETE FROM local_records WHERE kind = ?1",
        params![kind.as_str()],
    )?;
    tx.execute(
        "DELETE FROM sync_cursors WHERE kind = ?1",
        params![kind.as_str()],
    )?;
    tx.commit()?;

    log::info!("Purged {} {} records and reset cursor", removed, kind);
    Ok(removed)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
