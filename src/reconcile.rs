//! Merge policy between a local copy and a freshly fetched remote record
//!
//! The marketplace is the source of truth for attribute values. Only the
//! local sync metadata survives a merge.

use crate::models::{LocalRecord, RemoteRecord, SyncState};
use chrono::{DateTime, Utc};

/// What an upsert did to the local copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    Updated,
    Unchanged,
}

/// Merge `remote` into `local`.
///
/// Payload and `updated_at` come from the remote record. The result is marked
/// synced at `now`; `first_synced_at` stays as it was.
pub fn reconcile(local: &LocalRecord, remote: &RemoteRecord, now: DateTime<Utc>) -> LocalRecord {
    LocalRecord {
        id: local.id.clone(),
        kind: local.kind,
        updated_at: remote.updated_at,
        payload: remote.payload.clone(),
        sync_state: SyncState::Synced,
        first_synced_at: local.first_synced_at,
        last_synced_at: now,
    }
}

/// Decide how an incoming remote record relates to the stored copy.
///
/// A record re-delivered with the stored version and payload is unchanged,
/// whatever its local sync state.
pub fn classify(local: Option<&LocalRecord>, remote: &RemoteRecord) -> Change {
    match local {
        None => Change::Created,
        Some(local) if local.updated_at == remote.updated_at && local.payload == remote.payload => {
            Change::Unchanged
        }
        Some(_) => Change::Updated,
    }
}
