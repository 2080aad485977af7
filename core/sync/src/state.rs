//! Sync metadata persistence and the user-facing status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use notesync_common::{Error, Result};
use notesync_storage::StoreTx;

const WATERMARK_KEY: &str = "watermark";
const LAST_SUCCESS_KEY: &str = "last_successful_sync_at";
const LAST_ERROR_KEY: &str = "last_error";

/// Sync status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// The last remote call failed with a transient error.
    Offline,
    /// Local changes waiting to upload.
    Queued(usize),
    /// A sync cycle is running.
    Syncing,
    /// Nothing left to upload.
    Synced,
    /// Terminal-failed entries exist, or the last error was not transient.
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Offline => write!(f, "Offline"),
            SyncStatus::Queued(n) => write!(f, "Queued ({n})"),
            SyncStatus::Syncing => write!(f, "Syncing"),
            SyncStatus::Synced => write!(f, "Synced"),
            SyncStatus::Error => write!(f, "Sync error"),
        }
    }
}

/// Last error recorded by a drain or poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub message: String,
    /// Whether the failure is expected to clear on its own.
    pub transient: bool,
    pub at: DateTime<Utc>,
}

impl RecordedError {
    pub fn from_error(err: &Error, at: DateTime<Utc>) -> Self {
        Self {
            message: err.to_string(),
            transient: err.is_transient(),
            at,
        }
    }
}

/// Point-in-time view of sync progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetaSnapshot {
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    /// Highest remote `updated_at` fully applied.
    pub watermark: Option<DateTime<Utc>>,
    /// Entries not yet acknowledged, terminal ones included.
    pub pending_count: usize,
    pub failed_count: usize,
    pub last_error: Option<RecordedError>,
    pub attempts_by_entry: BTreeMap<String, u32>,
}

impl SyncMetaSnapshot {
    /// Read the snapshot inside a store transaction.
    pub fn load(tx: &StoreTx<'_>) -> Result<Self> {
        let entries = tx.queue_list()?;
        Ok(Self {
            last_successful_sync_at: SyncMeta::last_success(tx)?,
            watermark: SyncMeta::watermark(tx)?,
            pending_count: entries.len(),
            failed_count: entries.iter().filter(|e| e.is_terminal()).count(),
            last_error: SyncMeta::last_error(tx)?,
            attempts_by_entry: entries
                .iter()
                .map(|e| (e.id.clone(), e.attempts))
                .collect(),
        })
    }

    /// Status derived from the snapshot, given whether a cycle is running.
    ///
    /// Precedence: syncing, error, offline, queued, synced.
    pub fn status(&self, syncing: bool) -> SyncStatus {
        if syncing {
            return SyncStatus::Syncing;
        }
        if self.failed_count > 0 {
            return SyncStatus::Error;
        }
        match &self.last_error {
            Some(err) if !err.transient => return SyncStatus::Error,
            Some(_) => return SyncStatus::Offline,
            None => {}
        }
        if self.pending_count > 0 {
            SyncStatus::Queued(self.pending_count)
        } else {
            SyncStatus::Synced
        }
    }
}

/// Typed accessors over the `sync_meta` table.
pub struct SyncMeta;

impl SyncMeta {
    pub fn watermark(tx: &StoreTx<'_>) -> Result<Option<DateTime<Utc>>> {
        read_ts(tx, WATERMARK_KEY)
    }

    pub fn set_watermark(tx: &StoreTx<'_>, at: DateTime<Utc>) -> Result<()> {
        write_ts(tx, WATERMARK_KEY, at)
    }

    pub fn last_success(tx: &StoreTx<'_>) -> Result<Option<DateTime<Utc>>> {
        read_ts(tx, LAST_SUCCESS_KEY)
    }

    pub fn set_last_success(tx: &StoreTx<'_>, at: DateTime<Utc>) -> Result<()> {
        write_ts(tx, LAST_SUCCESS_KEY, at)
    }

    pub fn last_error(tx: &StoreTx<'_>) -> Result<Option<RecordedError>> {
        tx.meta_get(LAST_ERROR_KEY)?
            .map(|raw| serde_json::from_str(&raw).map_err(Error::from))
            .transpose()
    }

    pub fn record_error(tx: &StoreTx<'_>, err: &RecordedError) -> Result<()> {
        tx.meta_set(LAST_ERROR_KEY, &serde_json::to_string(err)?)
    }

    pub fn clear_error(tx: &StoreTx<'_>) -> Result<()> {
        tx.meta_delete(LAST_ERROR_KEY)
    }
}

fn read_ts(tx: &StoreTx<'_>, key: &str) -> Result<Option<DateTime<Utc>>> {
    tx.meta_get(key)?
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| Error::Storage(format!("corrupt sync meta {key}: {e}")))
        })
        .transpose()
}

fn write_ts(tx: &StoreTx<'_>, key: &str, at: DateTime<Utc>) -> Result<()> {
    tx.meta_set(key, &at.to_rfc3339())
}
