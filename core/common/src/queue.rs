//! Outbound queue entry model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::document::DocumentSnapshot;
use crate::types::DocumentId;

/// Remote operation an entry will perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOp {
    Upsert,
    Delete,
}

impl QueueOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueOp::Upsert => "upsert",
            QueueOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "upsert" => Ok(QueueOp::Upsert),
            "delete" => Ok(QueueOp::Delete),
            other => Err(crate::Error::Validation(format!("unknown queue op {other:?}"))),
        }
    }
}

impl fmt::Display for QueueOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting for (another) attempt.
    Pending,
    /// Terminal-failed: kept for the operator, never retried automatically.
    Failed,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(EntryState::Pending),
            "failed" => Ok(EntryState::Failed),
            other => Err(crate::Error::Validation(format!("unknown entry state {other:?}"))),
        }
    }
}

/// A pending mutation waiting to reach the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Unique id of the entry.
    pub id: String,
    /// Queue position, assigned on first insert and kept across coalescing.
    pub seq: i64,
    pub op: QueueOp,
    pub target_id: DocumentId,
    /// Full document state to send.
    pub payload: DocumentSnapshot,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub state: EntryState,
    /// Bumped every time the payload is replaced.
    pub revision: u64,
}

impl QueueEntry {
    /// Create a new entry that is ready immediately.
    pub fn new(op: QueueOp, payload: DocumentSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            seq: 0,
            op,
            target_id: payload.id(),
            payload,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            created_at: now,
            state: EntryState::Pending,
            revision: 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == EntryState::Failed
    }

    /// Whether an automatic drain may pick this entry up at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == EntryState::Pending && self.next_attempt_at <= now
    }
}
