//! Durable outbound queue.
//!
//! One entry per target document. Re-enqueuing a target replaces the
//! payload but keeps the entry's place in line, so a burst of edits
//! turns into a single upload. Entries live in the `sync_queue` table and
//! stay there until explicitly acknowledged or discarded.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use notesync_common::{
    DocumentSnapshot, EntryState, Error, QueueEntry, QueueOp, Result,
};
use notesync_storage::{LocalStore, StoreTx};

use crate::retry::BackoffPolicy;

/// What happened to an entry after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Will be tried again at `next_attempt_at`.
    Rescheduled {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Out of the automatic retry path until an operator acts.
    Terminal { attempts: u32 },
    /// The entry was replaced or removed while the attempt was in flight;
    /// the failure applied to a payload that no longer exists.
    Superseded,
}

/// Coalescing durable FIFO keyed by target document.
pub struct SyncQueue {
    store: Arc<LocalStore>,
    backoff: BackoffPolicy,
}

impl SyncQueue {
    /// Create a queue over `store`.
    pub fn new(store: Arc<LocalStore>, backoff: BackoffPolicy) -> Self {
        Self { store, backoff }
    }

    /// Enqueue an operation in its own transaction.
    pub fn enqueue(
        &self,
        op: QueueOp,
        payload: DocumentSnapshot,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry> {
        self.store
            .transaction(|tx| Self::enqueue_in(tx, op, payload, now))
    }

    /// Enqueue inside a caller's transaction.
    ///
    /// If the target already has an entry, its operation and payload are
    /// replaced, its retry bookkeeping is reset (a terminal entry comes
    /// back to pending) and its revision is bumped. `seq` and
    /// `created_at` stay, so the target keeps its place.
    pub fn enqueue_in(
        tx: &StoreTx<'_>,
        op: QueueOp,
        payload: DocumentSnapshot,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry> {
        match tx.queue_by_target(&payload.id())? {
            Some(mut entry) => {
                debug!(
                    "Coalescing {} for {} into entry {} (rev {})",
                    op,
                    entry.target_id,
                    entry.id,
                    entry.revision + 1
                );
                entry.op = op;
                entry.payload = payload;
                entry.attempts = 0;
                entry.last_error = None;
                entry.next_attempt_at = now;
                entry.state = EntryState::Pending;
                entry.revision += 1;
                tx.queue_update(&entry)?;
                Ok(entry)
            }
            None => {
                let mut entry = QueueEntry::new(op, payload, now);
                entry.seq = tx.queue_insert(&entry)?;
                debug!("Queued {} for {} as entry {}", op, entry.target_id, entry.id);
                Ok(entry)
            }
        }
    }

    /// Pending entries due at `now`, oldest first.
    pub fn peek_ready(&self, now: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        self.store.read(|tx| tx.queue_ready(&now))
    }

    /// Get an entry by id.
    pub fn get(&self, entry_id: &str) -> Result<Option<QueueEntry>> {
        self.store.read(|tx| tx.queue_get(entry_id))
    }

    /// Acknowledge a successful attempt.
    ///
    /// Returns `false` and keeps the entry when its revision moved on
    /// while the attempt was in flight.
    pub fn mark_succeeded(&self, entry_id: &str, revision: u64) -> Result<bool> {
        self.store
            .transaction(|tx| Self::complete_in(tx, entry_id, revision))
    }

    /// [`SyncQueue::mark_succeeded`] inside a caller's transaction.
    pub fn complete_in(tx: &StoreTx<'_>, entry_id: &str, revision: u64) -> Result<bool> {
        match tx.queue_get(entry_id)? {
            Some(entry) if entry.revision == revision => tx.queue_delete(entry_id),
            Some(entry) => {
                debug!(
                    "Entry {} moved to rev {} during upload of rev {}; keeping it",
                    entry_id, entry.revision, revision
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Record a failed attempt.
    ///
    /// A rejected payload is terminal at once. Every other error counts
    /// against the budget and reschedules the entry with backoff.
    pub fn mark_failed(
        &self,
        entry_id: &str,
        revision: u64,
        error: &Error,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        self.store.transaction(|tx| {
            let Some(mut entry) = current(tx, entry_id, revision)? else {
                return Ok(FailureOutcome::Superseded);
            };

            let failed_before = entry.attempts;
            entry.attempts += 1;

            if error.rejects_payload() {
                entry.state = EntryState::Failed;
                entry.last_error = Some(error.to_string());
                tx.queue_update(&entry)?;
                warn!("Entry {} failed permanently: {}", entry.id, error);
                return Ok(FailureOutcome::Terminal {
                    attempts: entry.attempts,
                });
            }

            if self.backoff.is_exhausted(entry.attempts) {
                let exhausted = Error::QueueExhausted {
                    entry: entry.id.clone(),
                    attempts: entry.attempts,
                };
                entry.state = EntryState::Failed;
                entry.last_error = Some(format!("{exhausted}: {error}"));
                tx.queue_update(&entry)?;
                warn!("{}; last error: {}", exhausted, error);
                return Ok(FailureOutcome::Terminal {
                    attempts: entry.attempts,
                });
            }

            let delay = self.backoff.delay_for_attempt(failed_before);
            let delay = ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::MAX);
            entry.next_attempt_at = now.checked_add_signed(delay).unwrap_or(now);
            entry.last_error = Some(error.to_string());
            tx.queue_update(&entry)?;
            debug!(
                "Entry {} attempt {} failed, retrying at {}",
                entry.id, entry.attempts, entry.next_attempt_at
            );
            Ok(FailureOutcome::Rescheduled {
                attempts: entry.attempts,
                next_attempt_at: entry.next_attempt_at,
            })
        })
    }

    /// Promote an entry to terminal-failed without counting an attempt.
    pub fn mark_terminal(&self, entry_id: &str, revision: u64, error: &Error) -> Result<FailureOutcome> {
        self.store.transaction(|tx| {
            let Some(mut entry) = current(tx, entry_id, revision)? else {
                return Ok(FailureOutcome::Superseded);
            };
            entry.state = EntryState::Failed;
            entry.last_error = Some(error.to_string());
            tx.queue_update(&entry)?;
            warn!("Entry {} marked terminal: {}", entry.id, error);
            Ok(FailureOutcome::Terminal {
                attempts: entry.attempts,
            })
        })
    }

    /// Move a terminal entry back to pending with a fresh budget.
    ///
    /// Returns `false` if the entry was not terminal.
    ///
    /// # Errors
    /// - `NotFound` if no entry has this id
    pub fn retry_failed(&self, entry_id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.store.transaction(|tx| {
            let mut entry = tx
                .queue_get(entry_id)?
                .ok_or_else(|| Error::NotFound(format!("queue entry {entry_id}")))?;
            if !entry.is_terminal() {
                return Ok(false);
            }
            entry.state = EntryState::Pending;
            entry.attempts = 0;
            entry.next_attempt_at = now;
            tx.queue_update(&entry)?;
            info!("Entry {} for {} requeued by operator", entry.id, entry.target_id);
            Ok(true)
        })
    }

    /// Drop a terminal entry and its payload.
    ///
    /// Returns `false` if the entry was not terminal.
    ///
    /// # Errors
    /// - `NotFound` if no entry has this id
    pub fn discard_failed(&self, entry_id: &str) -> Result<bool> {
        self.store.transaction(|tx| {
            let entry = tx
                .queue_get(entry_id)?
                .ok_or_else(|| Error::NotFound(format!("queue entry {entry_id}")))?;
            if !entry.is_terminal() {
                return Ok(false);
            }
            tx.queue_delete(entry_id)?;
            warn!(
                "Discarded terminal entry {} ({} for {}, {} attempts, last error: {})",
                entry.id,
                entry.op,
                entry.target_id,
                entry.attempts,
                entry.last_error.as_deref().unwrap_or("none")
            );
            Ok(true)
        })
    }

    /// Entries not yet acknowledged by the remote, terminal ones included.
    pub fn pending_count(&self) -> Result<usize> {
        self.store.read(|tx| {
            Ok(tx.queue_count(EntryState::Pending)? + tx.queue_count(EntryState::Failed)?)
        })
    }

    /// Terminal-failed entries.
    pub fn failed_count(&self) -> Result<usize> {
        self.store.read(|tx| tx.queue_count(EntryState::Failed))
    }

    /// All entries in queue order.
    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        self.store.read(|tx| tx.queue_list())
    }
}

/// The entry if it still carries `revision`.
fn current(tx: &StoreTx<'_>, entry_id: &str, revision: u64) -> Result<Option<QueueEntry>> {
    Ok(tx
        .queue_get(entry_id)?
        .filter(|entry| entry.revision == revision))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_common::{DeviceIdentity, Document, DocumentBody, DocumentId, DocumentKind, OwnerId};
    use proptest::prelude::*;
    use std::time::Duration;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new(OwnerId::new("owner").unwrap(), "user", "laptop").unwrap()
    }

    fn setup() -> (Arc<LocalStore>, SyncQueue) {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let queue = SyncQueue::new(store.clone(), BackoffPolicy::default());
        (store, queue)
    }

    /// Store a document and return its snapshot with the given content.
    fn stored(store: &LocalStore, id: DocumentId, content: &str, now: DateTime<Utc>) -> DocumentSnapshot {
        let doc = Document::new(id, DocumentKind::Note, &identity(), now);
        let body = DocumentBody {
            document_id: id,
            content: content.to_string(),
            updated_at: now,
        };
        let snap = DocumentSnapshot::new(doc, body);
        store.transaction(|tx| tx.put_snapshot(&snap)).unwrap();
        snap
    }

    #[test]
    fn test_enqueue_coalesces_per_target() {
        let (store, queue) = setup();
        let now = Utc::now();
        let id = DocumentId::new();

        let first = queue
            .enqueue(QueueOp::Upsert, stored(&store, id, "one", now), now)
            .unwrap();
        let later = now + ChronoDuration::seconds(5);
        let second = queue
            .enqueue(QueueOp::Upsert, stored(&store, id, "two", later), later)
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.seq, second.seq);
        assert_eq!(second.created_at, now);
        assert_eq!(second.revision, 2);

        let entries = queue.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload.body.content, "two");
    }

    #[test]
    fn test_coalescing_keeps_position() {
        let (store, queue) = setup();
        let now = Utc::now();
        let a = DocumentId::new();
        let b = DocumentId::new();

        queue.enqueue(QueueOp::Upsert, stored(&store, a, "a1", now), now).unwrap();
        queue.enqueue(QueueOp::Upsert, stored(&store, b, "b1", now), now).unwrap();
        queue.enqueue(QueueOp::Delete, stored(&store, a, "a2", now), now).unwrap();

        let ready = queue.peek_ready(now).unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].target_id, a);
        assert_eq!(ready[0].op, QueueOp::Delete);
        assert_eq!(ready[1].target_id, b);
    }

    #[test]
    fn test_mark_succeeded_respects_revision() {
        let (store, queue) = setup();
        let now = Utc::now();
        let id = DocumentId::new();

        let entry = queue.enqueue(QueueOp::Upsert, stored(&store, id, "v1", now), now).unwrap();
        // A write lands while revision 1 is uploading.
        queue.enqueue(QueueOp::Upsert, stored(&store, id, "v2", now), now).unwrap();

        assert!(!queue.mark_succeeded(&entry.id, entry.revision).unwrap());
        assert_eq!(queue.pending_count().unwrap(), 1);

        assert!(queue.mark_succeeded(&entry.id, entry.revision + 1).unwrap());
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_transient_failure_reschedules() {
        let (store, queue) = setup();
        let now = Utc::now();
        let entry = queue
            .enqueue(QueueOp::Upsert, stored(&store, DocumentId::new(), "x", now), now)
            .unwrap();

        let outcome = queue
            .mark_failed(&entry.id, entry.revision, &Error::Network("down".into()), now)
            .unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Rescheduled {
                attempts: 1,
                next_attempt_at: now + ChronoDuration::seconds(2),
            }
        );
        assert!(queue.peek_ready(now).unwrap().is_empty());
        assert_eq!(queue.peek_ready(now + ChronoDuration::seconds(2)).unwrap().len(), 1);
    }

    #[test]
    fn test_validation_failure_is_terminal() {
        let (store, queue) = setup();
        let now = Utc::now();
        let entry = queue
            .enqueue(QueueOp::Upsert, stored(&store, DocumentId::new(), "x", now), now)
            .unwrap();

        let outcome = queue
            .mark_failed(&entry.id, entry.revision, &Error::Validation("bad".into()), now)
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Terminal { attempts: 1 });
        assert_eq!(queue.failed_count().unwrap(), 1);
        assert!(queue.peek_ready(now + ChronoDuration::days(1)).unwrap().is_empty());
    }

    #[test]
    fn test_auth_failure_is_an_attempt() {
        let (store, queue) = setup();
        let now = Utc::now();
        let entry = queue
            .enqueue(QueueOp::Upsert, stored(&store, DocumentId::new(), "x", now), now)
            .unwrap();

        let outcome = queue
            .mark_failed(&entry.id, entry.revision, &Error::PermissionDenied("jwt expired".into()), now)
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::Rescheduled { attempts: 1, .. }));
        assert_eq!(queue.failed_count().unwrap(), 0);
    }

    #[test]
    fn test_budget_exhaustion() {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let queue = SyncQueue::new(store.clone(), BackoffPolicy::new(3));
        let mut now = Utc::now();
        let entry = queue
            .enqueue(QueueOp::Upsert, stored(&store, DocumentId::new(), "x", now), now)
            .unwrap();

        let err = Error::Timeout(Duration::from_secs(15));
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(queue.mark_failed(&entry.id, entry.revision, &err, now).unwrap());
            now += ChronoDuration::minutes(10);
        }
        assert_eq!(outcomes[2], FailureOutcome::Terminal { attempts: 3 });

        let kept = queue.get(&entry.id).unwrap().unwrap();
        assert!(kept.is_terminal());
        assert_eq!(kept.payload, entry.payload);
        assert!(kept.last_error.unwrap().contains("failed after 3 attempts"));
    }

    #[test]
    fn test_stale_failure_is_superseded() {
        let (store, queue) = setup();
        let now = Utc::now();
        let id = DocumentId::new();
        let entry = queue.enqueue(QueueOp::Upsert, stored(&store, id, "v1", now), now).unwrap();
        queue.enqueue(QueueOp::Upsert, stored(&store, id, "v2", now), now).unwrap();

        let outcome = queue
            .mark_failed(&entry.id, entry.revision, &Error::Network("x".into()), now)
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Superseded);
        assert_eq!(queue.get(&entry.id).unwrap().unwrap().attempts, 0);
    }

    #[test]
    fn test_operator_actions() {
        let (store, queue) = setup();
        let now = Utc::now();
        let entry = queue
            .enqueue(QueueOp::Upsert, stored(&store, DocumentId::new(), "x", now), now)
            .unwrap();

        // Pending entries are left alone.
        assert!(!queue.retry_failed(&entry.id, now).unwrap());
        assert!(!queue.discard_failed(&entry.id).unwrap());

        queue
            .mark_terminal(&entry.id, entry.revision, &Error::Validation("bad".into()))
            .unwrap();
        assert!(queue.retry_failed(&entry.id, now).unwrap());
        assert_eq!(queue.peek_ready(now).unwrap().len(), 1);

        queue
            .mark_terminal(&entry.id, entry.revision, &Error::Validation("bad".into()))
            .unwrap();
        assert!(queue.discard_failed(&entry.id).unwrap());
        assert!(queue.entries().unwrap().is_empty());

        assert!(matches!(queue.retry_failed("missing", now), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_enqueue_revives_terminal_entry() {
        let (store, queue) = setup();
        let now = Utc::now();
        let id = DocumentId::new();
        let entry = queue.enqueue(QueueOp::Upsert, stored(&store, id, "v1", now), now).unwrap();
        queue
            .mark_failed(&entry.id, entry.revision, &Error::Validation("bad".into()), now)
            .unwrap();

        let revived = queue.enqueue(QueueOp::Upsert, stored(&store, id, "v2", now), now).unwrap();
        assert_eq!(revived.state, EntryState::Pending);
        assert_eq!(revived.attempts, 0);
        assert!(revived.last_error.is_none());
    }

    proptest! {
        #[test]
        fn one_entry_per_target(ops in proptest::collection::vec((0usize..3, any::<bool>()), 1..40)) {
            let (store, queue) = setup();
            let now = Utc::now();
            let ids = [DocumentId::new(), DocumentId::new(), DocumentId::new()];

            for (step, (target, delete)) in ops.iter().enumerate() {
                let op = if *delete { QueueOp::Delete } else { QueueOp::Upsert };
                let snap = stored(&store, ids[*target], &format!("step {step}"), now);
                queue.enqueue(op, snap, now).unwrap();

                let entries = queue.entries().unwrap();
                for id in &ids {
                    prop_assert!(entries.iter().filter(|e| e.target_id == *id).count() <= 1);
                }
            }

            // The last write to each target is what is queued.
            for id in &ids {
                let last = ops.iter().enumerate().rev().find(|(_, (t, _))| ids[*t] == *id);
                let entry = queue.entries().unwrap().into_iter().find(|e| e.target_id == *id);
                match (last, entry) {
                    (Some((step, _)), Some(entry)) => {
                        prop_assert_eq!(entry.payload.body.content, format!("step {step}"));
                    }
                    (None, None) => {}
                    _ => prop_assert!(false, "queue does not match writes"),
                }
            }
        }
    }
}
