//! Sync manager that owns the local cache and orchestrates sync.
//!
//! Every mutation of local state goes through here. Local writes are
//! synchronous SQLite transactions and never wait on the network. Drain
//! and poll are async and take a per-document lock around each item, so
//! one document never has two network operations or merges in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use notesync_common::{
    Clock, DeviceIdentity, Document, DocumentBody, DocumentId, DocumentPatch, DocumentSnapshot,
    EntryState, Error, QueueEntry, QueueOp, Result, SystemClock,
};
use notesync_storage::{ChangeCursor, LocalStore, RemoteDocumentRow, RemoteStore, StoreTx};

use crate::conflict::{ConflictResolver, Resolution, DEFAULT_CONFLICT_SUFFIX};
use crate::locks::KeyedLocks;
use crate::queue::{FailureOutcome, SyncQueue};
use crate::retry::BackoffPolicy;
use crate::state::{RecordedError, SyncMeta, SyncMetaSnapshot, SyncStatus};

/// Configuration for the sync manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Time between scheduled cycles.
    pub poll_interval: Duration,
    /// Deadline for each remote call.
    pub request_timeout: Duration,
    /// Rows requested per page when polling.
    pub page_size: usize,
    /// Retry schedule for failed uploads.
    pub backoff: BackoffPolicy,
    /// Appended to the title of conflict copies.
    pub conflict_suffix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(15),
            page_size: 200,
            backoff: BackoffPolicy::default(),
            conflict_suffix: DEFAULT_CONFLICT_SUFFIX.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_conflict_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.conflict_suffix = suffix.into();
        self
    }
}

/// Result of one pass over the outbound queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub uploaded: usize,
    pub deleted: usize,
    /// Transient failures scheduled for another attempt.
    pub rescheduled: usize,
    /// Entries that became terminal-failed.
    pub terminal: usize,
    /// Attempts whose entry was replaced while in flight.
    pub superseded: usize,
    /// The pass ended before every ready entry was tried.
    pub stopped_early: bool,
}

impl DrainReport {
    fn is_clean(&self) -> bool {
        self.rescheduled == 0 && self.terminal == 0
    }

    fn absorb(&mut self, other: DrainReport) {
        self.uploaded += other.uploaded;
        self.deleted += other.deleted;
        self.rescheduled += other.rescheduled;
        self.terminal += other.terminal;
        self.superseded += other.superseded;
        self.stopped_early |= other.stopped_early;
    }
}

/// Result of one incremental pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub fetched: usize,
    pub accepted: usize,
    pub kept: usize,
    pub conflicts: usize,
    /// Rows that could not be applied; they are fetched again next time.
    pub failed: usize,
    pub pages: usize,
    /// Watermark after the pull.
    pub watermark: Option<DateTime<Utc>>,
    /// Set when a fetch failed and the pull stopped.
    pub aborted: Option<String>,
}

impl PollReport {
    fn is_clean(&self) -> bool {
        self.failed == 0 && self.aborted.is_none()
    }

    fn absorb(&mut self, other: PollReport) {
        self.fetched += other.fetched;
        self.accepted += other.accepted;
        self.kept += other.kept;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
        self.pages += other.pages;
        self.watermark = other.watermark.or(self.watermark);
        self.aborted = other.aborted;
    }
}

/// Result of a drain-then-poll cycle, including reruns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub drain: DrainReport,
    pub poll: PollReport,
    /// Passes run; more than one when triggers arrived mid-cycle.
    pub passes: usize,
    pub duration: Duration,
}

/// What a cycle trigger did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// This caller ran the cycle.
    Completed(CycleReport),
    /// A cycle was already running; it will run once more.
    Coalesced,
}

/// Request to wipe the local cache, produced by [`SyncManager::plan_reset`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetRequest {
    pub pending_entries: usize,
    pub failed_entries: usize,
    pub dirty_documents: usize,
    /// Discard unsynchronized data.
    pub force: bool,
    pub planned_at: DateTime<Utc>,
}

impl ResetRequest {
    /// Whether the reset would drop local changes.
    pub fn is_lossy(&self) -> bool {
        self.pending_entries + self.failed_entries + self.dirty_documents > 0
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// What a reset removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub documents: usize,
    pub discarded_entries: usize,
    pub discarded_dirty: usize,
}

#[derive(Debug, Default)]
struct GateState {
    running: bool,
    rerun: bool,
}

/// Admits one cycle at a time; late triggers leave a rerun request.
#[derive(Debug, Default)]
struct CycleGate {
    state: Mutex<GateState>,
}

impl CycleGate {
    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the gate. When busy, optionally leave a rerun request.
    fn try_enter(&self, request_rerun: bool) -> bool {
        let mut state = self.lock();
        if state.running {
            state.rerun |= request_rerun;
            return false;
        }
        state.running = true;
        true
    }

    /// Consume a pending rerun request, or leave the gate.
    fn rerun_or_leave(&self) -> bool {
        let mut state = self.lock();
        if state.rerun {
            state.rerun = false;
            return true;
        }
        state.running = false;
        false
    }

    /// Leave unconditionally. Returns whether a rerun was pending.
    fn leave(&self) -> bool {
        let mut state = self.lock();
        state.running = false;
        std::mem::take(&mut state.rerun)
    }

    fn is_running(&self) -> bool {
        self.lock().running
    }
}

/// Leaves the gate on drop unless disarmed, so a cancelled or failed
/// cycle does not wedge it. A pending rerun is handed to the scheduler.
struct GateGuard<'a> {
    gate: &'a CycleGate,
    wake: &'a Notify,
    armed: bool,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.gate.leave() {
            self.wake.notify_one();
        }
    }
}

/// Main sync manager.
pub struct SyncManager {
    store: Arc<LocalStore>,
    queue: SyncQueue,
    remote: Arc<dyn RemoteStore>,
    resolver: ConflictResolver,
    identity: DeviceIdentity,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    locks: KeyedLocks,
    gate: CycleGate,
    wake: Notify,
    cancel: CancellationToken,
}

impl SyncManager {
    /// Create a new sync manager.
    ///
    /// # Errors
    /// - `Validation` if the identity's owner differs from the remote
    ///   session's owner, or `page_size` is zero
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        identity: DeviceIdentity,
        config: SyncConfig,
    ) -> Result<Self> {
        if &identity.owner_id != remote.owner() {
            return Err(Error::Validation(format!(
                "device owner {} does not match remote session owner {}",
                identity.owner_id,
                remote.owner()
            )));
        }
        if config.page_size == 0 {
            return Err(Error::Validation("page_size must be at least 1".into()));
        }

        info!(
            "Sync manager ready (remote: {}, client: {})",
            remote.name(),
            identity.client_id
        );

        Ok(Self {
            queue: SyncQueue::new(store.clone(), config.backoff.clone()),
            resolver: ConflictResolver::new(config.conflict_suffix.clone()),
            store,
            remote,
            identity,
            clock: Arc::new(SystemClock),
            config,
            locks: KeyedLocks::new(),
            gate: CycleGate::default(),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Get the device identity.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Token that stops cycles between items when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop any running cycle at the next item boundary.
    pub fn shutdown(&self) {
        info!("Sync manager shutting down");
        self.cancel.cancel();
    }

    /// Ask the scheduler for a cycle soon.
    pub fn nudge(&self) {
        self.wake.notify_one();
    }

    /// Resolves on the next [`SyncManager::nudge`].
    pub async fn nudged(&self) {
        self.wake.notified().await;
    }

    // ---- local mutations ----

    /// Apply a patch to a document, creating it if needed, and queue the
    /// upload.
    ///
    /// Runs in one local transaction and never touches the network.
    ///
    /// # Errors
    /// - `NotFound` if the document is soft-deleted
    /// - `Storage` if the local transaction fails
    pub fn write(&self, id: DocumentId, patch: DocumentPatch) -> Result<Document> {
        let now = self.clock.now();

        let document = self.store.transaction(|tx| {
            let mut snapshot = match tx.get_snapshot(&id)? {
                Some(existing) if existing.document.is_deleted() => {
                    return Err(Error::NotFound(format!("document {id} is deleted")));
                }
                Some(existing) => existing,
                None => {
                    let kind = patch.kind.clone().unwrap_or_default();
                    DocumentSnapshot::new(
                        Document::new(id, kind, &self.identity, now),
                        DocumentBody::empty(id, now),
                    )
                }
            };

            snapshot.document.apply_patch(&patch, now);
            snapshot.document.touch(&self.identity, now);
            if let Some(content) = &patch.content {
                snapshot.body.content = content.clone();
                snapshot.body.updated_at = snapshot.document.updated_at;
            }

            tx.put_snapshot(&snapshot)?;
            SyncQueue::enqueue_in(tx, QueueOp::Upsert, snapshot.clone(), now)?;
            Ok(snapshot.document)
        })?;

        debug!("Wrote document {} (updated {})", id, document.updated_at);
        self.nudge();
        Ok(document)
    }

    /// Soft-delete a document and queue the remote delete.
    ///
    /// Deleting an already deleted document is a no-op.
    ///
    /// # Errors
    /// - `NotFound` if the document does not exist
    pub fn delete(&self, id: DocumentId) -> Result<Document> {
        let now = self.clock.now();

        let (document, queued) = self.store.transaction(|tx| {
            let mut snapshot = tx
                .get_snapshot(&id)?
                .ok_or_else(|| Error::NotFound(format!("document {id}")))?;
            if snapshot.document.is_deleted() {
                return Ok((snapshot.document, false));
            }

            snapshot.document.touch(&self.identity, now);
            snapshot.document.deleted_at = Some(snapshot.document.updated_at);
            tx.put_document(&snapshot.document)?;
            SyncQueue::enqueue_in(tx, QueueOp::Delete, snapshot.clone(), now)?;
            Ok((snapshot.document, true))
        })?;

        if queued {
            debug!("Deleted document {}", id);
            self.nudge();
        }
        Ok(document)
    }

    // ---- sync cycle ----

    /// Run drain then poll, repeating while triggers arrive mid-cycle.
    ///
    /// Remote failures are recorded in sync metadata, not returned.
    ///
    /// # Errors
    /// - Local storage failures
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        if !self.gate.try_enter(true) {
            debug!("Sync cycle already running; rerun requested");
            return Ok(CycleOutcome::Coalesced);
        }
        let mut guard = GateGuard {
            gate: &self.gate,
            wake: &self.wake,
            armed: true,
        };

        let start = Instant::now();
        let mut report = CycleReport::default();
        info!("Starting sync cycle");

        loop {
            report.passes += 1;
            report.drain.absorb(self.drain_queue().await?);
            report.poll.absorb(self.poll_remote().await?);

            if self.cancel.is_cancelled() {
                info!("Sync cycle cancelled");
                break;
            }
            if !self.gate.rerun_or_leave() {
                guard.armed = false;
                break;
            }
            debug!("Trigger arrived during cycle; running again");
        }
        drop(guard);

        if report.drain.is_clean() && report.poll.is_clean() && !self.cancel.is_cancelled() {
            let now = self.clock.now();
            self.store.transaction(|tx| {
                SyncMeta::clear_error(tx)?;
                SyncMeta::set_last_success(tx, now)
            })?;
        }

        report.duration = start.elapsed();
        info!(
            "Sync cycle completed in {:?}: {} uploaded, {} deleted, {} fetched, {} conflicts, {} failed",
            report.duration,
            report.drain.uploaded,
            report.drain.deleted,
            report.poll.fetched,
            report.poll.conflicts,
            report.drain.rescheduled + report.drain.terminal + report.poll.failed
        );
        Ok(CycleOutcome::Completed(report))
    }

    /// Run a cycle now, outside the timer.
    pub async fn sync_now(&self) -> Result<CycleOutcome> {
        info!("Manual sync requested");
        self.run_cycle().await
    }

    /// Push ready queue entries to the remote, oldest first.
    ///
    /// A rejected payload goes terminal and the pass moves on. Any other
    /// failure counts as an attempt and ends the pass: the link or the
    /// session is broken, and the remaining entries keep their schedule.
    pub async fn drain_queue(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let ready = self.queue.peek_ready(self.clock.now())?;
        if ready.is_empty() {
            return Ok(report);
        }
        debug!("Draining {} ready entries", ready.len());

        for candidate in ready {
            if self.cancel.is_cancelled() {
                report.stopped_early = true;
                break;
            }

            let _guard = self.locks.lock(candidate.target_id).await;
            let Some(entry) = self.queue.get(&candidate.id)? else {
                continue;
            };
            if !entry.is_ready(self.clock.now()) {
                continue;
            }

            let sent_at = self.clock.now();
            match self.push(&entry, sent_at).await {
                Ok(()) => {
                    if self.acknowledge(&entry, sent_at)? {
                        match entry.op {
                            QueueOp::Upsert => report.uploaded += 1,
                            QueueOp::Delete => report.deleted += 1,
                        }
                    } else {
                        report.superseded += 1;
                    }
                }
                Err(err) => {
                    self.record_error(&err)?;
                    let outcome = if err.rejects_payload() {
                        self.queue.mark_terminal(&entry.id, entry.revision, &err)?
                    } else {
                        self.queue
                            .mark_failed(&entry.id, entry.revision, &err, self.clock.now())?
                    };

                    match outcome {
                        FailureOutcome::Rescheduled { attempts, next_attempt_at } => {
                            warn!(
                                "Failed to {} {} (attempt {}): {}. Retrying at {}",
                                entry.op, entry.target_id, attempts, err, next_attempt_at
                            );
                            report.rescheduled += 1;
                        }
                        FailureOutcome::Terminal { attempts } => {
                            error!(
                                "Giving up on {} {} after {} attempts: {}",
                                entry.op, entry.target_id, attempts, err
                            );
                            report.terminal += 1;
                        }
                        FailureOutcome::Superseded => report.superseded += 1,
                    }

                    if !err.rejects_payload() {
                        report.stopped_early = true;
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Send one entry. The payload goes out stamped with `sent_at`.
    async fn push(&self, entry: &QueueEntry, sent_at: DateTime<Utc>) -> Result<()> {
        let mut document = entry.payload.document.clone();
        document.synced_at = Some(sent_at);

        match entry.op {
            QueueOp::Upsert => {
                self.remote_call(self.remote.upsert(&document, &entry.payload.body))
                    .await
            }
            QueueOp::Delete => {
                let deleted_at = document.deleted_at.unwrap_or(document.updated_at);
                self.remote_call(self.remote.delete(&document.id, deleted_at))
                    .await
            }
        }
    }

    /// Drop an acknowledged entry and mark its document clean, unless a
    /// newer local write replaced it meanwhile.
    fn acknowledge(&self, entry: &QueueEntry, sent_at: DateTime<Utc>) -> Result<bool> {
        self.store.transaction(|tx| {
            if !SyncQueue::complete_in(tx, &entry.id, entry.revision)? {
                return Ok(false);
            }
            if let Some(mut document) = tx.get_document(&entry.target_id)? {
                if document.is_dirty() && document.updated_at == entry.payload.updated_at() {
                    document.synced_at = Some(sent_at);
                    tx.put_document(&document)?;
                }
            }
            Ok(true)
        })
    }

    /// Pull remote changes newer than the watermark and merge them.
    ///
    /// The watermark only advances past rows that were applied. A row
    /// that fails holds it just below that row's `updated_at`; a failed
    /// fetch leaves it where it was.
    pub async fn poll_remote(&self) -> Result<PollReport> {
        let since = self.store.read(|tx| SyncMeta::watermark(tx))?;
        let mut report = PollReport {
            watermark: since,
            ..PollReport::default()
        };

        let mut applied: Vec<DateTime<Utc>> = Vec::new();
        let mut blocker: Option<DateTime<Utc>> = None;
        let mut after: Option<ChangeCursor> = None;

        'pages: loop {
            let page = match self
                .remote_call(self.remote.fetch_changed_since(
                    since,
                    after.as_ref(),
                    self.config.page_size,
                ))
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!("Failed to fetch remote changes: {}", err);
                    self.record_error(&err)?;
                    report.aborted = Some(err.to_string());
                    return Ok(report);
                }
            };
            report.pages += 1;

            for row in page.rows {
                if self.cancel.is_cancelled() {
                    blocker = Some(blocker.map_or(row.updated_at, |b| b.min(row.updated_at)));
                    break 'pages;
                }

                report.fetched += 1;
                let updated_at = row.updated_at;
                let row_id = row.id.clone();
                match self.apply_remote(row).await {
                    Ok(resolution) => {
                        debug!("Applied remote document {}: {}", row_id, resolution.label());
                        match resolution {
                            Resolution::Accept(_) => report.accepted += 1,
                            Resolution::Keep(_) => report.kept += 1,
                            Resolution::ConflictCopy { .. } => report.conflicts += 1,
                        }
                        applied.push(updated_at);
                    }
                    Err(err) => {
                        warn!("Failed to apply remote document {}: {}", row_id, err);
                        self.record_error(&err)?;
                        report.failed += 1;
                        blocker = Some(blocker.map_or(updated_at, |b| b.min(updated_at)));
                    }
                }
            }

            match page.next {
                Some(next) if after.as_ref().map_or(true, |prev| &next > prev) => {
                    after = Some(next);
                }
                Some(next) => {
                    warn!("Remote returned a non-advancing cursor {:?}; stopping", next);
                    break;
                }
                None => break,
            }
        }

        let reached = applied
            .into_iter()
            .filter(|ts| blocker.map_or(true, |b| *ts < b))
            .max();
        if let Some(reached) = reached {
            if since.map_or(true, |since| reached > since) {
                self.store
                    .transaction(|tx| SyncMeta::set_watermark(tx, reached))?;
                report.watermark = Some(reached);
            }
        }

        debug!(
            "Poll finished: {} fetched, {} accepted, {} conflicts, {} failed",
            report.fetched, report.accepted, report.conflicts, report.failed
        );
        Ok(report)
    }

    /// Validate one remote row and merge it into the local cache.
    async fn apply_remote(&self, row: RemoteDocumentRow) -> Result<Resolution> {
        let remote = row.into_snapshot()?;
        if remote.document.owner_id.as_ref() != Some(self.remote.owner()) {
            return Err(Error::Validation(format!(
                "remote document {} belongs to another owner",
                remote.id()
            )));
        }

        let id = remote.id();
        let _guard = self.locks.lock(id).await;
        let now = self.clock.now();

        self.store.transaction(|tx| {
            let local = tx.get_snapshot(&id)?;
            let resolution = self.resolver.merge(local.as_ref(), &remote);
            let writes = self.resolver.materialize(
                resolution.clone(),
                now,
                DocumentId::new(),
                &self.identity,
            );

            if let Some(original) = &writes.original {
                drop_superseded_entry(tx, &id)?;
                tx.put_snapshot(original)?;
            }
            if let Some(copy) = writes.copy {
                info!(
                    "Conflict on {}: remote kept, local edit moved to {}",
                    id,
                    copy.id()
                );
                tx.put_snapshot(&copy)?;
                SyncQueue::enqueue_in(tx, QueueOp::Upsert, copy, now)?;
            }
            Ok(resolution)
        })
    }

    async fn remote_call<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.request_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit)),
        }
    }

    fn record_error(&self, err: &Error) -> Result<()> {
        let recorded = RecordedError::from_error(err, self.clock.now());
        self.store
            .transaction(|tx| SyncMeta::record_error(tx, &recorded))
    }

    // ---- status ----

    /// Current sync progress.
    pub fn sync_meta(&self) -> Result<SyncMetaSnapshot> {
        self.store.read(|tx| SyncMetaSnapshot::load(tx))
    }

    /// Status for display.
    pub fn status(&self) -> Result<SyncStatus> {
        Ok(self.sync_meta()?.status(self.gate.is_running()))
    }

    // ---- reset ----

    /// Describe what a local cache reset would discard.
    pub fn plan_reset(&self) -> Result<ResetRequest> {
        let planned_at = self.clock.now();
        self.store.read(|tx| {
            let (pending_entries, failed_entries, dirty_documents) = unsynced_counts(tx)?;
            Ok(ResetRequest {
                pending_entries,
                failed_entries,
                dirty_documents,
                force: false,
                planned_at,
            })
        })
    }

    /// Wipe documents, bodies, queue and metadata.
    ///
    /// The next poll then pulls everything again.
    ///
    /// # Errors
    /// - `ResetRefused` while a cycle runs, or when unsynchronized data
    ///   exists and the request is not forced
    pub fn reset_local_cache(&self, request: ResetRequest) -> Result<ResetReport> {
        if !self.gate.try_enter(false) {
            return Err(Error::ResetRefused("a sync cycle is running".into()));
        }
        let _guard = GateGuard {
            gate: &self.gate,
            wake: &self.wake,
            armed: true,
        };

        let report = self.store.transaction(|tx| {
            let (pending, failed, dirty) = unsynced_counts(tx)?;
            if pending + failed + dirty > 0 && !request.force {
                return Err(Error::ResetRefused(format!(
                    "{} queued entries and {} unsynced documents would be lost",
                    pending + failed,
                    dirty
                )));
            }
            let documents = tx.list_documents(true)?.len();
            tx.clear_all()?;
            Ok(ResetReport {
                documents,
                discarded_entries: pending + failed,
                discarded_dirty: dirty,
            })
        })?;

        if report.discarded_entries + report.discarded_dirty > 0 {
            warn!(
                "Local cache reset discarded {} queued entries and {} unsynced documents",
                report.discarded_entries, report.discarded_dirty
            );
        }
        info!(
            "Local cache reset: {} documents cleared, next poll pulls everything",
            report.documents
        );
        Ok(report)
    }

    // ---- operator actions ----

    /// Put a terminal-failed entry back on the automatic path.
    pub fn retry_failed(&self, entry_id: &str) -> Result<bool> {
        let revived = self.queue.retry_failed(entry_id, self.clock.now())?;
        if revived {
            self.nudge();
        }
        Ok(revived)
    }

    /// Drop a terminal-failed entry.
    pub fn discard_failed(&self, entry_id: &str) -> Result<bool> {
        self.queue.discard_failed(entry_id)
    }

    // ---- reads ----

    pub fn document(&self, id: &DocumentId) -> Result<Option<Document>> {
        self.store.read(|tx| tx.get_document(id))
    }

    pub fn body(&self, id: &DocumentId) -> Result<Option<DocumentBody>> {
        self.store.read(|tx| tx.get_body(id))
    }

    /// Documents, most recently updated first.
    pub fn documents(&self, include_deleted: bool) -> Result<Vec<Document>> {
        self.store.read(|tx| tx.list_documents(include_deleted))
    }

    pub fn queue_entries(&self) -> Result<Vec<QueueEntry>> {
        self.queue.entries()
    }
}

/// Remove the queue entry of a document that is about to be overwritten
/// with remote state; its payload would otherwise clobber the remote.
fn drop_superseded_entry(tx: &StoreTx<'_>, id: &DocumentId) -> Result<()> {
    if let Some(entry) = tx.queue_by_target(id)? {
        tx.queue_delete(&entry.id)?;
        info!(
            "Dropped queued {} for {} superseded by newer remote state",
            entry.op, id
        );
    }
    Ok(())
}

fn unsynced_counts(tx: &StoreTx<'_>) -> Result<(usize, usize, usize)> {
    Ok((
        tx.queue_count(EntryState::Pending)?,
        tx.queue_count(EntryState::Failed)?,
        tx.count_dirty()?,
    ))
}
