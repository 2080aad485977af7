//! In-memory remote store for testing and offline demos.
//!
//! A backend can be saved to and loaded from a JSON file, which lets
//! several local configs on one machine share a remote.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use notesync_common::{Document, DocumentBody, DocumentId, Error, OwnerId, Result};

use crate::remote::{ChangeCursor, ChangePage, OwnerSession, RemoteDocumentRow, RemoteStore};

/// Injected failure behavior.
#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    denied: bool,
    fail_next: u32,
    latency: Option<Duration>,
}

/// Shared in-memory "server".
///
/// Rows are partitioned by owner. Clients get a [`MemoryRemote`] handle
/// bound to one partition through [`MemoryBackend::connect`]. Several
/// handles on one backend simulate several devices.
#[derive(Default)]
pub struct MemoryBackend {
    partitions: RwLock<HashMap<OwnerId, HashMap<String, RemoteDocumentRow>>>,
    faults: Mutex<Faults>,
    upserts: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Load a backend saved with [`MemoryBackend::save`]. A missing file
    /// gives an empty backend.
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - `Serialization` if it is not a saved backend
    /// - `Validation` if a row has a blank owner
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let backend = Self::default();
        let raw = match fs::read_to_string(path.as_ref()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Arc::new(backend)),
            Err(e) => return Err(e.into()),
        };
        let rows: Vec<RemoteDocumentRow> = serde_json::from_str(&raw)?;
        for row in rows {
            let owner = OwnerId::new(row.owner_id.clone())?;
            backend.insert_raw(&owner, row);
        }
        Ok(Arc::new(backend))
    }

    /// Write every row to `path`, replacing the file in one rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut rows: Vec<RemoteDocumentRow> = self
            .partitions_ref()
            .values()
            .flat_map(|rows| rows.values().cloned())
            .collect();
        rows.sort_by_key(RemoteDocumentRow::cursor);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_string_pretty(&rows)?)?;
        fs::rename(&staging, path)?;
        Ok(())
    }

    /// Open a handle scoped to the session's owner.
    pub fn connect(self: &Arc<Self>, session: OwnerSession) -> MemoryRemote {
        MemoryRemote {
            backend: Arc::clone(self),
            owner: session.owner_id,
        }
    }

    /// Make every call fail with a network error until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.faults().offline = offline;
    }

    /// Refuse every call as unauthorized, like an expired session.
    pub fn set_denied(&self, denied: bool) {
        self.faults().denied = denied;
    }

    /// Fail the next `n` calls with a network error.
    pub fn fail_next(&self, n: u32) {
        self.faults().fail_next = n;
    }

    /// Delay every call, simulating a slow link.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults().latency = latency;
    }

    /// Number of successful upserts served.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Number of successful deletes served.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Write a row directly, bypassing validation. Lets tests play the
    /// part of another device or of a misbehaving server.
    pub fn insert_raw(&self, owner: &OwnerId, row: RemoteDocumentRow) {
        self.partitions_mut()
            .entry(owner.clone())
            .or_default()
            .insert(row.id.clone(), row);
    }

    /// Read a row directly.
    pub fn get_raw(&self, owner: &OwnerId, id: &str) -> Option<RemoteDocumentRow> {
        self.partitions_ref()
            .get(owner)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// Number of rows stored for an owner.
    pub fn row_count(&self, owner: &OwnerId) -> usize {
        self.partitions_ref().get(owner).map_or(0, |rows| rows.len())
    }

    async fn simulate_link(&self) -> Result<()> {
        let latency = {
            let mut faults = self.faults();
            if faults.offline {
                return Err(Error::Network("remote unreachable (offline)".to_string()));
            }
            if faults.denied {
                return Err(Error::PermissionDenied("session expired".to_string()));
            }
            if faults.fail_next > 0 {
                faults.fail_next -= 1;
                return Err(Error::Network("simulated connection reset".to_string()));
            }
            faults.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn partitions_ref(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<OwnerId, HashMap<String, RemoteDocumentRow>>> {
        self.partitions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn partitions_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<OwnerId, HashMap<String, RemoteDocumentRow>>> {
        self.partitions.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owner-scoped handle onto a [`MemoryBackend`].
pub struct MemoryRemote {
    backend: Arc<MemoryBackend>,
    owner: OwnerId,
}

impl MemoryRemote {
    /// The backend this handle talks to.
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    fn owner(&self) -> &OwnerId {
        &self.owner
    }

    async fn upsert(&self, document: &Document, body: &DocumentBody) -> Result<()> {
        let row = RemoteDocumentRow::for_upload(&self.owner, document, body)?;
        self.backend.simulate_link().await?;

        self.backend
            .partitions_mut()
            .entry(self.owner.clone())
            .or_default()
            .insert(row.id.clone(), row);
        self.backend.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_changed_since(
        &self,
        since: Option<DateTime<Utc>>,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> Result<ChangePage> {
        self.backend.simulate_link().await?;

        let partitions = self.backend.partitions_ref();
        let Some(rows) = partitions.get(&self.owner) else {
            return Ok(ChangePage::default());
        };

        let mut changed: Vec<&RemoteDocumentRow> = rows
            .values()
            .filter(|row| since.map_or(true, |since| row.updated_at > since))
            .filter(|row| after.map_or(true, |after| &row.cursor() > after))
            .collect();
        changed.sort_by_key(|row| row.cursor());

        let limit = limit.max(1);
        let has_more = changed.len() > limit;
        let page: Vec<RemoteDocumentRow> = changed.into_iter().take(limit).cloned().collect();
        let next = if has_more {
            page.last().map(RemoteDocumentRow::cursor)
        } else {
            None
        };

        Ok(ChangePage { rows: page, next })
    }

    async fn delete(&self, id: &DocumentId, deleted_at: DateTime<Utc>) -> Result<()> {
        self.backend.simulate_link().await?;

        let mut partitions = self.backend.partitions_mut();
        if let Some(row) = partitions
            .get_mut(&self.owner)
            .and_then(|rows| rows.get_mut(&id.to_string()))
        {
            if row.deleted_at.is_none() {
                row.deleted_at = Some(deleted_at);
                row.updated_at = row.updated_at.max(deleted_at);
            }
        }
        self.backend.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
