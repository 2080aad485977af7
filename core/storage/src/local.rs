//! SQLite-backed local cache.
//!
//! Persists documents, bodies, the outbound queue and sync metadata in
//! four tables so the device works offline and survives restarts.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use notesync_common::{
    Document, DocumentBody, DocumentId, DocumentKind, DocumentSnapshot, EntryState, Error,
    OwnerId, QueueEntry, QueueOp, Result,
};

/// Forward-only schema migrations. Index `i` upgrades version `i` to `i + 1`.
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE documents (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        properties TEXT NOT NULL DEFAULT '{}',
        title TEXT,
        slug TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        archived_at TEXT,
        owner_id TEXT,
        user_id TEXT,
        client_id TEXT,
        synced_at TEXT
    );

    CREATE TABLE document_bodies (
        document_id TEXT PRIMARY KEY REFERENCES documents(id),
        content TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE sync_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        op TEXT NOT NULL,
        target_id TEXT NOT NULL UNIQUE REFERENCES documents(id),
        payload TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        next_attempt_at TEXT NOT NULL,
        created_at TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'pending',
        revision INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE sync_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    "#,
    r#"
    CREATE INDEX idx_documents_updated ON documents(updated_at);
    CREATE INDEX idx_documents_dirty ON documents(synced_at) WHERE synced_at IS NULL;
    CREATE INDEX idx_queue_ready ON sync_queue(state, next_attempt_at);
    "#,
];

/// Schema version this build writes.
pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

const DOCUMENT_COLUMNS: &str = "id, type, properties, title, slug, created_at, updated_at, \
     deleted_at, archived_at, owner_id, user_id, client_id, synced_at";

const QUEUE_COLUMNS: &str = "seq, id, op, target_id, payload, attempts, last_error, \
     next_attempt_at, created_at, state, revision";

pub(crate) fn db_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

/// Fixed-width RFC 3339 so text comparison in SQL matches time order.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("invalid timestamp {s:?}: {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Local cache manager using SQLite.
///
/// All access goes through one connection; [`LocalStore::transaction`]
/// gives callers an atomic read-modify-write section.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Create or open a local store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    /// - The file was written by a newer schema version
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(db_err)?;
        migrate(&mut conn)?;
        info!("Local store opened (schema v{})", SCHEMA_VERSION);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Schema version recorded in the database.
    pub fn schema_version(&self) -> Result<u32> {
        let conn = self.lock();
        user_version(&conn)
    }

    /// Run `f` inside a transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn transaction<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let out = f(&StoreTx { conn: &tx })?;
        tx.commit().map_err(db_err)?;
        Ok(out)
    }

    /// Run a read-only closure.
    pub fn read<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&StoreTx { conn: &conn })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A panic mid-transaction rolls the transaction back, so the
        // connection itself is still consistent.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn user_version(conn: &Connection) -> Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get::<_, u32>(0))
        .map_err(db_err)
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let current = user_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(Error::Schema(format!(
            "database schema v{current} is newer than supported v{SCHEMA_VERSION}"
        )));
    }

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let next = index as u32 + 1;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql)
            .map_err(|e| Error::Schema(format!("migration to v{next} failed: {e}")))?;
        tx.pragma_update(None, "user_version", next).map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        info!("Migrated local store to schema v{}", next);
    }
    Ok(())
}

/// Typed row operations available inside a store transaction.
pub struct StoreTx<'a> {
    conn: &'a Connection,
}

impl StoreTx<'_> {
    // ---- documents ----

    /// Get a document by id.
    pub fn get_document(&self, id: &DocumentId) -> Result<Option<Document>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
                [id.to_string()],
                DocumentRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(DocumentRow::into_document).transpose()
    }

    /// Insert or replace a document row.
    pub fn put_document(&self, doc: &Document) -> Result<()> {
        debug!("Storing document {}", doc.id);
        self.conn
            .execute(
                r#"
                INSERT INTO documents
                (id, type, properties, title, slug, created_at, updated_at,
                 deleted_at, archived_at, owner_id, user_id, client_id, synced_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(id) DO UPDATE SET
                    type = excluded.type,
                    properties = excluded.properties,
                    title = excluded.title,
                    slug = excluded.slug,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    deleted_at = excluded.deleted_at,
                    archived_at = excluded.archived_at,
                    owner_id = excluded.owner_id,
                    user_id = excluded.user_id,
                    client_id = excluded.client_id,
                    synced_at = excluded.synced_at
                "#,
                params![
                    doc.id.to_string(),
                    doc.kind.type_name(),
                    doc.kind.properties().to_string(),
                    doc.title,
                    doc.slug,
                    format_ts(&doc.created_at),
                    format_ts(&doc.updated_at),
                    doc.deleted_at.as_ref().map(format_ts),
                    doc.archived_at.as_ref().map(format_ts),
                    doc.owner_id.as_ref().map(|o| o.as_str().to_string()),
                    doc.user_id,
                    doc.client_id,
                    doc.synced_at.as_ref().map(format_ts),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// List documents, most recently updated first.
    pub fn list_documents(&self, include_deleted: bool) -> Result<Vec<Document>> {
        let filter = if include_deleted {
            ""
        } else {
            "WHERE deleted_at IS NULL"
        };
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents {filter} ORDER BY updated_at DESC, id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], DocumentRow::from_row)
            .map_err(db_err)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row.map_err(db_err)?.into_document()?);
        }
        Ok(docs)
    }

    /// Number of documents with unacknowledged local changes.
    pub fn count_dirty(&self) -> Result<usize> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE synced_at IS NULL",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(db_err)
    }

    // ---- bodies ----

    /// Get the body of a document.
    pub fn get_body(&self, id: &DocumentId) -> Result<Option<DocumentBody>> {
        let raw = self
            .conn
            .query_row(
                "SELECT content, updated_at FROM document_bodies WHERE document_id = ?1",
                [id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(db_err)?;

        raw.map(|(content, updated_at)| {
            Ok(DocumentBody {
                document_id: *id,
                content,
                updated_at: parse_ts(&updated_at)?,
            })
        })
        .transpose()
    }

    /// Insert or replace a body. The owning document must exist.
    pub fn put_body(&self, body: &DocumentBody) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO document_bodies (document_id, content, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(document_id) DO UPDATE SET
                    content = excluded.content,
                    updated_at = excluded.updated_at
                "#,
                params![
                    body.document_id.to_string(),
                    body.content,
                    format_ts(&body.updated_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Document plus body. A missing body reads as empty.
    pub fn get_snapshot(&self, id: &DocumentId) -> Result<Option<DocumentSnapshot>> {
        let Some(document) = self.get_document(id)? else {
            return Ok(None);
        };
        let body = match self.get_body(id)? {
            Some(body) => body,
            None => DocumentBody::empty(*id, document.updated_at),
        };
        Ok(Some(DocumentSnapshot::new(document, body)))
    }

    /// Store a document and its body together.
    pub fn put_snapshot(&self, snapshot: &DocumentSnapshot) -> Result<()> {
        if snapshot.body.document_id != snapshot.document.id {
            return Err(Error::Validation(format!(
                "body for {} attached to document {}",
                snapshot.body.document_id, snapshot.document.id
            )));
        }
        self.put_document(&snapshot.document)?;
        self.put_body(&snapshot.body)
    }

    // ---- queue ----

    /// The entry targeting a document, if any.
    pub fn queue_by_target(&self, target: &DocumentId) -> Result<Option<QueueEntry>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE target_id = ?1"),
                [target.to_string()],
                QueueRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(QueueRow::into_entry).transpose()
    }

    /// Get an entry by id.
    pub fn queue_get(&self, entry_id: &str) -> Result<Option<QueueEntry>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE id = ?1"),
                [entry_id],
                QueueRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(QueueRow::into_entry).transpose()
    }

    /// Append a new entry and return its assigned position.
    pub fn queue_insert(&self, entry: &QueueEntry) -> Result<i64> {
        let payload = serde_json::to_string(&entry.payload)?;
        self.conn
            .execute(
                r#"
                INSERT INTO sync_queue
                (id, op, target_id, payload, attempts, last_error,
                 next_attempt_at, created_at, state, revision)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    entry.id,
                    entry.op.as_str(),
                    entry.target_id.to_string(),
                    payload,
                    entry.attempts,
                    entry.last_error,
                    format_ts(&entry.next_attempt_at),
                    format_ts(&entry.created_at),
                    entry.state.as_str(),
                    entry.revision as i64,
                ],
            )
            .map_err(db_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Rewrite an existing entry in place. Its position never changes.
    pub fn queue_update(&self, entry: &QueueEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        let changed = self
            .conn
            .execute(
                r#"
                UPDATE sync_queue SET
                    op = ?2, payload = ?3, attempts = ?4, last_error = ?5,
                    next_attempt_at = ?6, state = ?7, revision = ?8
                WHERE id = ?1
                "#,
                params![
                    entry.id,
                    entry.op.as_str(),
                    payload,
                    entry.attempts,
                    entry.last_error,
                    format_ts(&entry.next_attempt_at),
                    entry.state.as_str(),
                    entry.revision as i64,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("queue entry {}", entry.id)));
        }
        Ok(())
    }

    /// Remove an entry. Returns whether it existed.
    pub fn queue_delete(&self, entry_id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM sync_queue WHERE id = ?1", [entry_id])
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    /// All entries in queue order.
    pub fn queue_list(&self) -> Result<Vec<QueueEntry>> {
        self.query_queue(
            &format!("SELECT {QUEUE_COLUMNS} FROM sync_queue ORDER BY seq"),
            params![],
        )
    }

    /// Pending entries due at or before `now`, in queue order.
    pub fn queue_ready(&self, now: &DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        self.query_queue(
            &format!(
                "SELECT {QUEUE_COLUMNS} FROM sync_queue \
                 WHERE state = 'pending' AND next_attempt_at <= ?1 ORDER BY seq"
            ),
            [format_ts(now)],
        )
    }

    /// Number of entries in a given state.
    pub fn queue_count(&self, state: EntryState) -> Result<usize> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE state = ?1",
                [state.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(db_err)
    }

    fn query_queue<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<QueueEntry>> {
        let mut stmt = self.conn.prepare(sql).map_err(db_err)?;
        let rows = stmt.query_map(params, QueueRow::from_row).map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(db_err)?.into_entry()?);
        }
        Ok(entries)
    }

    // ---- meta ----

    /// Get a sync metadata value.
    pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM sync_meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)
    }

    /// Set a sync metadata value.
    pub fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Remove a sync metadata value.
    pub fn meta_delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sync_meta WHERE key = ?1", [key])
            .map_err(db_err)?;
        Ok(())
    }

    /// Drop every row from all four tables.
    pub fn clear_all(&self) -> Result<()> {
        info!("Clearing local store");
        self.conn
            .execute_batch(
                "DELETE FROM sync_queue; DELETE FROM document_bodies; \
                 DELETE FROM documents; DELETE FROM sync_meta;",
            )
            .map_err(db_err)
    }
}

/// Raw `documents` row before validation.
struct DocumentRow {
    id: String,
    type_name: String,
    properties: String,
    title: Option<String>,
    slug: Option<String>,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
    archived_at: Option<String>,
    owner_id: Option<String>,
    user_id: Option<String>,
    client_id: Option<String>,
    synced_at: Option<String>,
}

impl DocumentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            type_name: row.get(1)?,
            properties: row.get(2)?,
            title: row.get(3)?,
            slug: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            deleted_at: row.get(7)?,
            archived_at: row.get(8)?,
            owner_id: row.get(9)?,
            user_id: row.get(10)?,
            client_id: row.get(11)?,
            synced_at: row.get(12)?,
        })
    }

    fn into_document(self) -> Result<Document> {
        let properties: serde_json::Value = serde_json::from_str(&self.properties)?;
        Ok(Document {
            id: DocumentId::parse(&self.id)?,
            kind: DocumentKind::from_parts(&self.type_name, &properties)?,
            title: self.title,
            slug: self.slug,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            deleted_at: parse_opt_ts(self.deleted_at)?,
            archived_at: parse_opt_ts(self.archived_at)?,
            owner_id: self.owner_id.map(OwnerId::new).transpose()?,
            user_id: self.user_id,
            client_id: self.client_id,
            synced_at: parse_opt_ts(self.synced_at)?,
        })
    }
}

/// Raw `sync_queue` row before validation.
struct QueueRow {
    seq: i64,
    id: String,
    op: String,
    target_id: String,
    payload: String,
    attempts: u32,
    last_error: Option<String>,
    next_attempt_at: String,
    created_at: String,
    state: String,
    revision: i64,
}

impl QueueRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            op: row.get(2)?,
            target_id: row.get(3)?,
            payload: row.get(4)?,
            attempts: row.get(5)?,
            last_error: row.get(6)?,
            next_attempt_at: row.get(7)?,
            created_at: row.get(8)?,
            state: row.get(9)?,
            revision: row.get(10)?,
        })
    }

    fn into_entry(self) -> Result<QueueEntry> {
        Ok(QueueEntry {
            id: self.id,
            seq: self.seq,
            op: QueueOp::parse(&self.op)?,
            target_id: DocumentId::parse(&self.target_id)?,
            payload: serde_json::from_str(&self.payload)?,
            attempts: self.attempts,
            last_error: self.last_error,
            next_attempt_at: parse_ts(&self.next_attempt_at)?,
            created_at: parse_ts(&self.created_at)?,
            state: EntryState::parse(&self.state)?,
            revision: self.revision as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use notesync_common::DeviceIdentity;
    use tempfile::TempDir;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new(OwnerId::new("owner").unwrap(), "user", "laptop").unwrap()
    }

    fn snapshot(now: DateTime<Utc>) -> DocumentSnapshot {
        let mut doc = Document::new(DocumentId::new(), DocumentKind::Note, &identity(), now);
        doc.title = Some("Draft".to_string());
        let body = DocumentBody {
            document_id: doc.id,
            content: "hello".to_string(),
            updated_at: now,
        };
        DocumentSnapshot::new(doc, body)
    }

    #[test]
    fn test_store_creation_runs_migrations() {
        let store = LocalStore::in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let store = LocalStore::in_memory().unwrap();
        let snap = snapshot(Utc::now());

        store.transaction(|tx| tx.put_snapshot(&snap)).unwrap();
        let loaded = store.read(|tx| tx.get_snapshot(&snap.id())).unwrap().unwrap();

        assert_eq!(loaded, snap);
    }

    #[test]
    fn test_missing_document() {
        let store = LocalStore::in_memory().unwrap();
        let id = DocumentId::new();
        assert!(store.read(|tx| tx.get_document(&id)).unwrap().is_none());
        assert!(store.read(|tx| tx.get_snapshot(&id)).unwrap().is_none());
    }

    #[test]
    fn test_list_excludes_deleted() {
        let store = LocalStore::in_memory().unwrap();
        let now = Utc::now();
        let live = snapshot(now);
        let mut gone = snapshot(now);
        gone.document.deleted_at = Some(now);

        store
            .transaction(|tx| {
                tx.put_snapshot(&live)?;
                tx.put_snapshot(&gone)
            })
            .unwrap();

        let visible = store.read(|tx| tx.list_documents(false)).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, live.id());

        let all = store.read(|tx| tx.list_documents(true)).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.read(|tx| tx.count_dirty()).unwrap(), 2);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let store = LocalStore::in_memory().unwrap();
        let snap = snapshot(Utc::now());

        let result: Result<()> = store.transaction(|tx| {
            tx.put_snapshot(&snap)?;
            Err(Error::Validation("abort".into()))
        });
        assert!(result.is_err());
        assert!(store.read(|tx| tx.get_document(&snap.id())).unwrap().is_none());
    }

    #[test]
    fn test_queue_one_entry_per_target() {
        let store = LocalStore::in_memory().unwrap();
        let now = Utc::now();
        let snap = snapshot(now);
        store.transaction(|tx| tx.put_snapshot(&snap)).unwrap();

        let first = QueueEntry::new(QueueOp::Upsert, snap.clone(), now);
        let seq = store.transaction(|tx| tx.queue_insert(&first)).unwrap();
        assert!(seq > 0);

        let dup = QueueEntry::new(QueueOp::Upsert, snap.clone(), now);
        assert!(store.transaction(|tx| tx.queue_insert(&dup)).is_err());

        let loaded = store
            .read(|tx| tx.queue_by_target(&snap.id()))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, first.id);
        assert_eq!(loaded.seq, seq);
        assert_eq!(loaded.payload, snap);
    }

    #[test]
    fn test_queue_ready_filters_and_orders() {
        let store = LocalStore::in_memory().unwrap();
        let now = Utc::now();
        let a = snapshot(now);
        let b = snapshot(now);
        let c = snapshot(now);

        store
            .transaction(|tx| {
                for snap in [&a, &b, &c] {
                    tx.put_snapshot(snap)?;
                }
                let mut later = QueueEntry::new(QueueOp::Upsert, a.clone(), now);
                later.next_attempt_at = now + Duration::seconds(30);
                tx.queue_insert(&later)?;
                tx.queue_insert(&QueueEntry::new(QueueOp::Upsert, b.clone(), now))?;
                let mut failed = QueueEntry::new(QueueOp::Delete, c.clone(), now);
                failed.state = EntryState::Failed;
                tx.queue_insert(&failed)?;
                Ok(())
            })
            .unwrap();

        let ready = store.read(|tx| tx.queue_ready(&now)).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].target_id, b.id());

        let later = store
            .read(|tx| tx.queue_ready(&(now + Duration::seconds(31))))
            .unwrap();
        let targets: Vec<_> = later.iter().map(|e| e.target_id).collect();
        assert_eq!(targets, vec![a.id(), b.id()]);

        assert_eq!(store.read(|tx| tx.queue_count(EntryState::Pending)).unwrap(), 2);
        assert_eq!(store.read(|tx| tx.queue_count(EntryState::Failed)).unwrap(), 1);
    }

    #[test]
    fn test_meta_roundtrip() {
        let store = LocalStore::in_memory().unwrap();
        store.transaction(|tx| tx.meta_set("watermark", "x")).unwrap();
        assert_eq!(
            store.read(|tx| tx.meta_get("watermark")).unwrap().as_deref(),
            Some("x")
        );
        store.transaction(|tx| tx.meta_delete("watermark")).unwrap();
        assert!(store.read(|tx| tx.meta_get("watermark")).unwrap().is_none());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("notes.db");
        let snap = snapshot(Utc::now());

        {
            let store = LocalStore::open(&path).unwrap();
            store
                .transaction(|tx| {
                    tx.put_snapshot(&snap)?;
                    tx.queue_insert(&QueueEntry::new(QueueOp::Upsert, snap.clone(), snap.updated_at()))
                })
                .unwrap();
        }

        {
            let store = LocalStore::open(&path).unwrap();
            assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
            assert_eq!(store.read(|tx| tx.queue_list()).unwrap().len(), 1);
            assert!(store.read(|tx| tx.get_document(&snap.id())).unwrap().is_some());
        }
    }

    #[test]
    fn test_refuses_newer_schema() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("future.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
                .unwrap();
        }
        assert!(matches!(LocalStore::open(&path), Err(Error::Schema(_))));
    }

    #[test]
    fn test_clear_all() {
        let store = LocalStore::in_memory().unwrap();
        let snap = snapshot(Utc::now());
        store
            .transaction(|tx| {
                tx.put_snapshot(&snap)?;
                tx.queue_insert(&QueueEntry::new(QueueOp::Upsert, snap.clone(), snap.updated_at()))?;
                tx.meta_set("k", "v")
            })
            .unwrap();

        store.transaction(|tx| tx.clear_all()).unwrap();
        assert!(store.read(|tx| tx.list_documents(true)).unwrap().is_empty());
        assert!(store.read(|tx| tx.queue_list()).unwrap().is_empty());
        assert!(store.read(|tx| tx.meta_get("k")).unwrap().is_none());
    }
}
