//! Document model shared by the local cache, the queue and the remote.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeviceIdentity, DocumentId, OwnerId};

/// Type-specific part of a document.
///
/// Serialized with a `type` tag so every layer agrees on the shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentKind {
    /// Free-form note.
    Note,
    /// Daily journal page.
    Journal { entry_date: NaiveDate },
    /// Actionable item.
    Task {
        #[serde(default)]
        done: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        due_at: Option<DateTime<Utc>>,
    },
}

impl DocumentKind {
    /// Name stored in the `type` column.
    pub fn type_name(&self) -> &'static str {
        match self {
            DocumentKind::Note => "note",
            DocumentKind::Journal { .. } => "journal",
            DocumentKind::Task { .. } => "task",
        }
    }

    /// Rebuild a kind from its `type` column and the JSON properties blob.
    ///
    /// # Errors
    /// - Returns `Validation` for unknown types or malformed properties
    pub fn from_parts(type_name: &str, properties: &serde_json::Value) -> crate::Result<Self> {
        let mut tagged = match properties {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(crate::Error::Validation(format!(
                    "properties for {type_name} must be an object, got {other}"
                )))
            }
        };
        tagged.insert("type".to_string(), serde_json::Value::from(type_name));
        serde_json::from_value(serde_json::Value::Object(tagged))
            .map_err(|e| crate::Error::Validation(format!("invalid {type_name} document: {e}")))
    }

    /// Type-specific fields without the tag, for the `properties` column.
    pub fn properties(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("type");
                serde_json::Value::Object(map)
            }
            _ => serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

impl Default for DocumentKind {
    fn default() -> Self {
        DocumentKind::Note
    }
}

/// Metadata row for a note.
///
/// `synced_at == None` marks the document dirty: it carries local
/// changes the remote has not acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    #[serde(flatten)]
    pub kind: DocumentKind,
    pub title: Option<String>,
    pub slug: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub owner_id: Option<OwnerId>,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl Document {
    /// Create a fresh, dirty document written by `identity`.
    pub fn new(id: DocumentId, kind: DocumentKind, identity: &DeviceIdentity, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            title: None,
            slug: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            archived_at: None,
            owner_id: Some(identity.owner_id.clone()),
            user_id: Some(identity.user_id.clone()),
            client_id: Some(identity.client_id.clone()),
            synced_at: None,
        }
    }

    /// Whether the document has unacknowledged local changes.
    pub fn is_dirty(&self) -> bool {
        self.synced_at.is_none()
    }

    /// Whether the document has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Record a local mutation: bump `updated_at` without ever moving it
    /// backwards, mark dirty and re-stamp the writer.
    pub fn touch(&mut self, identity: &DeviceIdentity, now: DateTime<Utc>) {
        self.updated_at = now.max(self.updated_at);
        self.synced_at = None;
        self.owner_id = Some(identity.owner_id.clone());
        self.user_id = Some(identity.user_id.clone());
        self.client_id = Some(identity.client_id.clone());
    }

    /// Apply the metadata half of a patch.
    pub fn apply_patch(&mut self, patch: &DocumentPatch, now: DateTime<Utc>) {
        if let Some(title) = &patch.title {
            self.title = Some(title.clone());
        }
        if let Some(slug) = &patch.slug {
            self.slug = Some(slug.clone());
        }
        if let Some(kind) = &patch.kind {
            self.kind = kind.clone();
        }
        match patch.archived {
            Some(true) if self.archived_at.is_none() => self.archived_at = Some(now),
            Some(false) => self.archived_at = None,
            _ => {}
        }
    }
}

/// Content of a document. Each document owns exactly one body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentBody {
    pub document_id: DocumentId,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

impl DocumentBody {
    /// Empty body for a new document.
    pub fn empty(document_id: DocumentId, now: DateTime<Utc>) -> Self {
        Self {
            document_id,
            content: String::new(),
            updated_at: now,
        }
    }
}

/// A document together with its body.
///
/// This is the unit that gets queued, uploaded, fetched and merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub document: Document,
    pub body: DocumentBody,
}

impl DocumentSnapshot {
    pub fn new(document: Document, body: DocumentBody) -> Self {
        Self { document, body }
    }

    pub fn id(&self) -> DocumentId {
        self.document.id
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.document.updated_at
    }
}

/// A set of changes to apply to a document.
///
/// Unset fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<DocumentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl DocumentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn kind(mut self, kind: DocumentKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }
}
