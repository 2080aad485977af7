//! Remote store trait definition and wire format.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use notesync_common::{
    Document, DocumentBody, DocumentId, DocumentKind, DocumentSnapshot, Error, OwnerId, Result,
};

/// Authenticated session a remote adapter is bound to.
///
/// Adapters are constructed from a session and never accept an owner
/// argument afterwards, so one adapter cannot reach another owner's rows.
#[derive(Debug, Clone)]
pub struct OwnerSession {
    pub owner_id: OwnerId,
    /// Bearer token for the remote API, if it needs one.
    pub access_token: Option<String>,
}

impl OwnerSession {
    pub fn new(owner_id: OwnerId) -> Self {
        Self {
            owner_id,
            access_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

/// A `documents` row as the remote stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocumentRow {
    pub id: String,
    pub owner_id: String,
    pub user_id: String,
    pub client_id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub properties: serde_json::Value,
    pub title: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
    /// Embedded `document_bodies` row.
    #[serde(default, rename = "document_bodies", skip_serializing_if = "Option::is_none")]
    pub body: Option<RemoteBodyRow>,
}

/// A `document_bodies` row, keyed by document id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBodyRow {
    pub document_id: String,
    pub owner_id: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

impl RemoteDocumentRow {
    /// Build the wire row for an upload, rejecting anything incomplete.
    ///
    /// # Preconditions
    /// - `owner_id`, `user_id`, `client_id` and `synced_at` are populated
    /// - `owner_id` equals the session owner
    /// - `body` belongs to `document`
    ///
    /// # Errors
    /// - `Validation` naming the first violated precondition. Nothing that
    ///   fails here may be transmitted.
    pub fn for_upload(
        session_owner: &OwnerId,
        document: &Document,
        body: &DocumentBody,
    ) -> Result<Self> {
        if document.id.as_uuid().is_nil() {
            return Err(Error::Validation("document id is the nil UUID".into()));
        }
        let owner = document
            .owner_id
            .as_ref()
            .ok_or_else(|| missing(document.id, "owner_id"))?;
        if owner != session_owner {
            return Err(Error::Validation(format!(
                "document {} belongs to another owner",
                document.id
            )));
        }
        let user_id = non_blank(document.user_id.as_deref()).ok_or_else(|| missing(document.id, "user_id"))?;
        let client_id =
            non_blank(document.client_id.as_deref()).ok_or_else(|| missing(document.id, "client_id"))?;
        let synced_at = document
            .synced_at
            .ok_or_else(|| missing(document.id, "synced_at"))?;
        if body.document_id != document.id {
            return Err(Error::Validation(format!(
                "body for {} attached to document {}",
                body.document_id, document.id
            )));
        }

        Ok(Self {
            id: document.id.to_string(),
            owner_id: owner.as_str().to_string(),
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
            type_name: document.kind.type_name().to_string(),
            properties: document.kind.properties(),
            title: document.title.clone(),
            slug: document.slug.clone(),
            created_at: document.created_at,
            updated_at: document.updated_at,
            deleted_at: document.deleted_at,
            archived_at: document.archived_at,
            synced_at: Some(synced_at),
            body: Some(RemoteBodyRow {
                document_id: document.id.to_string(),
                owner_id: owner.as_str().to_string(),
                content: body.content.clone(),
                updated_at: body.updated_at,
            }),
        })
    }

    /// Validate a fetched row and turn it into a local snapshot.
    ///
    /// A row without a body gets an empty one stamped with the
    /// document's `updated_at`.
    pub fn into_snapshot(self) -> Result<DocumentSnapshot> {
        let id = DocumentId::parse(&self.id)?;
        let kind = DocumentKind::from_parts(&self.type_name, &self.properties)?;
        let body = match self.body {
            Some(body) => {
                if DocumentId::parse(&body.document_id)? != id {
                    return Err(Error::Validation(format!(
                        "remote body {} attached to document {}",
                        body.document_id, id
                    )));
                }
                DocumentBody {
                    document_id: id,
                    content: body.content,
                    updated_at: body.updated_at,
                }
            }
            None => DocumentBody::empty(id, self.updated_at),
        };

        let document = Document {
            id,
            kind,
            title: self.title,
            slug: self.slug,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            archived_at: self.archived_at,
            owner_id: Some(OwnerId::new(self.owner_id)?),
            user_id: Some(self.user_id),
            client_id: Some(self.client_id),
            synced_at: self.synced_at,
        };
        Ok(DocumentSnapshot::new(document, body))
    }

    /// Position of this row in `(updated_at, id)` order.
    pub fn cursor(&self) -> ChangeCursor {
        ChangeCursor {
            updated_at: self.updated_at,
            id: self.id.clone(),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn missing(id: DocumentId, field: &str) -> Error {
    Error::Validation(format!("document {id} is missing {field}"))
}

/// Keyset position for paging through changes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeCursor {
    pub updated_at: DateTime<Utc>,
    pub id: String,
}

/// One page of changed rows, ascending by `(updated_at, id)`.
#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub rows: Vec<RemoteDocumentRow>,
    /// Where the next page starts; `None` when this was the last page.
    pub next: Option<ChangeCursor>,
}

/// Remote store trait for different backends.
///
/// Every operation is scoped to the owner of the session the adapter was
/// built with. Implementations must not retry internally; the outbound
/// queue owns retry policy.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Adapter name (e.g., "memory", "http").
    fn name(&self) -> &str;

    /// Owner every call is scoped to.
    fn owner(&self) -> &OwnerId;

    /// Create or replace a document and its body.
    ///
    /// # Errors
    /// - `Validation` if the input fails [`RemoteDocumentRow::for_upload`];
    ///   nothing is sent in that case
    /// - `Network`/`Timeout` for transport failures
    async fn upsert(&self, document: &Document, body: &DocumentBody) -> Result<()>;

    /// Rows with `updated_at > since`, strictly after `after`, oldest first.
    async fn fetch_changed_since(
        &self,
        since: Option<DateTime<Utc>>,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> Result<ChangePage>;

    /// Soft-delete a document remotely.
    ///
    /// Idempotent: deleting a missing or already deleted row succeeds.
    async fn delete(&self, id: &DocumentId, deleted_at: DateTime<Utc>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_common::DeviceIdentity;

    fn owner() -> OwnerId {
        OwnerId::new("owner-a").unwrap()
    }

    fn synced_snapshot() -> DocumentSnapshot {
        let identity = DeviceIdentity::new(owner(), "user", "laptop").unwrap();
        let now = Utc::now();
        let mut doc = Document::new(DocumentId::new(), DocumentKind::Note, &identity, now);
        doc.title = Some("Draft".into());
        doc.synced_at = Some(now);
        let body = DocumentBody {
            document_id: doc.id,
            content: "text".into(),
            updated_at: now,
        };
        DocumentSnapshot::new(doc, body)
    }

    #[test]
    fn test_for_upload_accepts_complete_document() {
        let snap = synced_snapshot();
        let row = RemoteDocumentRow::for_upload(&owner(), &snap.document, &snap.body).unwrap();
        assert_eq!(row.id, snap.id().to_string());
        assert_eq!(row.type_name, "note");
        assert_eq!(row.body.as_ref().unwrap().content, "text");
    }

    #[test]
    fn test_for_upload_rejects_missing_fields() {
        let snap = synced_snapshot();

        let mut doc = snap.document.clone();
        doc.synced_at = None;
        assert!(matches!(
            RemoteDocumentRow::for_upload(&owner(), &doc, &snap.body),
            Err(Error::Validation(_))
        ));

        let mut doc = snap.document.clone();
        doc.client_id = Some("  ".into());
        assert!(matches!(
            RemoteDocumentRow::for_upload(&owner(), &doc, &snap.body),
            Err(Error::Validation(_))
        ));

        let mut doc = snap.document.clone();
        doc.owner_id = None;
        assert!(matches!(
            RemoteDocumentRow::for_upload(&owner(), &doc, &snap.body),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_for_upload_rejects_foreign_owner() {
        let snap = synced_snapshot();
        let other = OwnerId::new("owner-b").unwrap();
        assert!(matches!(
            RemoteDocumentRow::for_upload(&other, &snap.document, &snap.body),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_for_upload_rejects_mismatched_body() {
        let snap = synced_snapshot();
        let stray = DocumentBody::empty(DocumentId::new(), Utc::now());
        assert!(RemoteDocumentRow::for_upload(&owner(), &snap.document, &stray).is_err());
    }

    #[test]
    fn test_row_roundtrips_to_snapshot() {
        let snap = synced_snapshot();
        let row = RemoteDocumentRow::for_upload(&owner(), &snap.document, &snap.body).unwrap();
        let back = row.into_snapshot().unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn test_into_snapshot_rejects_bad_id() {
        let snap = synced_snapshot();
        let mut row = RemoteDocumentRow::for_upload(&owner(), &snap.document, &snap.body).unwrap();
        row.id = "definitely-not-a-uuid".into();
        assert!(matches!(row.into_snapshot(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_into_snapshot_without_body() {
        let snap = synced_snapshot();
        let mut row = RemoteDocumentRow::for_upload(&owner(), &snap.document, &snap.body).unwrap();
        row.body = None;
        let back = row.into_snapshot().unwrap();
        assert!(back.body.content.is_empty());
        assert_eq!(back.body.updated_at, snap.updated_at());
    }

    #[test]
    fn test_row_json_uses_column_names() {
        let snap = synced_snapshot();
        let row = RemoteDocumentRow::for_upload(&owner(), &snap.document, &snap.body).unwrap();
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["type"], "note");
        assert!(json["document_bodies"].is_object());
        assert_eq!(json["owner_id"], "owner-a");
    }
}
