//! Conflict detection and resolution.
//!
//! Deciding and applying are separate steps. [`ConflictResolver::merge`]
//! looks only at the two snapshots, so every caller gets the same answer
//! for the same input. Fresh ids and timestamps enter in
//! [`ConflictResolver::materialize`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use notesync_common::{DeviceIdentity, DocumentId, DocumentSnapshot};

/// Default suffix appended to a conflict copy's title.
pub const DEFAULT_CONFLICT_SUFFIX: &str = "(Conflict copy)";

/// Suffix appended to a conflict copy's slug.
const CONFLICT_SLUG_SUFFIX: &str = "-conflict-copy";

/// Outcome of comparing a local document with a remote one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Local becomes the remote version.
    Accept(DocumentSnapshot),
    /// Local stays as it is.
    Keep(DocumentSnapshot),
    /// Both edits survive: remote takes the original id, local moves to a
    /// new document.
    ConflictCopy {
        local: DocumentSnapshot,
        remote: DocumentSnapshot,
    },
}

impl Resolution {
    /// Short label for logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::Accept(_) => "accept",
            Resolution::Keep(_) => "keep",
            Resolution::ConflictCopy { .. } => "conflict-copy",
        }
    }
}

/// Writes a resolution turns into.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeWrites {
    /// Snapshot to store under the original id, clean.
    pub original: Option<DocumentSnapshot>,
    /// New dirty document holding the losing local edit.
    pub copy: Option<DocumentSnapshot>,
}

/// Conflict detector and resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolver {
    /// Appended to the title of conflict copies.
    suffix: String,
}

impl ConflictResolver {
    /// Create a new conflict resolver with a title suffix.
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }

    /// Decide how a remote record lands on the local cache.
    ///
    /// - no local copy: accept
    /// - remote not newer: keep
    /// - local clean: accept
    /// - local dirty: conflict copy, except for a local delete, which
    ///   loses to the newer remote edit (there is no content to save)
    pub fn merge(&self, local: Option<&DocumentSnapshot>, remote: &DocumentSnapshot) -> Resolution {
        let Some(local) = local else {
            return Resolution::Accept(remote.clone());
        };

        if remote.updated_at() <= local.updated_at() {
            return Resolution::Keep(local.clone());
        }

        if !local.document.is_dirty() || local.document.is_deleted() {
            return Resolution::Accept(remote.clone());
        }

        Resolution::ConflictCopy {
            local: local.clone(),
            remote: remote.clone(),
        }
    }

    /// Turn a resolution into concrete snapshots.
    ///
    /// `copy_id` is used only for a conflict copy; `identity` stamps it.
    pub fn materialize(
        &self,
        resolution: Resolution,
        now: DateTime<Utc>,
        copy_id: DocumentId,
        identity: &DeviceIdentity,
    ) -> MergeWrites {
        match resolution {
            Resolution::Keep(_) => MergeWrites::default(),
            Resolution::Accept(remote) => MergeWrites {
                original: Some(acknowledged(remote, now)),
                copy: None,
            },
            Resolution::ConflictCopy { local, remote } => MergeWrites {
                original: Some(acknowledged(remote, now)),
                copy: Some(self.conflict_copy(local, now, copy_id, identity)),
            },
        }
    }

    /// Title for a conflict copy of a document titled `title`.
    pub fn copy_title(&self, title: Option<&str>) -> String {
        match title {
            Some(title) if !title.trim().is_empty() => format!("{} {}", title, self.suffix),
            _ => self.suffix.clone(),
        }
    }

    fn conflict_copy(
        &self,
        local: DocumentSnapshot,
        now: DateTime<Utc>,
        copy_id: DocumentId,
        identity: &DeviceIdentity,
    ) -> DocumentSnapshot {
        let DocumentSnapshot { mut document, mut body } = local;

        document.id = copy_id;
        document.title = Some(self.copy_title(document.title.as_deref()));
        document.slug = document
            .slug
            .map(|slug| format!("{slug}{CONFLICT_SLUG_SUFFIX}"));
        document.created_at = now;
        document.updated_at = now;
        document.touch(identity, now);

        body.document_id = copy_id;
        body.updated_at = now;

        DocumentSnapshot::new(document, body)
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CONFLICT_SUFFIX)
    }
}

fn acknowledged(mut remote: DocumentSnapshot, now: DateTime<Utc>) -> DocumentSnapshot {
    remote.document.synced_at = Some(now);
    remote
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use notesync_common::{Document, DocumentBody, DocumentKind, OwnerId};
    use proptest::prelude::*;

    fn identity(client: &str) -> DeviceIdentity {
        DeviceIdentity::new(OwnerId::new("owner").unwrap(), "user", client).unwrap()
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn snapshot(
        id: DocumentId,
        content: &str,
        updated: DateTime<Utc>,
        synced: Option<DateTime<Utc>>,
        client: &str,
    ) -> DocumentSnapshot {
        let mut doc = Document::new(id, DocumentKind::Note, &identity(client), t(0));
        doc.title = Some("Draft".into());
        doc.slug = Some("draft".into());
        doc.updated_at = updated;
        doc.synced_at = synced;
        let body = DocumentBody {
            document_id: id,
            content: content.into(),
            updated_at: updated,
        };
        DocumentSnapshot::new(doc, body)
    }

    #[test]
    fn test_missing_local_accepts() {
        let resolver = ConflictResolver::default();
        let remote = snapshot(DocumentId::new(), "r", t(3), Some(t(3)), "phone");
        assert_eq!(resolver.merge(None, &remote), Resolution::Accept(remote.clone()));
    }

    #[test]
    fn test_clean_local_accepts_newer_remote() {
        let resolver = ConflictResolver::default();
        let id = DocumentId::new();
        let local = snapshot(id, "l", t(2), Some(t(2)), "laptop");
        let remote = snapshot(id, "r", t(3), Some(t(3)), "phone");

        let resolution = resolver.merge(Some(&local), &remote);
        assert_eq!(resolution, Resolution::Accept(remote.clone()));

        let writes = resolver.materialize(resolution, t(10), DocumentId::new(), &identity("laptop"));
        let original = writes.original.unwrap();
        assert_eq!(original.body, remote.body);
        assert_eq!(original.document.synced_at, Some(t(10)));
        assert_eq!(original.document.updated_at, t(3));
        assert!(writes.copy.is_none());
    }

    #[test]
    fn test_older_or_equal_remote_keeps_local() {
        let resolver = ConflictResolver::default();
        let id = DocumentId::new();
        let local = snapshot(id, "l", t(3), None, "laptop");

        for at in [t(1), t(3)] {
            let remote = snapshot(id, "r", at, Some(at), "phone");
            let resolution = resolver.merge(Some(&local), &remote);
            assert_eq!(resolution, Resolution::Keep(local.clone()));
            let writes = resolver.materialize(resolution, t(10), DocumentId::new(), &identity("laptop"));
            assert_eq!(writes, MergeWrites::default());
        }
    }

    #[test]
    fn test_dirty_local_makes_conflict_copy() {
        let resolver = ConflictResolver::default();
        let id = DocumentId::new();
        let local = snapshot(id, "local words", t(2), None, "laptop");
        let remote = snapshot(id, "remote words", t(3), Some(t(3)), "phone");

        let resolution = resolver.merge(Some(&local), &remote);
        assert_eq!(resolution.label(), "conflict-copy");

        let copy_id = DocumentId::new();
        let writes = resolver.materialize(resolution, t(10), copy_id, &identity("laptop"));

        let original = writes.original.unwrap();
        assert_eq!(original.id(), id);
        assert_eq!(original.body.content, "remote words");
        assert_eq!(original.document.synced_at, Some(t(10)));

        let copy = writes.copy.unwrap();
        assert_eq!(copy.id(), copy_id);
        assert_ne!(copy.id(), id);
        assert_eq!(copy.document.title.as_deref(), Some("Draft (Conflict copy)"));
        assert_eq!(copy.document.slug.as_deref(), Some("draft-conflict-copy"));
        assert_eq!(copy.body.content, "local words");
        assert_eq!(copy.body.document_id, copy_id);
        assert!(copy.document.is_dirty());
        assert_eq!(copy.document.client_id.as_deref(), Some("laptop"));
    }

    #[test]
    fn test_dirty_local_delete_loses_to_newer_remote() {
        let resolver = ConflictResolver::default();
        let id = DocumentId::new();
        let mut local = snapshot(id, "l", t(2), None, "laptop");
        local.document.deleted_at = Some(t(2));
        let remote = snapshot(id, "r", t(3), Some(t(3)), "phone");

        assert_eq!(resolver.merge(Some(&local), &remote), Resolution::Accept(remote.clone()));
    }

    #[test]
    fn test_copy_title_without_title() {
        let resolver = ConflictResolver::new("(copy)");
        assert_eq!(resolver.copy_title(None), "(copy)");
        assert_eq!(resolver.copy_title(Some("  ")), "(copy)");
        assert_eq!(resolver.copy_title(Some("Plan")), "Plan (copy)");
    }

    proptest! {
        #[test]
        fn merge_is_deterministic(
            local_at in 0i64..100,
            remote_at in 0i64..100,
            dirty in any::<bool>(),
            has_local in any::<bool>(),
        ) {
            let id = DocumentId::new();
            let synced = if dirty { None } else { Some(t(local_at)) };
            let local = snapshot(id, "local", t(local_at), synced, "laptop");
            let remote = snapshot(id, "remote", t(remote_at), Some(t(remote_at)), "phone");
            let local = has_local.then_some(&local);

            let first = ConflictResolver::default().merge(local, &remote);
            let second = ConflictResolver::default().merge(local, &remote);
            prop_assert_eq!(&first, &second);

            match (&first, local) {
                (Resolution::ConflictCopy { .. }, Some(l)) => {
                    prop_assert!(l.document.is_dirty() && remote_at > local_at);
                }
                (Resolution::Accept(r), _) => prop_assert_eq!(r, &remote),
                (Resolution::Keep(_), Some(_)) => prop_assert!(remote_at <= local_at),
                _ => prop_assert!(false, "unexpected resolution {:?}", first),
            }
        }
    }
}
