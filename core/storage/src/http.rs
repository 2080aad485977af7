//! PostgREST-style HTTP remote store.
//!
//! Talks to a REST endpoint exposing `documents` and `document_bodies`
//! tables (Supabase layout). Every table request is filtered by the
//! session owner; row-level security on the server is expected to enforce
//! the same rule.
//!
//! Uploads go through one `upsert_document(document, body)` function so
//! the server writes the row and its body in a single transaction:
//!
//! ```sql
//! create function upsert_document(document jsonb, body jsonb) returns void
//! language sql as $$
//!   insert into documents select * from jsonb_populate_record(null::documents, document)
//!     on conflict (id) do update set ... ;
//!   insert into document_bodies select * from jsonb_populate_record(null::document_bodies, body)
//!     on conflict (document_id) do update set ... ;
//! $$;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{header, Client, Method, RequestBuilder, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use notesync_common::{Document, DocumentBody, DocumentId, Error, OwnerId, Result};

use crate::remote::{
    ChangeCursor, ChangePage, OwnerSession, RemoteBodyRow, RemoteDocumentRow, RemoteStore,
};

/// REST path prefix under the project URL.
const REST_PREFIX: &str = "rest/v1/";

/// Server function that writes a document and its body atomically.
const UPSERT_FUNCTION: &str = "rpc/upsert_document";

/// Columns fetched for change polling, with the body embedded.
const SELECT_WITH_BODY: &str = "*,document_bodies(*)";

/// HTTP remote store.
pub struct HttpRemoteStore {
    http: Client,
    base: Url,
    api_key: String,
    session: OwnerSession,
    timeout: Duration,
}

impl HttpRemoteStore {
    /// Create a new client bound to `session`.
    ///
    /// # Errors
    /// - `Validation` if `base_url` does not parse
    /// - `Network` if the HTTP client cannot be built
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        session: OwnerSession,
        timeout: Duration,
    ) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| Error::Validation(format!("invalid remote url {base_url:?}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(concat!("notesync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            api_key: api_key.into(),
            session,
            timeout,
        })
    }

    fn table_url(&self, table: &str) -> Result<Url> {
        self.base
            .join(REST_PREFIX)
            .and_then(|url| url.join(table))
            .map_err(|e| Error::Validation(format!("invalid table url for {table}: {e}")))
    }

    fn authorized(&self, method: Method, url: Url) -> RequestBuilder {
        let token = self
            .session
            .access_token
            .as_deref()
            .unwrap_or(self.api_key.as_str());
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(token)
    }

    /// Table request filtered to the session owner.
    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.authorized(method, url)
            .query(&[("owner_id", owner_filter(&self.session.owner_id))])
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.timeout)
            } else {
                Error::Network(format!("Failed to {}: {}", what, e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn name(&self) -> &str {
        "http"
    }

    fn owner(&self) -> &OwnerId {
        &self.session.owner_id
    }

    async fn upsert(&self, document: &Document, body: &DocumentBody) -> Result<()> {
        let mut row = RemoteDocumentRow::for_upload(&self.session.owner_id, document, body)?;
        let body_row = row.body.take();

        debug!("Uploading document {}", row.id);
        let url = self.table_url(UPSERT_FUNCTION)?;
        let request = self
            .authorized(Method::POST, url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&UpsertCall {
                document: &row,
                body: body_row.as_ref(),
            });
        self.send(request, "upsert document").await?;
        Ok(())
    }

    async fn fetch_changed_since(
        &self,
        since: Option<DateTime<Utc>>,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> Result<ChangePage> {
        let limit = limit.max(1);
        let url = self.table_url("documents")?;
        let request = self
            .request(Method::GET, url)
            .query(&[
                ("select", SELECT_WITH_BODY.to_string()),
                ("order", "updated_at.asc,id.asc".to_string()),
                ("limit", limit.to_string()),
            ])
            .query(&change_filters(since, after));

        let response = self.send(request, "fetch changes").await?;
        let rows: Vec<RemoteDocumentRow> = response
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))?;

        let next = if rows.len() >= limit {
            rows.last().map(RemoteDocumentRow::cursor)
        } else {
            None
        };
        Ok(ChangePage { rows, next })
    }

    async fn delete(&self, id: &DocumentId, deleted_at: DateTime<Utc>) -> Result<()> {
        let url = self.table_url("documents")?;
        let at = format_ts(&deleted_at);
        let request = self
            .request(Method::PATCH, url)
            .query(&[
                ("id", format!("eq.{id}")),
                ("deleted_at", "is.null".to_string()),
            ])
            .header("Prefer", "return=minimal")
            .json(&serde_json::json!({ "deleted_at": at, "updated_at": at }));

        // Zero matched rows is success: the row is already gone or deleted.
        self.send(request, "delete document").await?;
        Ok(())
    }
}

/// Arguments of the upsert function.
#[derive(Serialize)]
struct UpsertCall<'a> {
    document: &'a RemoteDocumentRow,
    body: Option<&'a RemoteBodyRow>,
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn owner_filter(owner: &OwnerId) -> String {
    format!("eq.{}", owner.as_str())
}

/// Query filters selecting rows after the watermark and the page cursor.
fn change_filters(
    since: Option<DateTime<Utc>>,
    after: Option<&ChangeCursor>,
) -> Vec<(&'static str, String)> {
    let mut filters = Vec::new();
    if let Some(since) = since {
        filters.push(("updated_at", format!("gt.{}", format_ts(&since))));
    }
    if let Some(after) = after {
        let at = format_ts(&after.updated_at);
        filters.push((
            "or",
            format!("(updated_at.gt.{at},and(updated_at.eq.{at},id.gt.{}))", after.id),
        ));
    }
    filters
}

/// Map a non-success status onto the error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::PermissionDenied(format!("{status}: {body}"))
        }
        StatusCode::NOT_FOUND => Error::NotFound(format!("{status}: {body}")),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Error::Network(format!("API error: {} - {}", status, body))
        }
        s if s.is_server_error() => Error::Network(format!("API error: {} - {}", status, body)),
        _ => Error::Validation(format!("remote rejected request: {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{StatusCode as StubStatus, Uri};
    use axum::Router;
    use chrono::TimeZone;
    use notesync_common::{DeviceIdentity, DocumentKind};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(String, String)>>>;

    /// Serve every request with `status` and record what arrived.
    async fn stub_server(status: u16) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let recorded = seen.clone();
        let app = Router::new().fallback(move |method: axum::http::Method, uri: Uri, body: String| {
            let recorded = recorded.clone();
            async move {
                let target = match uri.query() {
                    Some(query) => format!("{method} {}?{query}", uri.path()),
                    None => format!("{method} {}", uri.path()),
                };
                recorded.lock().unwrap().push((target, body));
                StubStatus::from_u16(status).unwrap()
            }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    fn synced_note() -> (Document, DocumentBody) {
        let owner = OwnerId::new("owner-1").unwrap();
        let identity = DeviceIdentity::new(owner, "user", "laptop").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut doc = Document::new(DocumentId::new(), DocumentKind::Note, &identity, now);
        doc.synced_at = Some(now);
        let body = DocumentBody {
            document_id: doc.id,
            content: "hello".into(),
            updated_at: now,
        };
        (doc, body)
    }

    fn store(base: &str) -> HttpRemoteStore {
        let session = OwnerSession::new(OwnerId::new("owner-1").unwrap()).with_token("jwt");
        HttpRemoteStore::new(base, "anon-key", session, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_table_url_keeps_base_path() {
        let remote = store("https://example.supabase.co/project");
        assert_eq!(
            remote.table_url("documents").unwrap().as_str(),
            "https://example.supabase.co/project/rest/v1/documents"
        );

        let remote = store("https://example.supabase.co/");
        assert_eq!(
            remote.table_url("document_bodies").unwrap().as_str(),
            "https://example.supabase.co/rest/v1/document_bodies"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let session = OwnerSession::new(OwnerId::new("o").unwrap());
        assert!(matches!(
            HttpRemoteStore::new("not a url", "k", session, Duration::from_secs(1)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_every_request_is_owner_scoped() {
        let remote = store("https://example.supabase.co");
        let url = remote.table_url("documents").unwrap();
        let request = remote.request(Method::GET, url).build().unwrap();
        let query = request.url().query().unwrap_or_default().to_string();
        assert!(query.contains("owner_id=eq.owner-1"));
        assert_eq!(
            request.headers().get(header::AUTHORIZATION).unwrap(),
            "Bearer jwt"
        );
    }

    #[test]
    fn test_change_filters() {
        assert!(change_filters(None, None).is_empty());

        let since = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let cursor = ChangeCursor {
            updated_at: since,
            id: "abc".into(),
        };
        let filters = change_filters(Some(since), Some(&cursor));
        assert_eq!(filters[0], ("updated_at", "gt.2024-05-01T12:00:00.000000Z".to_string()));
        assert_eq!(
            filters[1].1,
            "(updated_at.gt.2024-05-01T12:00:00.000000Z,and(updated_at.eq.2024-05-01T12:00:00.000000Z,id.gt.abc))"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad"),
            Error::Validation(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_upsert_is_one_request() {
        let (base, seen) = stub_server(204).await;
        let remote = store(&base);
        let (doc, body) = synced_note();

        remote.upsert(&doc, &body).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (target, payload) = &seen[0];
        assert_eq!(target, "POST /rest/v1/rpc/upsert_document");

        let payload: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(payload["document"]["id"], doc.id.to_string());
        assert_eq!(payload["document"]["owner_id"], "owner-1");
        assert!(payload["document"].get("document_bodies").is_none());
        assert_eq!(payload["body"]["content"], "hello");
    }

    #[tokio::test]
    async fn test_failed_upsert_writes_nothing_else() {
        let (base, seen) = stub_server(503).await;
        let remote = store(&base);
        let (doc, body) = synced_note();

        let err = remote.upsert(&doc, &body).await.unwrap_err();
        assert!(err.is_transient());

        // The only request was the atomic call; no table was touched.
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen.iter().all(|(target, _)| target.contains("/rpc/")));
    }
}
