//! Identifier types used throughout notesync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a document.
///
/// Always a syntactically valid, non-nil UUID. Rows that fail to parse
/// are rejected at the storage boundary instead of being carried around
/// as raw strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(Uuid);

impl DocumentId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id from its textual form.
    ///
    /// # Errors
    /// - Returns `Validation` if `s` is not a UUID or is the nil UUID
    pub fn parse(s: &str) -> crate::Result<Self> {
        let uuid = Uuid::parse_str(s.trim())
            .map_err(|e| crate::Error::Validation(format!("invalid document id {s:?}: {e}")))?;
        if uuid.is_nil() {
            return Err(crate::Error::Validation(
                "document id cannot be the nil UUID".to_string(),
            ));
        }
        Ok(Self(uuid))
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for DocumentId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DocumentId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.to_string()
    }
}

/// Identifier of the account that owns a set of documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create a new OwnerId.
    ///
    /// # Errors
    /// - Returns `Validation` if `id` is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::Validation(
                "OwnerId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who is writing from this device.
///
/// Stamped onto every document the device writes so the remote can
/// attribute and scope it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub owner_id: OwnerId,
    pub user_id: String,
    pub client_id: String,
}

impl DeviceIdentity {
    /// Create an identity, rejecting blank user or client ids.
    pub fn new(
        owner_id: OwnerId,
        user_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> crate::Result<Self> {
        let user_id = user_id.into();
        let client_id = client_id.into();
        if user_id.trim().is_empty() {
            return Err(crate::Error::Validation("user id cannot be empty".into()));
        }
        if client_id.trim().is_empty() {
            return Err(crate::Error::Validation("client id cannot be empty".into()));
        }
        Ok(Self {
            owner_id,
            user_id,
            client_id,
        })
    }
}
