//! Common utilities and types shared across notesync modules.
//!
//! This module provides the error taxonomy, identifier types and the
//! document model that the storage and sync layers exchange.

pub mod clock;
pub mod document;
pub mod error;
pub mod queue;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use document::{Document, DocumentBody, DocumentKind, DocumentPatch, DocumentSnapshot};
pub use error::{Error, Result};
pub use queue::{EntryState, QueueEntry, QueueOp};
pub use types::{DeviceIdentity, DocumentId, OwnerId};
