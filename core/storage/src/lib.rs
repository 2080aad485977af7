//! Storage layer for notesync.
//!
//! Two sides of the sync problem live here:
//! - [`LocalStore`]: the on-device SQLite database holding documents,
//!   bodies, the outbound queue and sync metadata
//! - [`RemoteStore`]: an owner-scoped async interface to the shared
//!   server, with an in-memory adapter for tests and an HTTP adapter
//!   for PostgREST-style backends
//!
//! # Design Principles
//! - Local writes are transactional: a document change and its queue
//!   entry commit together or not at all
//! - Remote adapters never retry; the sync queue owns retry policy
//! - Adapters are bound to one owner at construction

pub mod http;
pub mod local;
pub mod memory;
pub mod remote;

pub use http::HttpRemoteStore;
pub use local::{LocalStore, StoreTx, SCHEMA_VERSION};
pub use memory::{MemoryBackend, MemoryRemote};
pub use remote::{
    ChangeCursor, ChangePage, OwnerSession, RemoteBodyRow, RemoteDocumentRow, RemoteStore,
};
