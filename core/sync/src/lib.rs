//! notesync sync engine
//!
//! This module keeps a local document cache consistent with a remote
//! store, including:
//! - A durable, coalescing outbound queue with capped exponential backoff
//! - Deterministic conflict resolution with conflict copies
//! - Incremental, paginated polling behind a watermark
//! - A single cooperative scheduler that never overlaps cycles

pub mod conflict;
pub mod locks;
pub mod manager;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use conflict::{ConflictResolver, MergeWrites, Resolution, DEFAULT_CONFLICT_SUFFIX};
pub use locks::KeyedLocks;
pub use manager::{
    CycleOutcome, CycleReport, DrainReport, PollReport, ResetReport, ResetRequest, SyncConfig,
    SyncManager,
};
pub use queue::{FailureOutcome, SyncQueue};
pub use retry::BackoffPolicy;
pub use scheduler::{SchedulerHandle, SyncScheduler};
pub use state::{RecordedError, SyncMeta, SyncMetaSnapshot, SyncStatus};
