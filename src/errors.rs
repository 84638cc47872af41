//! Watch engine error hierarchy
//!
//! Errors are split by the layer that raises them: watcher-scoped failures
//! ([`WatchError`]) terminate a single watcher and never the session, storage
//! failures ([`StorageError`]) come from the revision source, and the rest
//! cover configuration and background task plumbing.

use config::ConfigError;
use tokio::task::JoinError;

use crate::Revision;
use crate::WatchId;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Watcher-scoped failures (bad requests, cancellations surfaced to callers)
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Failures reported by the revision source
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// Malformed key interval at creation; no watcher is created
    #[error("invalid watch range: key={key:?} range_end={range_end:?}")]
    InvalidRange { key: Vec<u8>, range_end: Vec<u8> },

    /// Cancel or progress request against an id that is not live
    #[error("watch id {0} not found")]
    InvalidWatchId(WatchId),

    /// Explicit watch id already bound on the session
    #[error("watch id {0} already exists")]
    WatchIdExists(WatchId),

    /// Required history no longer exists
    #[error("mvcc: required revision has been compacted (compact revision {compact_revision})")]
    Compacted { compact_revision: Revision },

    /// Unfragmented response larger than the transport receive limit
    #[error("watch {watch_id}: response of {size} bytes exceeds receive limit of {limit} bytes")]
    ResourceExhausted {
        watch_id: WatchId,
        size: usize,
        limit: usize,
    },

    #[error("internal watch error: {0}")]
    Internal(String),

    #[error("watch stream closed")]
    StreamClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("required revision {requested} has been compacted (compact revision {compact_revision})")]
    Compacted {
        requested: Revision,
        compact_revision: Revision,
    },

    #[error("required revision {requested} is a future revision (current {current})")]
    FutureRevision {
        requested: Revision,
        current: Revision,
    },

    #[error(
        "cannot compact at revision {requested}: current revision {current}, compacted at {compact_revision}"
    )]
    InvalidCompaction {
        requested: Revision,
        current: Revision,
        compact_revision: Revision,
    },

    #[error("storage read failure: {0}")]
    ReadFailure(String),
}
