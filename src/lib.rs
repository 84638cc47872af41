//! revwatch - watch engine for a replicated multi-version key-value store
//!
//! The store's committed revision history is projected into live subscriber
//! notifications: every watcher observes the mutations on its key range
//! exactly once, in revision order, from any historical or future starting
//! revision, with bounded per-watcher buffering.
//!
//! ```text
//!  WatchableStore::put/txn/delete_range
//!        │ commit (revision R)
//!        ▼
//!  ┌──────────────┐ notify(batch) ┌─────────────────────┐
//!  │   MemStore   │──────────────▶│ WatchEngine         │
//!  │ (history,    │               │  synced  ─▶ fan-out ─┼──▶ per-watcher buffers
//!  │  compaction) │◀── read_range ─┤  unsynced ◀ catch-up │        │
//!  └──────────────┘               └─────────────────────┘        ▼
//!                                                       WatchResponses (per session)
//! ```
//!
//! The storage engine is an external collaborator reached through
//! [`RevisionSource`]; [`MemStore`] is the reference implementation used by
//! the host binary and the tests.

mod config;
mod constants;
mod errors;
mod key_range;
mod metrics;
mod storage;
mod watch;

pub use config::*;
pub use constants::*;
pub use errors::*;
pub use key_range::*;
pub use metrics::*;
pub use storage::*;
pub use watch::*;


#[cfg(test)]
pub(crate) mod test_utils;
