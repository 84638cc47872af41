//! Watch engine
//!
//! Projects the store's committed revision history into per-watcher response
//! streams: ordered, exactly once, from any start revision.
//!
//! # Architecture
//!
//! ```text
//! Commit path (hot, never blocks):
//!   WatchEngine::notify(batch) -> dispatcher -> synced group key index
//!                                                 │ try_send
//!                                                 ▼
//!                                   per-watcher bounded buffer ──▶ WatchResponses
//!                                                 ▲
//! Catch-up task (one per engine):                 │ try_send
//!   unsynced group -> read_range(from, to) -> select per watcher
//!        ▲                                         │ cursor == current + 1
//!        │ buffer full                             ▼
//!   demote (cursor = missed revision)        promote to synced
//! ```
//!
//! # Watcher lifecycle
//!
//! `Pending -> {Synced, Unsynced}`, `Synced <-> Unsynced`, any state `-> Cancelled`.
//! The synced and unsynced groups only hold [`WatcherKey`]s; the engine's
//! watcher table owns the watchers.
//!
//! # Failure behavior
//!
//! - A full buffer never drops a batch: the watcher is demoted and the batch
//!   replayed from history.
//! - A watcher whose next revision falls below the compaction boundary is
//!   cancelled with the compaction revision and receives nothing further.
//! - A history read failure cancels the affected watchers; it is not retried.

mod catchup;
mod dispatcher;
mod engine;
mod fragment;
mod interval_tree;
mod progress;
mod response;
mod stream;
mod watcher;
mod watcher_group;

pub use engine::*;
pub use response::*;
pub use stream::*;
pub use watcher::*;

#[cfg(test)]
mod engine_test;
#[cfg(test)]
mod fragment_test;
