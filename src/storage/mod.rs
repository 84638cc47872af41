//! Storage side of the watch engine.
//!
//! The persistent multi-version engine is an external collaborator; the watch
//! engine only sees it through [`RevisionSource`]. [`MemStore`] is an
//! in-memory MVCC store implementing that trait, and [`WatchableStore`] ties
//! a store to a [`crate::WatchEngine`] so that every commit is fanned out in
//! revision order.
mod event;
mod mem_store;
mod revision_source;
mod watchable_store;

#[doc(hidden)]
pub use event::*;
#[doc(hidden)]
pub use mem_store::*;
#[doc(hidden)]
pub use revision_source::*;
#[doc(hidden)]
pub use watchable_store::*;
