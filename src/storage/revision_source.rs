#[cfg(test)]
use mockall::automock;

use crate::Event;
use crate::KeyRange;
use crate::Result;
use crate::Revision;

/// Lazy, finite sequence of historical events in revision order
pub type EventIter = Box<dyn Iterator<Item = Result<Event>> + Send>;

/// Read side of the multi-version store, as consumed by the watch engine
///
/// Implementations must return events in increasing revision order and, within
/// one revision, in commit order. Every event must carry its `prev_kv` when the
/// key existed before; the engine strips it for watchers that did not ask for it.
#[cfg_attr(test, automock)]
pub trait RevisionSource: Send + Sync + 'static {
    /// Events with `from_revision <= revision < to_revision` whose key lies in `range`
    ///
    /// # Errors
    /// `StorageError::Compacted` when `from_revision` is below the compaction
    /// boundary. Any other error is treated as a read failure.
    fn read_range(
        &self,
        from_revision: Revision,
        to_revision: Revision,
        range: &KeyRange,
    ) -> Result<EventIter>;

    /// Latest committed revision
    fn current_revision(&self) -> Revision;

    /// Oldest revision still readable; everything below it has been discarded
    fn compaction_boundary(&self) -> Revision;
}
