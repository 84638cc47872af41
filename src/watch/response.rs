use crate::CancelReason;
use crate::Event;
use crate::Revision;
use crate::WatchId;
use crate::INVALID_WATCH_ID;
use crate::RESPONSE_OVERHEAD_BYTES;
use crate::WATCH_ID_NOT_FOUND_REASON;

/// One message on a watch stream
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatchResponse {
    pub watch_id: WatchId,
    /// Store revision observed when the response was produced
    pub header_revision: Revision,
    pub created: bool,
    pub canceled: bool,
    pub cancel_reason: Option<String>,
    /// Set on `Compacted` cancellations
    pub compact_revision: Revision,
    /// More fragments of the same logical response follow
    pub fragment: bool,
    pub events: Vec<Event>,
}

impl WatchResponse {
    /// Creation acknowledgment
    pub fn created(
        watch_id: WatchId,
        header_revision: Revision,
    ) -> Self {
        Self {
            watch_id,
            header_revision,
            created: true,
            ..Default::default()
        }
    }

    pub fn events(
        watch_id: WatchId,
        header_revision: Revision,
        events: Vec<Event>,
    ) -> Self {
        Self {
            watch_id,
            header_revision,
            events,
            ..Default::default()
        }
    }

    /// Header-only response: the store has processed up to `header_revision`
    pub fn progress(
        watch_id: WatchId,
        header_revision: Revision,
    ) -> Self {
        Self {
            watch_id,
            header_revision,
            ..Default::default()
        }
    }

    /// Terminal response of a watcher
    pub fn canceled(
        watch_id: WatchId,
        header_revision: Revision,
        reason: &CancelReason,
    ) -> Self {
        let compact_revision = match reason {
            CancelReason::Compacted(rev) => *rev,
            _ => 0,
        };
        Self {
            watch_id,
            header_revision,
            canceled: true,
            cancel_reason: reason.message(),
            compact_revision,
            ..Default::default()
        }
    }

    /// A create request that never produced a watcher
    pub fn rejected(
        watch_id: WatchId,
        header_revision: Revision,
        reason: String,
    ) -> Self {
        Self {
            watch_id,
            header_revision,
            created: true,
            canceled: true,
            cancel_reason: Some(reason),
            ..Default::default()
        }
    }

    /// Answer to a cancel request for an id that is not live
    pub fn unknown_watch(header_revision: Revision) -> Self {
        Self {
            watch_id: INVALID_WATCH_ID,
            header_revision,
            canceled: true,
            cancel_reason: Some(WATCH_ID_NOT_FOUND_REASON.to_string()),
            ..Default::default()
        }
    }

    pub fn is_progress_notify(&self) -> bool {
        self.events.is_empty()
            && !self.created
            && !self.canceled
            && !self.fragment
            && self.compact_revision == 0
    }

    /// Approximate wire size
    pub fn encoded_len(&self) -> usize {
        RESPONSE_OVERHEAD_BYTES
            + self.cancel_reason.as_ref().map(String::len).unwrap_or(0)
            + self.events.iter().map(Event::encoded_len).sum::<usize>()
    }
}
