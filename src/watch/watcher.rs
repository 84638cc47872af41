use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;

use crate::Event;
use crate::EventType;
use crate::KeyRange;
use crate::Revision;
use crate::WatchResponse;
use crate::COMPACTED_REASON;

/// Watch identifier, unique within the owning stream
pub type WatchId = i64;

/// Identifies an open watch stream within one engine
pub type StreamId = u64;

/// Engine-wide watcher identity; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatcherKey(pub(crate) u64);

bitflags::bitflags! {
    /// Event kinds a watcher does not want to see
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WatchFilters: u32 {
        /// Filter out PUT events.
        const NOPUT = 0b0000_0001;
        /// Filter out DELETE events.
        const NODELETE = 0b0000_0010;
    }
}

impl Default for WatchFilters {
    fn default() -> Self {
        Self::empty()
    }
}

impl WatchFilters {
    pub fn admits(
        &self,
        event_type: EventType,
    ) -> bool {
        match event_type {
            EventType::Put => !self.contains(WatchFilters::NOPUT),
            EventType::Delete => !self.contains(WatchFilters::NODELETE),
        }
    }
}

/// Request to open one watcher on a stream
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatchCreateRequest {
    pub key: Bytes,
    /// Empty for a single key, `"\0"` for every key `>= key`
    pub range_end: Bytes,
    /// First revision to deliver; 0 means "from the next commit"
    pub start_revision: Revision,
    pub filters: WatchFilters,
    pub progress_notify: bool,
    pub prev_kv: bool,
    /// Allow oversized responses to be split into fragments
    pub fragment: bool,
    /// Explicit id; auto-assigned when `None`
    pub watch_id: Option<WatchId>,
}

impl WatchCreateRequest {
    pub fn key(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn range(
        key: impl Into<Bytes>,
        range_end: impl Into<Bytes>,
    ) -> Self {
        Self {
            key: key.into(),
            range_end: range_end.into(),
            ..Default::default()
        }
    }

    /// Every key starting with `prefix`
    pub fn prefix(prefix: impl Into<Bytes>) -> Self {
        let range = KeyRange::prefix(prefix);
        Self {
            key: range.start().clone(),
            range_end: range.wire_range_end(),
            ..Default::default()
        }
    }

    pub fn with_start_revision(
        mut self,
        revision: Revision,
    ) -> Self {
        self.start_revision = revision;
        self
    }

    pub fn with_filters(
        mut self,
        filters: WatchFilters,
    ) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_progress_notify(mut self) -> Self {
        self.progress_notify = true;
        self
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }

    pub fn with_fragment(mut self) -> Self {
        self.fragment = true;
        self
    }

    pub fn with_watch_id(
        mut self,
        watch_id: WatchId,
    ) -> Self {
        self.watch_id = Some(watch_id);
        self
    }
}

/// Where a watcher currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Pending,
    /// Fed directly by commit fan-out
    Synced,
    /// Fed by the catch-up loop from history
    Unsynced,
    Cancelled,
}

/// Why a watcher was terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    ExplicitCancel,
    /// History the watcher still needed is gone; carries the compaction revision
    Compacted(Revision),
    StreamClosed,
    InternalError(String),
    ResourceExhausted { size: usize, limit: usize },
}

impl CancelReason {
    /// Text carried in the terminal response, `None` for an explicit cancel
    pub fn message(&self) -> Option<String> {
        match self {
            CancelReason::ExplicitCancel => None,
            CancelReason::Compacted(_) => Some(COMPACTED_REASON.to_string()),
            CancelReason::StreamClosed => Some("watch stream closed".to_string()),
            CancelReason::InternalError(msg) => Some(msg.clone()),
            CancelReason::ResourceExhausted { size, limit } => Some(format!(
                "response of {size} bytes exceeds receive limit of {limit} bytes"
            )),
        }
    }
}

/// Which events of a revision batch a watcher receives, and in what shape
#[derive(Debug, Clone)]
pub(crate) struct EventSelector {
    pub(crate) range: KeyRange,
    pub(crate) filters: WatchFilters,
    pub(crate) prev_kv: bool,
}

impl EventSelector {
    pub(crate) fn select<'a>(
        &self,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> Vec<Event> {
        events
            .into_iter()
            .filter(|e| self.range.contains(e.key()) && self.filters.admits(e.event_type))
            .map(|e| {
                let mut event = e.clone();
                if !self.prev_kv {
                    event.prev_kv = None;
                }
                event
            })
            .collect()
    }
}

pub(crate) enum Delivery {
    Sent,
    /// Outbound buffer is at capacity; nothing was enqueued
    Full,
    /// Receiving side is gone
    Closed,
}

/// Engine-side record of one subscription
///
/// Owned by the engine's watcher table. Groups and the interval index refer to
/// it only by [`WatcherKey`].
pub(crate) struct Watcher {
    pub(crate) key: WatcherKey,
    pub(crate) stream_id: StreamId,
    pub(crate) id: WatchId,
    pub(crate) start_revision: Revision,
    /// Next revision not yet delivered; maintained while unsynced, synced
    /// watchers are implicitly at `current_revision + 1`
    pub(crate) cursor: Revision,
    pub(crate) selector: EventSelector,
    pub(crate) progress_notify: bool,
    pub(crate) state: WatcherState,
    /// An event response went out since the last periodic progress tick
    pub(crate) sent_since_progress: bool,
    sender: mpsc::Sender<WatchResponse>,
    terminal: Option<oneshot::Sender<WatchResponse>>,
}

impl Watcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: WatcherKey,
        stream_id: StreamId,
        id: WatchId,
        start_revision: Revision,
        selector: EventSelector,
        progress_notify: bool,
        sender: mpsc::Sender<WatchResponse>,
        terminal: oneshot::Sender<WatchResponse>,
    ) -> Self {
        Self {
            key,
            stream_id,
            id,
            start_revision,
            cursor: start_revision,
            selector,
            progress_notify,
            state: WatcherState::Pending,
            sent_since_progress: false,
            sender,
            terminal: Some(terminal),
        }
    }

    pub(crate) fn range(&self) -> &KeyRange {
        &self.selector.range
    }

    /// Non-blocking enqueue onto the outbound buffer
    pub(crate) fn try_deliver(
        &self,
        response: WatchResponse,
    ) -> Delivery {
        match self.sender.try_send(response) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// The outbound buffer can take at least one more response
    pub(crate) fn has_capacity(&self) -> bool {
        self.sender.capacity() > 0
    }

    /// Hands the terminal response to the stream. It is emitted after
    /// everything already buffered.
    pub(crate) fn finish(
        &mut self,
        response: WatchResponse,
    ) {
        if let Some(terminal) = self.terminal.take() {
            let _ = terminal.send(response);
        }
    }
}
