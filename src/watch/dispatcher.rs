//! Fan-out of committed revisions to the synced group.
//!
//! Runs on the commit path under the engine lock and never waits on a
//! consumer. A watcher whose buffer is full misses the batch here and is
//! handed to the catch-up loop with its cursor parked on that revision, so
//! the batch is replayed from history once the consumer drains.

use std::collections::HashMap;

use tracing::trace;
use tracing::warn;

use super::engine::EngineState;
use super::watcher::Delivery;
use crate::CancelReason;
use crate::RevisionBatch;
use crate::WatchResponse;
use crate::WatcherKey;
use crate::WATCHER_DEMOTED_TOTAL;

#[derive(Debug, Default)]
pub(crate) struct DispatchOutcome {
    pub(crate) delivered: usize,
    pub(crate) demoted: usize,
    pub(crate) closed: usize,
}

pub(crate) fn dispatch(
    state: &mut EngineState,
    batch: &RevisionBatch,
) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();
    if batch.revision <= state.current_revision {
        warn!(
            revision = batch.revision,
            current_revision = state.current_revision,
            "ignoring revision batch that does not advance the store"
        );
        return outcome;
    }
    state.current_revision = batch.revision;
    if state.synced.is_empty() || batch.events.is_empty() {
        return outcome;
    }

    // Event positions per interested watcher, in commit order
    let mut interested: HashMap<WatcherKey, Vec<usize>> = HashMap::new();
    let mut hits = Vec::new();
    for (idx, event) in batch.events.iter().enumerate() {
        hits.clear();
        state.synced.matching(event.key(), &mut hits);
        for key in &hits {
            interested.entry(*key).or_default().push(idx);
        }
    }

    let mut lagging = Vec::new();
    let mut closed = Vec::new();
    for (key, positions) in interested {
        let Some(watcher) = state.watchers.get_mut(&key) else {
            continue;
        };
        let events = watcher
            .selector
            .select(positions.iter().map(|idx| &batch.events[*idx]));
        if events.is_empty() {
            continue;
        }

        match watcher.try_deliver(WatchResponse::events(watcher.id, batch.revision, events)) {
            Delivery::Sent => {
                watcher.sent_since_progress = true;
                outcome.delivered += 1;
            }
            Delivery::Full => lagging.push(key),
            Delivery::Closed => closed.push(key),
        }
    }

    for key in lagging {
        if let Some(watcher) = state.watchers.get(&key) {
            warn!(
                stream_id = watcher.stream_id,
                watch_id = watcher.id,
                revision = batch.revision,
                "watcher buffer full; moving to unsynced"
            );
        }
        state.demote(key, batch.revision);
        outcome.demoted += 1;
    }
    for key in closed {
        trace!(revision = batch.revision, "watcher receiver gone");
        state.cancel_watcher(key, CancelReason::StreamClosed);
        outcome.closed += 1;
    }

    if state.metrics_enabled && outcome.demoted > 0 {
        WATCHER_DEMOTED_TOTAL.inc_by(outcome.demoted as u64);
    }
    outcome
}
