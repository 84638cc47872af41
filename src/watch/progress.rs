//! Header-only progress notifications.
//!
//! Only synced watchers are notified: an unsynced watcher's cursor is behind
//! the header revision, and a progress response would claim otherwise.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::trace;

use super::engine::EngineState;
use super::watcher::Delivery;
use super::WatchEngine;
use crate::CancelReason;
use crate::WatchResponse;
use crate::WatcherKey;

pub(crate) async fn run(
    engine: Weak<WatchEngine>,
    period: Duration,
    mut shutdown: watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("progress notifier started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let Some(engine) = engine.upgrade() else {
            break;
        };
        let sent = engine.notify_idle_progress();
        trace!(sent, "periodic progress");
    }

    debug!("progress notifier stopped");
}

impl WatchEngine {
    /// One periodic tick: notifies synced `progress_notify` watchers that
    /// received no events since the previous tick
    pub fn notify_idle_progress(&self) -> usize {
        let mut state = self.state.lock();
        let sent = notify_idle(&mut state);
        state.refresh_gauges();
        sent
    }
}

fn notify_idle(state: &mut EngineState) -> usize {
    let header = state.current_revision;
    let keys: Vec<WatcherKey> = state.synced.keys().collect();
    let mut sent = 0;
    let mut closed = Vec::new();

    for key in keys {
        let Some(watcher) = state.watchers.get_mut(&key) else {
            continue;
        };
        if !watcher.progress_notify {
            continue;
        }
        if watcher.sent_since_progress {
            watcher.sent_since_progress = false;
            continue;
        }
        match watcher.try_deliver(WatchResponse::progress(watcher.id, header)) {
            Delivery::Sent => sent += 1,
            // the next event response carries a newer header anyway
            Delivery::Full => {}
            Delivery::Closed => closed.push(key),
        }
    }

    for key in closed {
        state.cancel_watcher(key, CancelReason::StreamClosed);
    }
    sent
}

/// On-demand progress for `keys`; unsynced watchers are silently skipped
pub(crate) fn request_progress(
    state: &mut EngineState,
    keys: &[WatcherKey],
) -> usize {
    let header = state.current_revision;
    let mut sent = 0;
    let mut closed = Vec::new();

    for key in keys {
        if !state.synced.contains(*key) {
            continue;
        }
        let Some(watcher) = state.watchers.get(key) else {
            continue;
        };
        match watcher.try_deliver(WatchResponse::progress(watcher.id, header)) {
            Delivery::Sent => sent += 1,
            Delivery::Full => {}
            Delivery::Closed => closed.push(*key),
        }
    }

    for key in closed {
        state.cancel_watcher(key, CancelReason::StreamClosed);
    }
    sent
}
