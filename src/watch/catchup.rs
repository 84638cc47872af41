//! Catch-up loop for the unsynced group.
//!
//! One round:
//!
//! ```text
//!  lock   ─ plan: promote watchers already at the live edge,
//!           cancel watchers below the compaction boundary,
//!           skip watchers whose buffer is full,
//!           pick the lowest cursors and one revision window [from, to)
//!  unlock ─ read the window from the revision source (blocking pool)
//!           select each watcher's events
//!  lock   ─ deliver, advance cursors to `to`, promote at the live edge
//! ```
//!
//! Promotion happens under the same lock the dispatcher takes, so no commit
//! can slip between a watcher's last replayed revision and its first live one.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use super::engine::EngineState;
use super::watcher::Delivery;
use super::watcher::EventSelector;
use super::WatchEngine;
use crate::CancelReason;
use crate::Error;
use crate::Event;
use crate::KeyRange;
use crate::Result;
use crate::Revision;
use crate::StorageError;
use crate::WatchConfig;
use crate::WatchResponse;
use crate::WatcherKey;
use crate::WatcherState;
use crate::WATCHER_COMPACTED_TOTAL;
use crate::WATCH_CATCHUP_DURATION_SECONDS;
use crate::WATCH_CATCHUP_LAG_REVISIONS;

struct Target {
    key: WatcherKey,
    cursor: Revision,
    selector: EventSelector,
}

struct Round {
    from: Revision,
    to: Revision,
    range: KeyRange,
    targets: Vec<Target>,
}

pub(crate) async fn run(
    engine: Weak<WatchEngine>,
    wake: Arc<Notify>,
    period: Duration,
    mut shutdown: watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("catch-up loop started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }

        let Some(engine) = engine.upgrade() else {
            break;
        };
        loop {
            match engine.sync_round().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    error!("catch-up round failed: {:?}", e);
                    break;
                }
            }
        }
    }

    debug!("catch-up loop stopped");
}

impl WatchEngine {
    /// Runs one catch-up round. Returns `true` when another round should
    /// follow right away.
    pub(crate) async fn sync_round(&self) -> Result<bool> {
        let boundary = self.source.compaction_boundary();
        let round = {
            let mut state = self.state.lock();
            let round = plan(&mut state, boundary, &self.config);
            state.refresh_gauges();
            round
        };
        let Some(round) = round else {
            return Ok(false);
        };

        let started = Instant::now();
        let result = self.catch_up(round).await;
        if self.config.enable_metrics {
            WATCH_CATCHUP_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        }
        result
    }

    /// Reads the round's window and delivers it
    async fn catch_up(
        &self,
        round: Round,
    ) -> Result<bool> {
        let Round {
            from,
            to,
            range,
            targets,
        } = round;
        trace!(from, to, watchers = targets.len(), "catch-up read");

        let source = self.source.clone();
        let read = tokio::task::spawn_blocking(move || -> Result<Vec<Event>> {
            source.read_range(from, to, &range)?.collect()
        })
        .await?;

        let events = match read {
            Ok(events) => events,
            Err(Error::Storage(StorageError::Compacted {
                compact_revision, ..
            })) => {
                // The next round sees the new boundary and cancels
                debug!(from, compact_revision, "catch-up window compacted during read");
                return Ok(false);
            }
            Err(e) => {
                warn!(from, to, "catch-up read failed: {}", e);
                let mut state = self.state.lock();
                for target in &targets {
                    if still_waiting(&state, target) {
                        let reason = CancelReason::InternalError(e.to_string());
                        state.cancel_watcher(target.key, reason);
                    }
                }
                state.refresh_gauges();
                return Ok(!state.unsynced.is_empty());
            }
        };

        let prepared: Vec<(Target, Vec<Event>)> = targets
            .into_iter()
            .map(|target| {
                let selected = target
                    .selector
                    .select(events.iter().filter(|e| e.revision() >= target.cursor));
                (target, selected)
            })
            .collect();

        let mut state = self.state.lock();
        let header = state.current_revision;
        let mut progressed = false;

        for (target, selected) in prepared {
            if !still_waiting(&state, &target) {
                continue;
            }
            let Some(watcher) = state.watchers.get_mut(&target.key) else {
                continue;
            };

            let had_events = !selected.is_empty();
            let delivery = if !had_events {
                Delivery::Sent
            } else {
                watcher.try_deliver(WatchResponse::events(watcher.id, header, selected))
            };
            match delivery {
                Delivery::Sent => {
                    watcher.cursor = to;
                    watcher.sent_since_progress |= had_events;
                    progressed = true;
                    trace!(watch_id = watcher.id, cursor = to, "caught up to window end");
                    if watcher.cursor == header + 1 {
                        state.promote(target.key);
                    }
                }
                Delivery::Full => {
                    trace!(watch_id = watcher.id, "buffer still full; retrying next round");
                }
                Delivery::Closed => {
                    state.cancel_watcher(target.key, CancelReason::StreamClosed);
                    progressed = true;
                }
            }
        }
        state.refresh_gauges();

        Ok(progressed && !state.unsynced.is_empty())
    }
}

fn still_waiting(
    state: &EngineState,
    target: &Target,
) -> bool {
    state
        .watchers
        .get(&target.key)
        .map(|w| w.state == WatcherState::Unsynced && w.cursor == target.cursor)
        .unwrap_or(false)
}

fn plan(
    state: &mut EngineState,
    boundary: Revision,
    config: &WatchConfig,
) -> Option<Round> {
    let current = state.current_revision;
    let mut candidates = Vec::new();
    let mut live = Vec::new();
    let mut compacted = Vec::new();
    let mut stalled = 0usize;

    for key in state.unsynced.keys() {
        let Some(watcher) = state.watchers.get(&key) else {
            continue;
        };
        if watcher.cursor > current + 1 {
            // start revision still in the future
            continue;
        }
        if watcher.cursor == current + 1 {
            live.push(key);
        } else if watcher.cursor < boundary {
            compacted.push((key, watcher.id, watcher.cursor));
        } else if !watcher.has_capacity() {
            // retried once its consumer drains
            stalled += 1;
        } else {
            candidates.push((watcher.cursor, key));
        }
    }

    for key in live {
        state.promote(key);
    }
    for (key, watch_id, cursor) in compacted {
        warn!(
            watch_id,
            cursor,
            compact_revision = boundary,
            "watcher history compacted; cancelling"
        );
        state.cancel_watcher(key, CancelReason::Compacted(boundary));
        if state.metrics_enabled {
            WATCHER_COMPACTED_TOTAL.inc();
        }
    }

    if stalled > 0 {
        trace!(stalled, "skipping unsynced watchers with full buffers");
    }
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_unstable();
    candidates.truncate(config.max_watchers_per_sync);

    let from = candidates[0].0;
    let to = (current + 1).min(from.saturating_add(config.max_revisions_per_sync));

    let targets: Vec<Target> = candidates
        .into_iter()
        .filter(|(cursor, _)| *cursor < to)
        .filter_map(|(cursor, key)| {
            state.watchers.get(&key).map(|w| Target {
                key,
                cursor,
                selector: w.selector.clone(),
            })
        })
        .collect();

    let mut range = targets.first()?.selector.range.clone();
    for target in targets.iter().skip(1) {
        range = range.covering(&target.selector.range);
    }

    if state.metrics_enabled {
        for target in &targets {
            WATCH_CATCHUP_LAG_REVISIONS.observe((current + 1 - target.cursor) as f64);
        }
    }

    Some(Round {
        from,
        to,
        range,
        targets,
    })
}
