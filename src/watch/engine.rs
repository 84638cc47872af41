use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::trace;

use super::catchup;
use super::dispatcher;
use super::progress;
use super::stream::WatcherOutlet;
use super::watcher::EventSelector;
use super::watcher::Watcher;
use super::watcher_group::WatcherGroup;
use crate::CancelReason;
use crate::Error;
use crate::KeyRange;
use crate::Result;
use crate::Revision;
use crate::RevisionBatch;
use crate::RevisionSource;
use crate::StreamId;
use crate::WatchConfig;
use crate::WatchCreateRequest;
use crate::WatchError;
use crate::WatchId;
use crate::WatchResponse;
use crate::WatchResponses;
use crate::WatchStream;
use crate::WatcherKey;
use crate::WatcherState;
use crate::SLOW_WATCHER_TOTAL;
use crate::WATCHER_TOTAL;
use crate::WATCH_STREAM_TOTAL;

/// Watch ids bound on one stream
#[derive(Debug, Default)]
pub(crate) struct StreamWatchers {
    next_id: WatchId,
    pub(crate) ids: HashMap<WatchId, WatcherKey>,
}

impl StreamWatchers {
    fn allocate(&mut self) -> WatchId {
        while self.ids.contains_key(&self.next_id) {
            self.next_id += 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Everything guarded by the engine lock
///
/// A watcher key is in at most one of `synced` / `unsynced`, and in exactly
/// one of them while it is in `watchers`.
pub(crate) struct EngineState {
    /// Last revision handed to the dispatcher
    pub(crate) current_revision: Revision,
    pub(crate) watchers: HashMap<WatcherKey, Watcher>,
    pub(crate) synced: WatcherGroup,
    pub(crate) unsynced: WatcherGroup,
    pub(crate) streams: HashMap<StreamId, StreamWatchers>,
    pub(crate) metrics_enabled: bool,
}

impl EngineState {
    pub(crate) fn new(
        current_revision: Revision,
        metrics_enabled: bool,
    ) -> Self {
        Self {
            current_revision,
            watchers: HashMap::new(),
            synced: WatcherGroup::default(),
            unsynced: WatcherGroup::default(),
            streams: HashMap::new(),
            metrics_enabled,
        }
    }

    /// Removes the watcher and hands its terminal response to the stream.
    /// `StreamClosed` has no terminal response: nobody is left to read it.
    pub(crate) fn cancel_watcher(
        &mut self,
        key: WatcherKey,
        reason: CancelReason,
    ) -> bool {
        let Some(mut watcher) = self.watchers.remove(&key) else {
            return false;
        };
        match watcher.state {
            WatcherState::Synced => {
                self.synced.remove(key, watcher.range());
            }
            WatcherState::Unsynced => {
                self.unsynced.remove(key, watcher.range());
            }
            WatcherState::Pending | WatcherState::Cancelled => {}
        }
        if let Some(stream) = self.streams.get_mut(&watcher.stream_id) {
            stream.ids.remove(&watcher.id);
        }
        watcher.state = WatcherState::Cancelled;

        debug!(
            stream_id = watcher.stream_id,
            watch_id = watcher.id,
            ?reason,
            "watcher cancelled"
        );
        if reason != CancelReason::StreamClosed {
            watcher.finish(WatchResponse::canceled(watcher.id, self.current_revision, &reason));
        }
        true
    }

    /// Synced -> Unsynced; `cursor` is the first revision the watcher missed
    pub(crate) fn demote(
        &mut self,
        key: WatcherKey,
        cursor: Revision,
    ) {
        let Some(watcher) = self.watchers.get_mut(&key) else {
            return;
        };
        if watcher.state != WatcherState::Synced {
            return;
        }
        self.synced.remove(key, watcher.range());
        self.unsynced.add(key, watcher.range());
        watcher.state = WatcherState::Unsynced;
        watcher.cursor = cursor;
    }

    /// Unsynced -> Synced
    pub(crate) fn promote(
        &mut self,
        key: WatcherKey,
    ) {
        let Some(watcher) = self.watchers.get_mut(&key) else {
            return;
        };
        if watcher.state != WatcherState::Unsynced {
            return;
        }
        self.unsynced.remove(key, watcher.range());
        self.synced.add(key, watcher.range());
        watcher.state = WatcherState::Synced;
        watcher.cursor = self.current_revision + 1;
        debug!(
            stream_id = watcher.stream_id,
            watch_id = watcher.id,
            revision = self.current_revision,
            "watcher synced"
        );
    }

    pub(crate) fn refresh_gauges(&self) {
        if self.metrics_enabled {
            WATCHER_TOTAL.set(self.watchers.len() as i64);
            SLOW_WATCHER_TOTAL.set(self.unsynced.len() as i64);
        }
    }
}

/// Lag of one watcher behind the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherLag {
    pub stream_id: StreamId,
    pub watch_id: WatchId,
    pub state: WatcherState,
    /// Revisions committed but not yet delivered; 0 while synced
    pub lag: u64,
}

/// Point-in-time view of the engine for operators
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatchStats {
    pub current_revision: Revision,
    pub active: usize,
    pub synced: usize,
    pub unsynced: usize,
    pub streams: usize,
    pub watchers: Vec<WatcherLag>,
}

pub(crate) struct Registered {
    pub(crate) key: WatcherKey,
    pub(crate) watch_id: WatchId,
    pub(crate) revision: Revision,
    pub(crate) outlet: WatcherOutlet,
}

struct EngineTasks {
    shutdown_tx: watch::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

/// Watch engine of one store instance
///
/// Commits enter through [`WatchEngine::notify`] and are fanned out to synced
/// watchers on the caller's thread without blocking. Lagging watchers are
/// served by a background catch-up task reading from the [`RevisionSource`];
/// a second task emits periodic progress notifications. Both run between
/// [`WatchEngine::start`] and [`WatchEngine::stop`].
pub struct WatchEngine {
    pub(super) config: WatchConfig,
    pub(super) source: Arc<dyn RevisionSource>,
    pub(super) state: Mutex<EngineState>,
    pub(super) catchup_notify: Arc<Notify>,
    next_watcher: AtomicU64,
    next_stream: AtomicU64,
    tasks: Mutex<Option<EngineTasks>>,
    weak_self: Weak<WatchEngine>,
}

impl WatchEngine {
    pub fn new(
        mut config: WatchConfig,
        source: Arc<dyn RevisionSource>,
    ) -> Arc<Self> {
        config.watcher_buffer_size = config.watcher_buffer_size.max(1);
        let current_revision = source.current_revision();
        let metrics_enabled = config.enable_metrics;
        Arc::new_cyclic(|weak_self| Self {
            config,
            source,
            state: Mutex::new(EngineState::new(current_revision, metrics_enabled)),
            catchup_notify: Arc::new(Notify::new()),
            next_watcher: AtomicU64::new(1),
            next_stream: AtomicU64::new(1),
            tasks: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Spawns the catch-up loop and the progress notifier on the current
    /// tokio runtime. Calling it again while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            debug!("watch engine already started");
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Fatal(format!("watch engine requires a tokio runtime: {e}")))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let catchup = runtime.spawn(catchup::run(
            self.weak_self.clone(),
            self.catchup_notify.clone(),
            self.config.sync_interval(),
            shutdown_rx.clone(),
        ));
        let progress = runtime.spawn(progress::run(
            self.weak_self.clone(),
            self.config.progress_notify_interval(),
            shutdown_rx,
        ));
        *tasks = Some(EngineTasks {
            shutdown_tx,
            handles: vec![catchup, progress],
        });

        info!(
            sync_interval_ms = self.config.sync_interval_ms,
            progress_notify_interval_ms = self.config.progress_notify_interval_ms,
            "watch engine started"
        );
        Ok(())
    }

    /// Signals the background tasks to exit; idempotent
    pub fn stop(&self) {
        if let Some(tasks) = self.tasks.lock().take() {
            let _ = tasks.shutdown_tx.send(());
            info!("watch engine stopped");
        }
    }

    /// Like [`WatchEngine::stop`], then waits for the tasks to finish
    pub async fn shutdown(&self) -> Result<()> {
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            let _ = tasks.shutdown_tx.send(());
            for joined in join_all(tasks.handles).await {
                joined?;
            }
            info!("watch engine shut down");
        }
        Ok(())
    }

    /// Fans a committed revision batch out to the synced watchers.
    ///
    /// Must be called once per revision, in revision order. Never blocks on a
    /// consumer: a watcher whose buffer is full is moved to the unsynced group.
    pub fn notify(
        &self,
        batch: &RevisionBatch,
    ) {
        let wake = {
            let mut state = self.state.lock();
            let outcome = dispatcher::dispatch(&mut state, batch);
            trace!(
                revision = batch.revision,
                delivered = outcome.delivered,
                demoted = outcome.demoted,
                "dispatched"
            );
            if outcome.demoted > 0 || outcome.closed > 0 {
                state.refresh_gauges();
            }
            !state.unsynced.is_empty()
        };
        if wake {
            self.catchup_notify.notify_one();
        }
    }

    /// Schedules a catch-up round, e.g. after the source was compacted
    pub fn wake_catchup(&self) {
        self.catchup_notify.notify_one();
    }

    pub fn current_revision(&self) -> Revision {
        self.state.lock().current_revision
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn stats(&self) -> WatchStats {
        let state = self.state.lock();
        let current = state.current_revision;
        let mut watchers: Vec<WatcherLag> = state
            .watchers
            .values()
            .map(|w| WatcherLag {
                stream_id: w.stream_id,
                watch_id: w.id,
                state: w.state,
                lag: match w.state {
                    WatcherState::Synced => 0,
                    _ => (current + 1).saturating_sub(w.cursor),
                },
            })
            .collect();
        watchers.sort_by_key(|w| (w.stream_id, w.watch_id));

        WatchStats {
            current_revision: current,
            active: state.watchers.len(),
            synced: state.synced.len(),
            unsynced: state.unsynced.len(),
            streams: state.streams.len(),
            watchers,
        }
    }

    /// Opens a watch session: the request side and its response stream
    pub fn new_stream(self: &Arc<Self>) -> (WatchStream, WatchResponses) {
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            state.streams.insert(id, StreamWatchers::default());
        }
        if self.config.enable_metrics {
            WATCH_STREAM_TOTAL.inc();
        }
        info!(stream_id = id, "watch stream opened");

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            WatchStream::new(id, self.clone(), control_tx),
            WatchResponses::new(id, control_rx),
        )
    }

    pub(crate) fn close_stream(
        &self,
        stream_id: StreamId,
    ) {
        let mut state = self.state.lock();
        let Some(stream) = state.streams.remove(&stream_id) else {
            return;
        };
        let count = stream.ids.len();
        for key in stream.ids.into_values() {
            state.cancel_watcher(key, CancelReason::StreamClosed);
        }
        state.refresh_gauges();
        drop(state);

        if self.config.enable_metrics {
            WATCH_STREAM_TOTAL.dec();
        }
        info!(stream_id, watchers = count, "watch stream closed");
    }

    pub(crate) fn register(
        &self,
        stream_id: StreamId,
        request: WatchCreateRequest,
    ) -> std::result::Result<Registered, WatchError> {
        let range = KeyRange::new(request.key.clone(), request.range_end.clone())?;
        let key = WatcherKey(self.next_watcher.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.watcher_buffer_size);
        let (terminal_tx, terminal_rx) = oneshot::channel();

        let mut state = self.state.lock();
        let current = state.current_revision;
        let stream = state.streams.get_mut(&stream_id).ok_or(WatchError::StreamClosed)?;
        let watch_id = match request.watch_id {
            None => stream.allocate(),
            Some(id) if id < 0 => return Err(WatchError::InvalidWatchId(id)),
            Some(id) if stream.ids.contains_key(&id) => return Err(WatchError::WatchIdExists(id)),
            Some(id) => id,
        };
        stream.ids.insert(watch_id, key);

        let selector = EventSelector {
            range,
            filters: request.filters,
            prev_kv: request.prev_kv,
        };
        let mut watcher = Watcher::new(
            key,
            stream_id,
            watch_id,
            request.start_revision,
            selector,
            request.progress_notify,
            tx,
            terminal_tx,
        );
        // The channel is fresh, the acknowledgment always fits
        let _ = watcher.try_deliver(WatchResponse::created(watch_id, current));

        let synced = request.start_revision == 0 || request.start_revision == current + 1;
        if synced {
            watcher.state = WatcherState::Synced;
            watcher.cursor = current + 1;
            state.synced.add(key, watcher.range());
        } else {
            watcher.state = WatcherState::Unsynced;
            state.unsynced.add(key, watcher.range());
        }
        debug!(
            stream_id,
            watch_id,
            start_revision = watcher.start_revision,
            current_revision = current,
            synced,
            "watcher created"
        );
        state.watchers.insert(key, watcher);
        state.refresh_gauges();
        drop(state);

        if !synced {
            self.catchup_notify.notify_one();
        }

        let outlet = WatcherOutlet::new(
            key,
            watch_id,
            rx,
            terminal_rx,
            request.fragment,
            &self.config,
            self.weak_self.clone(),
        );
        Ok(Registered {
            key,
            watch_id,
            revision: current,
            outlet,
        })
    }

    /// Explicit cancel by stream-local id; `false` if the id is not live
    pub(crate) fn cancel(
        &self,
        stream_id: StreamId,
        watch_id: WatchId,
    ) -> bool {
        let mut state = self.state.lock();
        let key = state
            .streams
            .get(&stream_id)
            .and_then(|stream| stream.ids.get(&watch_id))
            .copied();
        let Some(key) = key else {
            return false;
        };
        let cancelled = state.cancel_watcher(key, CancelReason::ExplicitCancel);
        state.refresh_gauges();
        cancelled
    }

    pub(crate) fn cancel_key(
        &self,
        key: WatcherKey,
        reason: CancelReason,
    ) -> bool {
        let mut state = self.state.lock();
        let cancelled = state.cancel_watcher(key, reason);
        state.refresh_gauges();
        cancelled
    }

    /// Progress for one watch id, or for every watcher of the stream when
    /// `watch_id` is `None`. Unsynced watchers are skipped.
    pub(crate) fn request_progress(
        &self,
        stream_id: StreamId,
        watch_id: Option<WatchId>,
    ) -> std::result::Result<usize, WatchError> {
        let mut state = self.state.lock();
        let stream = state.streams.get(&stream_id).ok_or(WatchError::StreamClosed)?;
        let keys: Vec<WatcherKey> = match watch_id {
            Some(id) => vec![*stream.ids.get(&id).ok_or(WatchError::InvalidWatchId(id))?],
            None => stream.ids.values().copied().collect(),
        };
        let sent = progress::request_progress(&mut state, &keys);
        state.refresh_gauges();
        Ok(sent)
    }

    pub(crate) fn watch_ids(
        &self,
        stream_id: StreamId,
    ) -> Vec<WatchId> {
        let state = self.state.lock();
        let mut ids: Vec<WatchId> = state
            .streams
            .get(&stream_id)
            .map(|stream| stream.ids.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

impl Drop for WatchEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
