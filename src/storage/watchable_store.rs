use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::MemStore;
use crate::Result;
use crate::Revision;
use crate::RevisionSource;
use crate::WatchConfig;
use crate::WatchEngine;
use crate::WatchResponses;
use crate::WatchStream;
use crate::WriteOp;

/// A [`MemStore`] whose commits are fanned out to a [`WatchEngine`]
///
/// Commits and their notification happen under one lock, so the engine always
/// observes revision batches in commit order.
pub struct WatchableStore {
    store: Arc<MemStore>,
    engine: Arc<WatchEngine>,
    commit_lock: Mutex<()>,
}

impl WatchableStore {
    pub fn new(config: WatchConfig) -> Self {
        let store = Arc::new(MemStore::new());
        let engine = WatchEngine::new(config, store.clone());
        Self {
            store,
            engine,
            commit_lock: Mutex::new(()),
        }
    }

    /// Starts the engine's background tasks. Requires a tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.engine.start()
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    pub fn engine(&self) -> &Arc<WatchEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<MemStore> {
        &self.store
    }

    /// Opens a new watch session
    pub fn watch_stream(&self) -> (WatchStream, WatchResponses) {
        self.engine.new_stream()
    }

    pub fn current_revision(&self) -> Revision {
        self.store.current_revision()
    }

    /// Returns the revision the put committed at
    pub fn put(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Revision> {
        self.txn(vec![WriteOp::put(key, value)])
    }

    /// Deletes every key in `[key, range_end)`; returns the store revision
    /// after the call, unchanged when nothing matched
    pub fn delete_range(
        &self,
        key: impl Into<Bytes>,
        range_end: impl Into<Bytes>,
    ) -> Result<Revision> {
        self.txn(vec![WriteOp::delete_range(key, range_end)])
    }

    /// Commits `ops` at one revision and notifies the engine
    pub fn txn(
        &self,
        ops: Vec<WriteOp>,
    ) -> Result<Revision> {
        let _guard = self.commit_lock.lock();
        match self.store.apply(ops)? {
            Some(batch) => {
                self.engine.notify(&batch);
                Ok(batch.revision)
            }
            None => Ok(self.store.current_revision()),
        }
    }

    /// Discards history below `revision` and lets the catch-up loop cancel
    /// watchers that still needed it
    pub fn compact(
        &self,
        revision: Revision,
    ) -> Result<()> {
        self.store.compact(revision)?;
        self.engine.wake_catchup();
        Ok(())
    }
}

impl Drop for WatchableStore {
    fn drop(&mut self) {
        self.engine.stop();
    }
}
