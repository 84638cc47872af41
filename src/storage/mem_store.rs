//! In-memory multi-version key-value store.
//!
//! Keeps the latest version of every live key plus the full event history
//! above the compaction boundary. Every committed write produces one
//! [`RevisionBatch`]; writes with no effect do not consume a revision.

use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;
use tracing::trace;

use crate::Event;
use crate::EventIter;
use crate::KeyRange;
use crate::KeyValue;
use crate::Result;
use crate::Revision;
use crate::RevisionBatch;
use crate::RevisionSource;
use crate::StorageError;
use crate::INITIAL_REVISION;

/// One mutation inside a write batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Bytes, value: Bytes },
    /// Same `range_end` conventions as a watch request
    Delete { key: Bytes, range_end: Bytes },
}

impl WriteOp {
    pub fn put(
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        WriteOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        WriteOp::Delete {
            key: key.into(),
            range_end: Bytes::new(),
        }
    }

    pub fn delete_range(
        key: impl Into<Bytes>,
        range_end: impl Into<Bytes>,
    ) -> Self {
        WriteOp::Delete {
            key: key.into(),
            range_end: range_end.into(),
        }
    }
}

#[derive(Debug)]
struct MemStoreInner {
    current_revision: Revision,
    compact_revision: Revision,
    latest: BTreeMap<Bytes, KeyValue>,
    history: BTreeMap<Revision, Vec<Event>>,
}

#[derive(Debug)]
pub struct MemStore {
    inner: RwLock<MemStoreInner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemStoreInner {
                current_revision: INITIAL_REVISION,
                compact_revision: 0,
                latest: BTreeMap::new(),
                history: BTreeMap::new(),
            }),
        }
    }

    /// Applies `ops` atomically at the next revision.
    ///
    /// Returns `None` (and leaves the revision untouched) when no op changed
    /// anything, e.g. a delete over an empty range.
    pub fn apply(
        &self,
        ops: Vec<WriteOp>,
    ) -> Result<Option<RevisionBatch>> {
        // Validate every range before touching state
        let ops = ops
            .into_iter()
            .map(|op| match op {
                WriteOp::Put { key, value } => Ok(Mutation::Put(key, value)),
                WriteOp::Delete { key, range_end } => {
                    Ok(Mutation::Delete(KeyRange::new(key, range_end)?))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mut inner = self.inner.write();
        let revision = inner.current_revision + 1;
        let mut events = Vec::new();

        for op in ops {
            match op {
                Mutation::Put(key, value) => {
                    let prev = inner.latest.get(&key).cloned();
                    let kv = KeyValue {
                        key: key.clone(),
                        value,
                        create_revision: prev
                            .as_ref()
                            .map(|p| p.create_revision)
                            .unwrap_or(revision),
                        mod_revision: revision,
                        version: prev.as_ref().map(|p| p.version + 1).unwrap_or(1),
                        lease: 0,
                    };
                    inner.latest.insert(key, kv.clone());
                    events.push(Event::put(kv, prev));
                }
                Mutation::Delete(range) => {
                    let doomed: Vec<Bytes> = inner
                        .latest
                        .range(range.start().clone()..)
                        .take_while(|(k, _)| range.contains(k))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        let prev = inner.latest.remove(&key);
                        events.push(Event::delete(key, revision, prev));
                    }
                }
            }
        }

        if events.is_empty() {
            trace!(
                "write batch had no effect; revision stays at {}",
                inner.current_revision
            );
            return Ok(None);
        }

        inner.current_revision = revision;
        inner.history.insert(revision, events.clone());
        trace!(revision, events = events.len(), "committed");

        Ok(Some(RevisionBatch { revision, events }))
    }

    pub fn put(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Option<RevisionBatch>> {
        self.apply(vec![WriteOp::put(key, value)])
    }

    /// Latest live version of `key`
    pub fn get(
        &self,
        key: &[u8],
    ) -> Option<KeyValue> {
        self.inner.read().latest.get(key).cloned()
    }

    /// Discards history strictly older than `revision`.
    ///
    /// # Errors
    /// `StorageError::InvalidCompaction` when `revision` is above the current
    /// revision or not above the existing boundary.
    pub fn compact(
        &self,
        revision: Revision,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if revision > inner.current_revision || revision <= inner.compact_revision {
            return Err(StorageError::InvalidCompaction {
                requested: revision,
                current: inner.current_revision,
                compact_revision: inner.compact_revision,
            }
            .into());
        }

        inner.history = inner.history.split_off(&revision);
        inner.compact_revision = revision;
        debug!(revision, "compacted history");
        Ok(())
    }
}

enum Mutation {
    Put(Bytes, Bytes),
    Delete(KeyRange),
}

impl RevisionSource for MemStore {
    fn read_range(
        &self,
        from_revision: Revision,
        to_revision: Revision,
        range: &KeyRange,
    ) -> Result<EventIter> {
        let inner = self.inner.read();
        if from_revision < inner.compact_revision {
            return Err(StorageError::Compacted {
                requested: from_revision,
                compact_revision: inner.compact_revision,
            }
            .into());
        }
        if from_revision > inner.current_revision + 1 {
            return Err(StorageError::FutureRevision {
                requested: from_revision,
                current: inner.current_revision,
            }
            .into());
        }
        if to_revision <= from_revision {
            return Ok(Box::new(std::iter::empty()));
        }

        let events: Vec<Event> = inner
            .history
            .range(from_revision..to_revision)
            .flat_map(|(_, events)| events.iter())
            .filter(|e| range.contains(e.key()))
            .cloned()
            .collect();

        Ok(Box::new(events.into_iter().map(Ok)))
    }

    fn current_revision(&self) -> Revision {
        self.inner.read().current_revision
    }

    fn compaction_boundary(&self) -> Revision {
        self.inner.read().compact_revision
    }
}
