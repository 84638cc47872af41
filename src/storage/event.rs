use bytes::Bytes;

use crate::EVENT_OVERHEAD_BYTES;
use crate::KEY_VALUE_OVERHEAD_BYTES;

/// Monotonically increasing identifier of one committed mutation batch
pub type Revision = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Key was created or updated
    Put,
    /// Key was deleted
    Delete,
}

/// One version of a key
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyValue {
    pub key: Bytes,
    /// Empty for tombstones
    pub value: Bytes,
    /// Revision of the write that created this incarnation of the key
    pub create_revision: Revision,
    /// Revision of the write that produced this version
    pub mod_revision: Revision,
    /// Writes to this incarnation, starting at 1; reset by a delete
    pub version: i64,
    pub lease: i64,
}

impl KeyValue {
    /// Approximate wire size
    pub fn encoded_len(&self) -> usize {
        self.key.len() + self.value.len() + KEY_VALUE_OVERHEAD_BYTES
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub kv: KeyValue,
    /// The key's value immediately before this event, if it existed
    pub prev_kv: Option<KeyValue>,
}

impl Event {
    pub fn put(
        kv: KeyValue,
        prev_kv: Option<KeyValue>,
    ) -> Self {
        Self {
            event_type: EventType::Put,
            kv,
            prev_kv,
        }
    }

    /// Tombstone for `key`: only `key` and `mod_revision` are set
    pub fn delete(
        key: Bytes,
        revision: Revision,
        prev_kv: Option<KeyValue>,
    ) -> Self {
        Self {
            event_type: EventType::Delete,
            kv: KeyValue {
                key,
                mod_revision: revision,
                ..Default::default()
            },
            prev_kv,
        }
    }

    pub fn revision(&self) -> Revision {
        self.kv.mod_revision
    }

    pub fn key(&self) -> &[u8] {
        &self.kv.key
    }

    pub fn encoded_len(&self) -> usize {
        self.kv.encoded_len()
            + self.prev_kv.as_ref().map(KeyValue::encoded_len).unwrap_or(0)
            + EVENT_OVERHEAD_BYTES
    }
}

/// All events committed at one revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionBatch {
    pub revision: Revision,
    pub events: Vec<Event>,
}
