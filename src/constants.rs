/// Watch id carried by responses that could not be bound to a live watcher
pub const INVALID_WATCH_ID: i64 = -1;

/// Revision of a freshly created store; the first write commits `INITIAL_REVISION + 1`
pub const INITIAL_REVISION: u64 = 1;

/// `range_end` value meaning "every key >= key"
pub const FROM_KEY_RANGE_END: &[u8] = &[0];

pub const COMPACTED_REASON: &str = "mvcc: required revision has been compacted";
pub const WATCH_ID_NOT_FOUND_REASON: &str = "watch id not found";

// Framing overhead used when estimating the encoded size of a response
pub(crate) const KEY_VALUE_OVERHEAD_BYTES: usize = 24;
pub(crate) const EVENT_OVERHEAD_BYTES: usize = 8;
pub(crate) const RESPONSE_OVERHEAD_BYTES: usize = 32;
