use bytes::Bytes;
use bytes::BytesMut;

use crate::WatchError;
use crate::FROM_KEY_RANGE_END;

/// Half-open key interval `[start, end)`
///
/// A point range is stored as `[key, key + "\0")` so that point, bounded and
/// unbounded ranges share one containment rule. `end == None` means there is
/// no upper bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    start: Bytes,
    end: Option<Bytes>,
}

impl KeyRange {
    /// Build a range from the wire form used by watch requests.
    ///
    /// - empty `range_end`: the single key `key`
    /// - `range_end == "\0"`: every key `>= key` (every key when `key` is empty)
    /// - otherwise `[key, range_end)`, which must be non-empty
    pub fn new(
        key: impl Into<Bytes>,
        range_end: impl Into<Bytes>,
    ) -> Result<Self, WatchError> {
        let start = key.into();
        let range_end = range_end.into();

        if range_end.is_empty() {
            return Ok(Self::point(start));
        }
        if range_end.as_ref() == FROM_KEY_RANGE_END {
            return Ok(Self::from_key(start));
        }
        if range_end <= start {
            return Err(WatchError::InvalidRange {
                key: start.to_vec(),
                range_end: range_end.to_vec(),
            });
        }
        Ok(Self {
            start,
            end: Some(range_end),
        })
    }

    pub fn point(key: impl Into<Bytes>) -> Self {
        let start = key.into();
        let end = successor(&start);
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn from_key(key: impl Into<Bytes>) -> Self {
        Self {
            start: key.into(),
            end: None,
        }
    }

    /// Every key carrying `prefix`
    pub fn prefix(prefix: impl Into<Bytes>) -> Self {
        let start = prefix.into();
        let end = prefix_end(&start);
        Self { start, end }
    }

    pub fn all() -> Self {
        Self::from_key(Bytes::new())
    }

    pub fn start(&self) -> &Bytes {
        &self.start
    }

    /// Exclusive upper bound, `None` when unbounded
    pub fn end(&self) -> Option<&Bytes> {
        self.end.as_ref()
    }

    pub fn is_point(&self) -> bool {
        match &self.end {
            Some(end) => {
                end.len() == self.start.len() + 1
                    && end.starts_with(&self.start)
                    && end[end.len() - 1] == 0
            }
            None => false,
        }
    }

    pub fn contains(
        &self,
        key: &[u8],
    ) -> bool {
        key >= self.start.as_ref()
            && match &self.end {
                Some(end) => key < end.as_ref(),
                None => true,
            }
    }

    /// `range_end` as carried on the wire: empty for a point, `"\0"` when unbounded
    pub fn wire_range_end(&self) -> Bytes {
        if self.is_point() {
            return Bytes::new();
        }
        match &self.end {
            Some(end) => end.clone(),
            None => Bytes::from_static(FROM_KEY_RANGE_END),
        }
    }

    /// Smallest range covering both `self` and `other`
    pub fn covering(
        &self,
        other: &KeyRange,
    ) -> KeyRange {
        let start = std::cmp::min(&self.start, &other.start).clone();
        let end = match (&self.end, &other.end) {
            (Some(a), Some(b)) => Some(std::cmp::max(a, b).clone()),
            _ => None,
        };
        KeyRange { start, end }
    }
}

/// Smallest key strictly greater than `key`
fn successor(key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(key.len() + 1);
    buf.extend_from_slice(key);
    buf.extend_from_slice(&[0]);
    buf.freeze()
}

/// Exclusive end of the keys sharing `prefix`; `None` if no such bound exists
fn prefix_end(prefix: &[u8]) -> Option<Bytes> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(Bytes::from(end));
        }
        end.pop();
    }
    None
}
