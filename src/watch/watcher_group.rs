use std::collections::HashMap;
use std::collections::HashSet;

use bytes::Bytes;

use super::interval_tree::IntervalTree;
use crate::KeyRange;
use crate::WatcherKey;

/// Membership set of watchers plus a key index for fan-out
///
/// Single-key watchers are looked up by exact key; every other range goes
/// into the interval tree.
#[derive(Debug, Default)]
pub(crate) struct WatcherGroup {
    members: HashSet<WatcherKey>,
    points: HashMap<Bytes, HashSet<WatcherKey>>,
    ranges: IntervalTree<WatcherKey>,
}

impl WatcherGroup {
    pub(crate) fn add(
        &mut self,
        key: WatcherKey,
        range: &KeyRange,
    ) -> bool {
        if !self.members.insert(key) {
            return false;
        }
        if range.is_point() {
            self.points.entry(range.start().clone()).or_default().insert(key);
        } else {
            self.ranges.insert(range, key);
        }
        true
    }

    pub(crate) fn remove(
        &mut self,
        key: WatcherKey,
        range: &KeyRange,
    ) -> bool {
        if !self.members.remove(&key) {
            return false;
        }
        if range.is_point() {
            if let Some(set) = self.points.get_mut(range.start().as_ref()) {
                set.remove(&key);
                if set.is_empty() {
                    self.points.remove(range.start().as_ref());
                }
            }
        } else {
            self.ranges.remove(range, key);
        }
        true
    }

    pub(crate) fn contains(
        &self,
        key: WatcherKey,
    ) -> bool {
        self.members.contains(&key)
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = WatcherKey> + '_ {
        self.members.iter().copied()
    }

    /// Appends every member whose range contains `key`
    pub(crate) fn matching(
        &self,
        key: &[u8],
        out: &mut Vec<WatcherKey>,
    ) {
        if let Some(set) = self.points.get(key) {
            out.extend(set.iter().copied());
        }
        self.ranges.stab(key, out);
    }

    #[cfg(test)]
    pub(crate) fn range_count(&self) -> usize {
        self.ranges.len()
    }
}
