//! Interval index over key ranges.
//!
//! A treap ordered by `(start, value)` where every node also tracks the
//! largest upper bound in its subtree, so a stabbing query can skip subtrees
//! that end at or before the probed key. Expected depth is logarithmic in the
//! number of intervals.

use std::cmp::Ordering;

use bytes::Bytes;

use crate::KeyRange;

/// Exclusive upper bound of an interval; `Infinite` sorts above every key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Limit {
    Key(Bytes),
    Infinite,
}

impl Limit {
    fn of(range: &KeyRange) -> Self {
        match range.end() {
            Some(end) => Limit::Key(end.clone()),
            None => Limit::Infinite,
        }
    }

    /// `point < self`
    fn above(
        &self,
        point: &[u8],
    ) -> bool {
        match self {
            Limit::Key(end) => point < end.as_ref(),
            Limit::Infinite => true,
        }
    }
}

type Link<V> = Option<Box<Node<V>>>;

#[derive(Debug)]
struct Node<V> {
    start: Bytes,
    end: Limit,
    value: V,
    priority: u64,
    max_end: Limit,
    left: Link<V>,
    right: Link<V>,
}

impl<V> Node<V> {
    fn update(&mut self) {
        let mut max_end = self.end.clone();
        for child in [&self.left, &self.right].into_iter().flatten() {
            if child.max_end > max_end {
                max_end = child.max_end.clone();
            }
        }
        self.max_end = max_end;
    }
}

#[derive(Debug)]
pub(crate) struct IntervalTree<V> {
    root: Link<V>,
    len: usize,
}

impl<V> Default for IntervalTree<V> {
    fn default() -> Self {
        Self { root: None, len: 0 }
    }
}

impl<V: Ord + Copy> IntervalTree<V> {
    /// `(range, value)` pairs must be unique
    pub(crate) fn insert(
        &mut self,
        range: &KeyRange,
        value: V,
    ) {
        let end = Limit::of(range);
        let node = Box::new(Node {
            start: range.start().clone(),
            max_end: end.clone(),
            end,
            value,
            priority: rand::random(),
            left: None,
            right: None,
        });
        let (less, rest) = split(self.root.take(), range.start(), value);
        self.root = merge(merge(less, Some(node)), rest);
        self.len += 1;
    }

    pub(crate) fn remove(
        &mut self,
        range: &KeyRange,
        value: V,
    ) -> bool {
        let removed = remove_node(&mut self.root, range.start(), value);
        if removed {
            self.len -= 1;
        }
        removed
    }

    /// Appends the value of every interval containing `point`
    pub(crate) fn stab(
        &self,
        point: &[u8],
        out: &mut Vec<V>,
    ) {
        stab_node(&self.root, point, out);
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Splits into nodes ordered before `(start, value)` and the rest
fn split<V: Ord + Copy>(
    link: Link<V>,
    start: &Bytes,
    value: V,
) -> (Link<V>, Link<V>) {
    match link {
        None => (None, None),
        Some(mut node) => {
            if (&node.start, node.value) < (start, value) {
                let (less, rest) = split(node.right.take(), start, value);
                node.right = less;
                node.update();
                (Some(node), rest)
            } else {
                let (less, rest) = split(node.left.take(), start, value);
                node.left = rest;
                node.update();
                (less, Some(node))
            }
        }
    }
}

/// Joins two treaps where every node of `left` orders before every node of `right`
fn merge<V>(
    left: Link<V>,
    right: Link<V>,
) -> Link<V> {
    match (left, right) {
        (None, right) => right,
        (left, None) => left,
        (Some(mut l), Some(mut r)) => {
            if l.priority > r.priority {
                l.right = merge(l.right.take(), Some(r));
                l.update();
                Some(l)
            } else {
                r.left = merge(Some(l), r.left.take());
                r.update();
                Some(r)
            }
        }
    }
}

fn remove_node<V: Ord + Copy>(
    link: &mut Link<V>,
    start: &Bytes,
    value: V,
) -> bool {
    let removed = match link {
        None => false,
        Some(node) => match (&node.start, node.value).cmp(&(start, value)) {
            Ordering::Less => remove_node(&mut node.right, start, value),
            Ordering::Greater => remove_node(&mut node.left, start, value),
            Ordering::Equal => {
                let left = node.left.take();
                let right = node.right.take();
                *link = merge(left, right);
                return true;
            }
        },
    };
    if removed {
        if let Some(node) = link {
            node.update();
        }
    }
    removed
}

fn stab_node<V: Copy>(
    link: &Link<V>,
    point: &[u8],
    out: &mut Vec<V>,
) {
    let Some(node) = link else {
        return;
    };
    if !node.max_end.above(point) {
        return;
    }
    stab_node(&node.left, point, out);
    // this node and its right subtree all start after `point`
    if node.start.as_ref() > point {
        return;
    }
    if node.end.above(point) {
        out.push(node.value);
    }
    stab_node(&node.right, point, out);
}
