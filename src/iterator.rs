//! Internal iteration capability shared by the memtable, miniruns, leaves
//! and the merged read path.
//!
//! Iterators walk internal keys (user key + tag) in internal-key order:
//! user key ascending, sequence descending. [`DbIter`] layers user-visible
//! semantics on top: one entry per user key, newest version visible at the
//! read sequence, tombstones hidden.

use crate::error::Result;
use crate::format::{self, SequenceNumber, ValueType};

/// Capability interface for internal iterators.
///
/// `key`/`value` may only be called while `valid()`. Backward iteration is
/// not supported by the PM-backed sources; `prev` records an `Unsupported`
/// status instead of misbehaving.
pub trait InternalIterator: Send {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self);
    /// Positions at the first entry ordering at or after `target`, an
    /// internal key.
    fn seek(&mut self, target: &[u8]);
    fn next(&mut self);
    fn prev(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn status(&self) -> Result<()>;
}

pub type BoxedInternalIterator = Box<dyn InternalIterator>;

/// Merges children in internal-key order. On ties the lower child index
/// wins, so callers list newer sources first.
pub struct MergingIterator {
    children: Vec<BoxedInternalIterator>,
    current: Option<usize>,
}

impl MergingIterator {
    pub fn new(children: Vec<BoxedInternalIterator>) -> Self {
        Self {
            children,
            current: None,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if format::compare_internal_keys(child.key(), self.children[s].key())
                        == std::cmp::Ordering::Less
                    {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.find_smallest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.find_smallest();
    }

    fn next(&mut self) {
        if let Some(current) = self.current {
            self.children[current].next();
            self.find_smallest();
        }
    }

    fn prev(&mut self) {
        for child in &mut self.children {
            child.prev();
        }
        self.current = None;
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("key() on invalid iterator")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("value() on invalid iterator")].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

/// User-visible iterator: yields the newest version of each user key
/// visible at `sequence`, hiding tombstones and every older version.
///
/// Leaf split consumes this iterator through [`DbIter::internal_key`] so
/// retained versions keep their original sequence numbers.
pub struct DbIter {
    inner: BoxedInternalIterator,
    sequence: SequenceNumber,
    valid: bool,
    status: Result<()>,
}

impl DbIter {
    pub fn new(inner: BoxedInternalIterator, sequence: SequenceNumber) -> Self {
        Self {
            inner,
            sequence,
            valid: false,
            status: Ok(()),
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
        self.find_next_user_entry(false, &mut Vec::new());
    }

    /// Positions at the first visible user key ≥ `user_key`.
    pub fn seek(&mut self, user_key: &[u8]) {
        self.inner.seek(&format::seek_key(user_key, self.sequence));
        self.find_next_user_entry(false, &mut Vec::new());
    }

    pub fn next(&mut self) {
        if !self.valid {
            return;
        }
        let mut skip = format::user_key(self.inner.key()).to_vec();
        self.inner.next();
        self.find_next_user_entry(true, &mut skip);
    }

    /// The current user key.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        format::user_key(self.inner.key())
    }

    /// The full internal key of the version being yielded.
    pub fn internal_key(&self) -> &[u8] {
        debug_assert!(self.valid);
        self.inner.key()
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        self.inner.value()
    }

    pub fn status(&self) -> Result<()> {
        self.status.clone()?;
        self.inner.status()
    }

    /// Advances `inner` until it rests on a visible, non-shadowed,
    /// non-deleted entry. `skipping` suppresses entries whose user key is
    /// ≤ `skip` (already yielded or deleted).
    fn find_next_user_entry(&mut self, mut skipping: bool, skip: &mut Vec<u8>) {
        while self.inner.valid() {
            let parsed = match format::parse_internal_key(self.inner.key()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.status = Err(e);
                    self.valid = false;
                    return;
                }
            };
            if parsed.sequence <= self.sequence {
                match parsed.vtype {
                    ValueType::Deletion => {
                        // Every older version of this key is shadowed.
                        skip.clear();
                        skip.extend_from_slice(parsed.user_key);
                        skipping = true;
                    }
                    ValueType::Value => {
                        if !(skipping && parsed.user_key <= skip.as_slice()) {
                            self.valid = true;
                            return;
                        }
                    }
                }
            }
            self.inner.next();
        }
        self.valid = false;
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// In-memory internal iterator over pre-sorted entries, for tests.
    pub struct VecIterator {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        pos: usize,
        status: Result<()>,
    }

    impl VecIterator {
        pub fn new(mut entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            entries.sort_by(|a, b| format::compare_internal_keys(&a.0, &b.0));
            Self {
                entries,
                pos: usize::MAX,
                status: Ok(()),
            }
        }
    }

    impl InternalIterator for VecIterator {
        fn valid(&self) -> bool {
            self.pos < self.entries.len()
        }

        fn seek_to_first(&mut self) {
            self.pos = 0;
        }

        fn seek(&mut self, target: &[u8]) {
            self.pos = self
                .entries
                .partition_point(|(k, _)| {
                    format::compare_internal_keys(k, target) == std::cmp::Ordering::Less
                });
        }

        fn next(&mut self) {
            if self.valid() {
                self.pos += 1;
            }
        }

        fn prev(&mut self) {
            self.status = Err(crate::error::Error::Unsupported(
                "backward iteration".to_string(),
            ));
            self.pos = usize::MAX;
        }

        fn key(&self) -> &[u8] {
            &self.entries[self.pos].0
        }

        fn value(&self) -> &[u8] {
            &self.entries[self.pos].1
        }

        fn status(&self) -> Result<()> {
            self.status.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::VecIterator;
    use super::*;
    use crate::format::{append_internal_key, ValueType};

    fn ikey(user_key: &[u8], seq: u64, vtype: ValueType) -> Vec<u8> {
        let mut buf = Vec::new();
        append_internal_key(&mut buf, user_key, seq, vtype);
        buf
    }

    fn collect_user_view(iter: &mut DbIter) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        out
    }

    #[test]
    fn test_merge_orders_across_children() {
        let a = VecIterator::new(vec![
            (ikey(b"a", 3, ValueType::Value), b"a3".to_vec()),
            (ikey(b"c", 1, ValueType::Value), b"c1".to_vec()),
        ]);
        let b = VecIterator::new(vec![(ikey(b"b", 2, ValueType::Value), b"b2".to_vec())]);
        let mut merged = MergingIterator::new(vec![Box::new(a), Box::new(b)]);

        merged.seek_to_first();
        let mut keys = Vec::new();
        while merged.valid() {
            keys.push(format::user_key(merged.key()).to_vec());
            merged.next();
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_merge_newest_version_first_within_key() {
        let old = VecIterator::new(vec![(ikey(b"k", 1, ValueType::Value), b"old".to_vec())]);
        let new = VecIterator::new(vec![(ikey(b"k", 5, ValueType::Value), b"new".to_vec())]);
        let mut merged = MergingIterator::new(vec![Box::new(new), Box::new(old)]);

        merged.seek_to_first();
        assert!(merged.valid());
        assert_eq!(merged.value(), b"new");
        merged.next();
        assert!(merged.valid());
        assert_eq!(merged.value(), b"old");
    }

    #[test]
    fn test_db_iter_hides_tombstones_and_old_versions() {
        let iter = VecIterator::new(vec![
            (ikey(b"a", 1, ValueType::Value), b"a1".to_vec()),
            (ikey(b"b", 3, ValueType::Deletion), Vec::new()),
            (ikey(b"b", 2, ValueType::Value), b"b2".to_vec()),
            (ikey(b"c", 5, ValueType::Value), b"c5".to_vec()),
            (ikey(b"c", 4, ValueType::Value), b"c4".to_vec()),
        ]);
        let mut db_iter = DbIter::new(Box::new(iter), u64::MAX >> 8);
        let entries = collect_user_view(&mut db_iter);
        assert_eq!(
            entries,
            vec![
                (b"a".to_vec(), b"a1".to_vec()),
                (b"c".to_vec(), b"c5".to_vec()),
            ]
        );
    }

    #[test]
    fn test_db_iter_respects_snapshot_sequence() {
        let iter = VecIterator::new(vec![
            (ikey(b"a", 9, ValueType::Value), b"new".to_vec()),
            (ikey(b"a", 2, ValueType::Value), b"old".to_vec()),
        ]);
        let mut db_iter = DbIter::new(Box::new(iter), 5);
        let entries = collect_user_view(&mut db_iter);
        assert_eq!(entries, vec![(b"a".to_vec(), b"old".to_vec())]);
    }

    #[test]
    fn test_db_iter_deletion_above_snapshot_is_invisible() {
        let iter = VecIterator::new(vec![
            (ikey(b"a", 9, ValueType::Deletion), Vec::new()),
            (ikey(b"a", 2, ValueType::Value), b"kept".to_vec()),
        ]);
        let mut db_iter = DbIter::new(Box::new(iter), 5);
        let entries = collect_user_view(&mut db_iter);
        assert_eq!(entries, vec![(b"a".to_vec(), b"kept".to_vec())]);
    }

    #[test]
    fn test_db_iter_seek() {
        let iter = VecIterator::new(vec![
            (ikey(b"a", 1, ValueType::Value), b"1".to_vec()),
            (ikey(b"c", 2, ValueType::Value), b"2".to_vec()),
            (ikey(b"e", 3, ValueType::Value), b"3".to_vec()),
        ]);
        let mut db_iter = DbIter::new(Box::new(iter), u64::MAX >> 8);
        db_iter.seek(b"b");
        assert!(db_iter.valid());
        assert_eq!(db_iter.key(), b"c");
    }

    #[test]
    fn test_prev_is_unsupported_not_a_panic() {
        let mut iter = VecIterator::new(vec![(ikey(b"a", 1, ValueType::Value), b"1".to_vec())]);
        iter.seek_to_first();
        iter.prev();
        assert!(matches!(
            iter.status(),
            Err(crate::error::Error::Unsupported(_))
        ));
    }
}
