//! Read paths over the leaf tier.
//!
//! A leaf's content is the union of its miniruns; lookups walk them newest
//! to oldest and the first run holding a visible version of the key is
//! authoritative (a tombstone answers "not found"). Scans merge runs in
//! internal-key order.

use std::sync::Arc;

use crate::block::{Block, BlockHandle};
use crate::error::Result;
use crate::filter::BloomFilter;
use crate::format::{self, SequenceNumber, ValueType};
use crate::iterator::{BoxedInternalIterator, DbIter, InternalIterator, MergingIterator};
use crate::leaf::entry::{LeafIndexEntry, MiniRunIndexEntry};
use crate::leaf::index::{LeafIndexDb, LeafSnapshot};
use crate::segment::{Segment, SegmentManager};
use crate::stats::LeafStatStore;

/// An open minirun: the owning segment plus the decoded per-block index
/// that the minirun index entry embeds.
pub struct MiniRun {
    segment: Arc<Segment>,
    /// (first internal key, handle) per data block, in key order.
    blocks: Vec<(Vec<u8>, BlockHandle)>,
}

impl MiniRun {
    pub fn open(segment: Arc<Segment>, index_block: &[u8]) -> Result<Self> {
        let index = Arc::new(Block::decode(index_block.to_vec())?);
        let mut iter = index.iter();
        let mut blocks = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            blocks.push((iter.key().to_vec(), BlockHandle::decode(iter.value())?));
            iter.next();
        }
        iter.status()?;
        Ok(Self { segment, blocks })
    }

    pub fn iter(self: Arc<Self>) -> MiniRunIterator {
        MiniRunIterator::new(self)
    }
}

/// Chains a minirun's data blocks into one internal iterator.
pub struct MiniRunIterator {
    run: Arc<MiniRun>,
    /// Index of the block the current iterator was loaded from.
    block_idx: usize,
    block_iter: Option<crate::block::BlockIterator>,
    status: Result<()>,
}

impl MiniRunIterator {
    fn new(run: Arc<MiniRun>) -> Self {
        Self {
            run,
            block_idx: 0,
            block_iter: None,
            status: Ok(()),
        }
    }

    fn load_block(&mut self, idx: usize) -> bool {
        self.block_iter = None;
        let Some((_, handle)) = self.run.blocks.get(idx) else {
            return false;
        };
        match self.run.segment.read_block(*handle) {
            Ok(block) => {
                self.block_idx = idx;
                self.block_iter = Some(Arc::new(block).iter());
                true
            }
            Err(e) => {
                self.status = Err(e);
                false
            }
        }
    }

    /// Moves to the next block until the current iterator is valid or the
    /// run is exhausted.
    fn skip_empty_blocks_forward(&mut self) {
        while self
            .block_iter
            .as_ref()
            .map(|it| !it.valid())
            .unwrap_or(false)
        {
            let next = self.block_idx + 1;
            if !self.load_block(next) {
                return;
            }
            if let Some(iter) = &mut self.block_iter {
                iter.seek_to_first();
            }
        }
    }
}

impl InternalIterator for MiniRunIterator {
    fn valid(&self) -> bool {
        self.block_iter.as_ref().map(|it| it.valid()).unwrap_or(false)
    }

    fn seek_to_first(&mut self) {
        if self.load_block(0) {
            if let Some(iter) = &mut self.block_iter {
                iter.seek_to_first();
            }
            self.skip_empty_blocks_forward();
        }
    }

    fn seek(&mut self, target: &[u8]) {
        if self.run.blocks.is_empty() {
            self.block_iter = None;
            return;
        }
        // Last block whose first key is ≤ target; the target may still
        // overflow into later blocks, which skip_empty handles.
        let idx = self
            .run
            .blocks
            .partition_point(|(first_key, _)| {
                format::compare_internal_keys(first_key, target) != std::cmp::Ordering::Greater
            })
            .saturating_sub(1);
        if self.load_block(idx) {
            if let Some(iter) = &mut self.block_iter {
                iter.seek(target);
            }
            self.skip_empty_blocks_forward();
        }
    }

    fn next(&mut self) {
        if let Some(iter) = &mut self.block_iter {
            iter.next();
        }
        self.skip_empty_blocks_forward();
    }

    fn prev(&mut self) {
        self.status = Err(crate::error::Error::Unsupported(
            "minirun iterators are forward-only".to_string(),
        ));
        self.block_iter = None;
    }

    fn key(&self) -> &[u8] {
        self.block_iter.as_ref().expect("key() on invalid iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.block_iter
            .as_ref()
            .expect("value() on invalid iterator")
            .value()
    }

    fn status(&self) -> Result<()> {
        self.status.clone()?;
        if let Some(iter) = &self.block_iter {
            iter.status()?;
        }
        Ok(())
    }
}

/// The leaf tier as an ordered store.
#[derive(Clone)]
pub struct LeafStore {
    segments: SegmentManager,
    leaf_index: Arc<LeafIndexDb>,
    stats: Arc<LeafStatStore>,
}

impl LeafStore {
    pub fn new(
        segments: SegmentManager,
        leaf_index: Arc<LeafIndexDb>,
        stats: Arc<LeafStatStore>,
    ) -> Self {
        Self {
            segments,
            leaf_index,
            stats,
        }
    }

    pub fn open_minirun(&self, mre: &MiniRunIndexEntry) -> Result<MiniRun> {
        let segment = self
            .segments
            .get_segment(mre.segment_id())
            .ok_or_else(|| {
                crate::error::Error::Corruption(format!(
                    "leaf references missing segment {}",
                    mre.segment_id()
                ))
            })?;
        MiniRun::open(segment, mre.index_block())
    }

    /// Point lookup at `seq`. `Ok(None)` covers both a missing key and a
    /// tombstone, which shadows every older run.
    pub fn get(&self, user_key: &[u8], seq: SequenceNumber) -> Result<Option<Vec<u8>>> {
        let Some((leaf_key, lie_raw)) = self.leaf_index.seek(user_key, None)? else {
            return Ok(None);
        };
        self.stats.record_read(&leaf_key);
        let lie = LeafIndexEntry::from_bytes(lie_raw)?;
        let seek = format::seek_key(user_key, seq);

        for mre in lie.entries()?.iter().rev() {
            let filter = BloomFilter::decode(mre.filter_block())?;
            if !filter.may_contain(user_key) {
                continue;
            }
            let run = Arc::new(self.open_minirun(mre)?);
            let mut iter = run.iter();
            iter.seek(&seek);
            if iter.valid() {
                let parsed = format::parse_internal_key(iter.key())?;
                if parsed.user_key == user_key {
                    return match parsed.vtype {
                        ValueType::Value => Ok(Some(iter.value().to_vec())),
                        ValueType::Deletion => Ok(None),
                    };
                }
            }
            iter.status()?;
        }
        Ok(None)
    }

    /// Internal iterator merging the inclusive run range `[start_run,
    /// end_run]` of one leaf. Newer runs win merge ties.
    pub fn iter_leaf(
        &self,
        lie: &LeafIndexEntry,
        start_run: u32,
        end_run: u32,
    ) -> Result<MergingIterator> {
        let entries = lie.entries()?;
        if start_run > end_run || end_run as usize >= entries.len() {
            return errinvalid!(
                "run range [{start_run}, {end_run}] out of bounds for {} runs",
                entries.len()
            );
        }
        let mut children: Vec<BoxedInternalIterator> = Vec::new();
        for mre in entries[start_run as usize..=end_run as usize].iter().rev() {
            let run = Arc::new(self.open_minirun(mre)?);
            children.push(Box::new(run.iter()));
        }
        Ok(MergingIterator::new(children))
    }

    /// Tombstone-hiding iterator over a whole leaf. Exposes internal keys
    /// so leaf split preserves the sequence numbers of retained versions.
    pub fn db_iter_for_leaf(&self, lie: &LeafIndexEntry, seq: SequenceNumber) -> Result<DbIter> {
        let runs = lie.num_miniruns();
        if runs == 0 {
            return Ok(DbIter::new(
                Box::new(MergingIterator::new(Vec::new())),
                seq,
            ));
        }
        let inner = self.iter_leaf(lie, 0, runs as u32 - 1)?;
        Ok(DbIter::new(Box::new(inner), seq))
    }

    /// Internal iterator across every leaf, in leaf-index order, with
    /// per-leaf iterators materialized lazily. The leaf set is pinned at
    /// the given leaf-index snapshot.
    pub fn iter(&self, leaf_snapshot: Option<&LeafSnapshot>) -> Result<LeafStoreIterator> {
        let mut leaves = Vec::new();
        for (max_key, raw) in self.leaf_index.scan(leaf_snapshot)? {
            leaves.push((max_key, LeafIndexEntry::from_bytes(raw)?));
        }
        Ok(LeafStoreIterator {
            store: self.clone(),
            leaves,
            leaf_idx: 0,
            current: None,
            status: Ok(()),
        })
    }

    pub fn leaf_index(&self) -> &Arc<LeafIndexDb> {
        &self.leaf_index
    }

    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    pub fn stats(&self) -> &Arc<LeafStatStore> {
        &self.stats
    }
}

/// Merging view across all leaves; leaves are disjoint key ranges so a
/// simple cursor over per-leaf iterators suffices.
pub struct LeafStoreIterator {
    store: LeafStore,
    leaves: Vec<(Vec<u8>, LeafIndexEntry)>,
    leaf_idx: usize,
    current: Option<MergingIterator>,
    status: Result<()>,
}

impl LeafStoreIterator {
    fn open_leaf(&mut self, idx: usize) -> bool {
        self.current = None;
        let Some((_, lie)) = self.leaves.get(idx) else {
            return false;
        };
        self.leaf_idx = idx;
        if lie.num_miniruns() == 0 {
            self.current = Some(MergingIterator::new(Vec::new()));
            return true;
        }
        match self
            .store
            .iter_leaf(lie, 0, lie.num_miniruns() as u32 - 1)
        {
            Ok(iter) => {
                self.current = Some(iter);
                true
            }
            Err(e) => {
                self.status = Err(e);
                false
            }
        }
    }

    fn skip_exhausted_leaves(&mut self) {
        while self
            .current
            .as_ref()
            .map(|it| !it.valid())
            .unwrap_or(false)
        {
            let next = self.leaf_idx + 1;
            if !self.open_leaf(next) {
                return;
            }
            if let Some(iter) = &mut self.current {
                iter.seek_to_first();
            }
        }
    }
}

impl InternalIterator for LeafStoreIterator {
    fn valid(&self) -> bool {
        self.current.as_ref().map(|it| it.valid()).unwrap_or(false)
    }

    fn seek_to_first(&mut self) {
        if self.open_leaf(0) {
            if let Some(iter) = &mut self.current {
                iter.seek_to_first();
            }
            self.skip_exhausted_leaves();
        }
    }

    fn seek(&mut self, target: &[u8]) {
        let user_key = format::user_key(target);
        // Leaf max keys are inclusive upper bounds.
        let idx = self
            .leaves
            .partition_point(|(max_key, _)| max_key.as_slice() < user_key);
        if self.open_leaf(idx) {
            if let Some(iter) = &mut self.current {
                iter.seek(target);
            }
            self.skip_exhausted_leaves();
        }
    }

    fn next(&mut self) {
        if let Some(iter) = &mut self.current {
            iter.next();
        }
        self.skip_exhausted_leaves();
    }

    fn prev(&mut self) {
        self.status = Err(crate::error::Error::Unsupported(
            "leaf store iterators are forward-only".to_string(),
        ));
        self.current = None;
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().expect("key() on invalid iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.current
            .as_ref()
            .expect("value() on invalid iterator")
            .value()
    }

    fn status(&self) -> Result<()> {
        self.status.clone()?;
        if let Some(iter) = &self.current {
            iter.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::leaf::entry::LeafIndexEntryBuilder;
    use crate::tmpfs::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: LeafStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let opts = Options::new(dir.path()).nvmleafindex_size(1 << 20);
        let segments = SegmentManager::open(&opts).unwrap();
        let leaf_index = Arc::new(LeafIndexDb::open(&opts).unwrap());
        let stats = Arc::new(LeafStatStore::new());
        Fixture {
            _dir: dir,
            store: LeafStore::new(segments, leaf_index, stats),
        }
    }

    /// Builds one minirun holding `entries` (internal keys in order) and
    /// returns its MRE.
    fn build_run(store: &LeafStore, entries: &[(&str, u64, ValueType, &str)]) -> MiniRunIndexEntry {
        let (seg_id, mut builder) = store.segments.new_segment_builder(false).unwrap();
        builder.start_minirun().unwrap();
        for (user_key, seq, vtype, value) in entries {
            let mut ikey = Vec::new();
            format::append_internal_key(&mut ikey, user_key.as_bytes(), *seq, *vtype);
            builder.add(&ikey, value.as_bytes()).unwrap();
        }
        let run_no = builder.finish_minirun().unwrap();
        let mre = MiniRunIndexEntry::build(
            seg_id,
            run_no,
            builder.finished_run_index_block(),
            builder.finished_run_filter_block(),
            builder.finished_run_data_size() as u32,
        );
        builder.finish().unwrap();
        mre
    }

    fn install_leaf(store: &LeafStore, max_key: &[u8], mres: &[MiniRunIndexEntry]) {
        let mut lie = LeafIndexEntry::new();
        for mre in mres {
            lie = LeafIndexEntryBuilder::append_minirun_index_entry(&lie, mre);
        }
        store.leaf_index.put(max_key, lie.raw()).unwrap();
        store.stats.new_leaf(max_key, mres.len());
    }

    #[test]
    fn test_get_from_single_run() {
        let f = fixture();
        let mre = build_run(
            &f.store,
            &[
                ("apple", 1, ValueType::Value, "red"),
                ("banana", 2, ValueType::Value, "yellow"),
            ],
        );
        install_leaf(&f.store, b"banana", &[mre]);

        assert_eq!(
            f.store.get(b"apple", 100).unwrap(),
            Some(b"red".to_vec())
        );
        assert_eq!(f.store.get(b"cherry", 100).unwrap(), None);
    }

    #[test]
    fn test_newest_run_is_authoritative() {
        let f = fixture();
        let old = build_run(&f.store, &[("k", 1, ValueType::Value, "old")]);
        let new = build_run(&f.store, &[("k", 5, ValueType::Value, "new")]);
        install_leaf(&f.store, b"k", &[old, new]);

        assert_eq!(f.store.get(b"k", 100).unwrap(), Some(b"new".to_vec()));
        // At an older snapshot the newer run has no visible version and the
        // older run answers.
        assert_eq!(f.store.get(b"k", 3).unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn test_tombstone_shadows_older_runs() {
        let f = fixture();
        let old = build_run(&f.store, &[("k", 1, ValueType::Value, "v")]);
        let del = build_run(&f.store, &[("k", 4, ValueType::Deletion, "")]);
        install_leaf(&f.store, b"k", &[old, del]);

        assert_eq!(f.store.get(b"k", 100).unwrap(), None);
        assert_eq!(f.store.get(b"k", 2).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_iter_leaf_merges_runs_in_order() {
        let f = fixture();
        let run_a = build_run(
            &f.store,
            &[
                ("a", 1, ValueType::Value, "a1"),
                ("c", 2, ValueType::Value, "c2"),
            ],
        );
        let run_b = build_run(&f.store, &[("b", 3, ValueType::Value, "b3")]);
        let mut lie = LeafIndexEntry::new();
        lie = LeafIndexEntryBuilder::append_minirun_index_entry(&lie, &run_a);
        lie = LeafIndexEntryBuilder::append_minirun_index_entry(&lie, &run_b);

        let mut iter = f.store.iter_leaf(&lie, 0, 1).unwrap();
        iter.seek_to_first();
        let mut user_keys = Vec::new();
        while iter.valid() {
            user_keys.push(format::user_key(iter.key()).to_vec());
            iter.next();
        }
        assert_eq!(user_keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        assert!(f.store.iter_leaf(&lie, 1, 0).is_err());
        assert!(f.store.iter_leaf(&lie, 0, 2).is_err());
    }

    #[test]
    fn test_db_iter_for_leaf_hides_tombstones() {
        let f = fixture();
        let old = build_run(
            &f.store,
            &[
                ("a", 1, ValueType::Value, "a1"),
                ("b", 2, ValueType::Value, "b2"),
            ],
        );
        let del = build_run(&f.store, &[("b", 5, ValueType::Deletion, "")]);
        let mut lie = LeafIndexEntry::new();
        lie = LeafIndexEntryBuilder::append_minirun_index_entry(&lie, &old);
        lie = LeafIndexEntryBuilder::append_minirun_index_entry(&lie, &del);

        let mut iter = f.store.db_iter_for_leaf(&lie, crate::format::MAX_SEQUENCE).unwrap();
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"a");
        // The internal key keeps its original sequence number for splits.
        let parsed = format::parse_internal_key(iter.internal_key()).unwrap();
        assert_eq!(parsed.sequence, 1);
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_store_iterator_across_leaves() {
        let f = fixture();
        let run1 = build_run(
            &f.store,
            &[
                ("a", 1, ValueType::Value, "1"),
                ("b", 2, ValueType::Value, "2"),
            ],
        );
        let run2 = build_run(
            &f.store,
            &[
                ("c", 3, ValueType::Value, "3"),
                ("d", 4, ValueType::Value, "4"),
            ],
        );
        install_leaf(&f.store, b"b", &[run1]);
        install_leaf(&f.store, b"d", &[run2]);

        let mut iter = f.store.iter(None).unwrap();
        iter.seek_to_first();
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(format::user_key(iter.key()).to_vec());
            iter.next();
        }
        assert_eq!(
            keys,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );

        // Seek lands in the owning leaf.
        let mut iter = f.store.iter(None).unwrap();
        iter.seek(&format::seek_key(b"c", crate::format::MAX_SEQUENCE));
        assert!(iter.valid());
        assert_eq!(format::user_key(iter.key()), b"c");
    }

    #[test]
    fn test_get_records_read_hotness() {
        let f = fixture();
        let mre = build_run(&f.store, &[("k", 1, ValueType::Value, "v")]);
        install_leaf(&f.store, b"k", &[mre]);

        f.store.get(b"k", 100).unwrap();
        f.store.get(b"k", 100).unwrap();
        f.store.stats.refresh_hotness();
        let mut hotness = 0.0;
        f.store.stats.for_each_leaf(|_, stat| hotness = stat.read_hotness);
        assert_eq!(hotness, 2.0);
    }
}
