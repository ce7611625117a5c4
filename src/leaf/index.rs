//! The durable leaf index: an ordered store from leaf max user keys to
//! serialized leaf index entries.
//!
//! Reuses the memtable-on-PM machinery with its own (small) arena and its
//! own sequence domain. Entries are compact, so a single sub-arena of a
//! few tens of megabytes holds the whole index; exhausting it is fatal
//! (`OutOfMemory`).
//!
//! Creation is guarded by the `leafindex_recovery` sentinel file: when it
//! exists the arena is replayed, otherwise the index is initialized and
//! the sentinel created.

use std::fs::File;
use std::sync::{Arc, Mutex};

use crate::batch::WriteBatch;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::format::{SequenceNumber, MAX_SEQUENCE};
use crate::iterator::DbIter;
use crate::memtable::{LookupResult, Memtable};
use crate::arena::PmArena;

pub const RECOVERY_SENTINEL: &str = "leafindex_recovery";

/// A point-in-time token over the leaf index. Reads and iterators under a
/// snapshot see exactly the writes sequenced at or before it.
pub struct LeafSnapshot {
    sequence: SequenceNumber,
}

impl LeafSnapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

pub struct LeafIndexDb {
    memtable: Arc<Memtable>,
    _arena: PmArena,
    /// Next sequence number to assign; also serializes writers.
    next_sequence: Mutex<SequenceNumber>,
    snapshots: Mutex<Vec<Arc<LeafSnapshot>>>,
    capacity: u64,
}

impl LeafIndexDb {
    pub fn open(opts: &Options) -> Result<Self> {
        let size = opts.nvmleafindex_size as u64;
        let arena = PmArena::open(&opts.leafindex_pm_path(), size)?;
        let sentinel = opts.dir.join(RECOVERY_SENTINEL);

        let (memtable, next_sequence) = if sentinel.exists() {
            arena.recover(&[(0, size)])?;
            let sub = arena.reallocate(0, size)?;
            let memtable = Arc::new(Memtable::new(sub, None));
            let mut max_sequence = 0;
            memtable.recover(&mut max_sequence)?;
            tracing::info!(
                entries = memtable.num_entries(),
                max_sequence,
                "leaf index recovered"
            );
            (memtable, max_sequence + 1)
        } else {
            let sub = arena.allocate(size)?;
            File::create(&sentinel)?;
            tracing::info!("leaf index initialized");
            (Arc::new(Memtable::new(sub, None)), 1)
        };

        Ok(Self {
            memtable,
            _arena: arena,
            next_sequence: Mutex::new(next_sequence),
            snapshots: Mutex::new(Vec::new()),
            capacity: size,
        })
    }

    fn visible_sequence(snapshot: Option<&LeafSnapshot>) -> SequenceNumber {
        snapshot.map(|s| s.sequence).unwrap_or(MAX_SEQUENCE)
    }

    pub fn get(&self, key: &[u8], snapshot: Option<&LeafSnapshot>) -> Result<Option<Vec<u8>>> {
        match self.memtable.get(key, Self::visible_sequence(snapshot))? {
            LookupResult::Found(value) => Ok(Some(value)),
            LookupResult::FoundTombstone | LookupResult::NotFound => Ok(None),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(&mut batch)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(&mut batch)
    }

    /// Applies a batch atomically with respect to other writers. The arena
    /// must have room for the whole batch up front.
    pub fn write(&self, batch: &mut WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut next = self.next_sequence.lock()?;
        if self.memtable.approximate_memory_usage() + batch.approximate_size()
            > self.capacity as usize
        {
            return Err(Error::OutOfMemory);
        }
        batch.set_sequence(*next);
        for (seq, vtype, key, value) in batch.iter() {
            self.memtable.add(seq, vtype, key, value)?;
        }
        *next += batch.count() as SequenceNumber;
        self.memtable.persist()?;
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Arc<LeafSnapshot>> {
        let next = self.next_sequence.lock()?;
        let snapshot = Arc::new(LeafSnapshot {
            sequence: next.saturating_sub(1),
        });
        self.snapshots.lock()?.push(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn release_snapshot(&self, snapshot: &Arc<LeafSnapshot>) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.retain(|s| !Arc::ptr_eq(s, snapshot));
        }
    }

    /// All live `(leaf max key, value)` pairs visible at the snapshot, in
    /// key order.
    pub fn scan(&self, snapshot: Option<&LeafSnapshot>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut iter = self.db_iter(snapshot);
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        iter.status()?;
        Ok(out)
    }

    /// First live entry with key ≥ `user_key` at the snapshot.
    pub fn seek(
        &self,
        user_key: &[u8],
        snapshot: Option<&LeafSnapshot>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut iter = self.db_iter(snapshot);
        iter.seek(user_key);
        if iter.valid() {
            let entry = (iter.key().to_vec(), iter.value().to_vec());
            iter.status()?;
            Ok(Some(entry))
        } else {
            iter.status()?;
            Ok(None)
        }
    }

    pub fn num_leaves(&self) -> Result<usize> {
        Ok(self.scan(None)?.len())
    }

    fn db_iter(&self, snapshot: Option<&LeafSnapshot>) -> DbIter {
        DbIter::new(
            Box::new(self.memtable.iter()),
            Self::visible_sequence(snapshot),
        )
    }
}
