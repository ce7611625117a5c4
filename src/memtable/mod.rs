//! Persistent-memory-backed memtable.
//!
//! Entry bytes live in a PM [`SubArena`]; the DRAM side is a concurrent
//! skip list mapping internal keys to PM addresses, so the data is the log
//! and no separate WAL exists. The skip list keeps one entry per version;
//! lookups resolve the newest version visible at the read sequence, which
//! supersedes older versions without ever rewriting PM bytes.
//!
//! Recovery walks the sub-arena from its header for `live_count` entries
//! and rebuilds the index. A torn tail entry truncates the replay and the
//! counter is reset to what actually replayed.

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_skiplist::SkipMap;

use crate::arena::{SubArena, SUB_ARENA_HEADER};
use crate::error::Result;
use crate::filter::BloomFilter;
use crate::format::{
    self, decode_pm_entry, encode_pm_entry, SequenceNumber, ValueType,
};
use crate::iterator::InternalIterator;

/// Skip-list key wrapper ordering by internal-key rules (user key
/// ascending, sequence descending).
#[derive(Debug, PartialEq, Eq)]
struct MapKey(Vec<u8>);

impl Ord for MapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        format::compare_internal_keys(&self.0, &other.0)
    }
}

impl PartialOrd for MapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome of a memtable point lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum LookupResult {
    /// The newest visible version is a put with this value.
    Found(Vec<u8>),
    /// The newest visible version is a tombstone.
    FoundTombstone,
    /// The memtable holds no visible version of the key.
    NotFound,
}

pub struct Memtable {
    index: SkipMap<MapKey, u64>,
    sub: SubArena,
    filter: Option<RwLock<BloomFilter>>,
    num_entries: AtomicUsize,
    searches: AtomicUsize,
    counter: AtomicU64,
}

impl Memtable {
    /// Wraps a freshly allocated sub-arena.
    pub fn new(sub: SubArena, filter: Option<BloomFilter>) -> Self {
        Self {
            index: SkipMap::new(),
            sub,
            filter: filter.map(RwLock::new),
            num_entries: AtomicUsize::new(0),
            searches: AtomicUsize::new(0),
            counter: AtomicU64::new(0),
        }
    }

    /// Appends one entry: encode, copy into PM, index the new version,
    /// advance the persisted live count. An append that fails leaves the
    /// memtable unchanged and usable.
    pub fn add(
        &self,
        seq: SequenceNumber,
        vtype: ValueType,
        user_key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let encoded = encode_pm_entry(user_key, seq, vtype, value);
        let address = self.sub.insert(&encoded)?;

        let mut internal_key = Vec::with_capacity(user_key.len() + format::TAG_LEN);
        format::append_internal_key(&mut internal_key, user_key, seq, vtype);
        self.index.insert(MapKey(internal_key), address);

        if let Some(filter) = &self.filter {
            filter.write()?.insert(user_key);
        }

        self.num_entries.fetch_add(1, Ordering::Relaxed);
        let count = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.sub.update_counter(count);
        Ok(())
    }

    /// Looks up the newest version of `user_key` visible at `seq`.
    pub fn get(&self, user_key: &[u8], seq: SequenceNumber) -> Result<LookupResult> {
        if let Some(filter) = &self.filter {
            if !filter.read()?.may_contain(user_key) {
                return Ok(LookupResult::NotFound);
            }
        }
        self.searches.fetch_add(1, Ordering::Relaxed);

        let seek = MapKey(format::seek_key(user_key, seq));
        let entry = match self
            .index
            .range((Bound::Included(seek), Bound::Unbounded))
            .next()
        {
            Some(entry) => entry,
            None => return Ok(LookupResult::NotFound),
        };
        if format::user_key(&entry.key().0) != user_key {
            return Ok(LookupResult::NotFound);
        }

        let bytes = self.sub.committed_from(*entry.value())?;
        let decoded = decode_pm_entry(bytes)?;
        let parsed = format::parse_internal_key(decoded.internal_key)?;
        if parsed.user_key != user_key {
            return errcorruption!("pm entry user key does not match its index entry");
        }
        match parsed.vtype {
            ValueType::Value => Ok(LookupResult::Found(decoded.value.to_vec())),
            ValueType::Deletion => Ok(LookupResult::FoundTombstone),
        }
    }

    /// Replays the sub-arena for `live_count` entries, rebuilding the index
    /// and raising `max_sequence` monotonically.
    pub fn recover(&self, max_sequence: &mut SequenceNumber) -> Result<()> {
        let target = self.sub.counter();
        let base = self.sub.base() + SUB_ARENA_HEADER;
        // Replay against the full extent rather than the persisted cursor:
        // a crash may have left the cursor behind the last complete entry.
        self.sub.update_cursor(self.sub.capacity());
        let region = self.sub.committed_from(base)?;

        let mut offset = 0usize;
        let mut replayed = 0u64;
        while replayed < target {
            let entry = match decode_pm_entry(&region[offset..]) {
                Ok(entry) => entry,
                // Torn tail: keep what replayed cleanly.
                Err(_) => break,
            };
            let parsed = match format::parse_internal_key(entry.internal_key) {
                Ok(parsed) => parsed,
                Err(_) => break,
            };
            self.index
                .insert(MapKey(entry.internal_key.to_vec()), base + offset as u64);
            if parsed.sequence > *max_sequence {
                *max_sequence = parsed.sequence;
            }
            offset += entry.encoded_len;
            replayed += 1;
        }

        self.counter.store(replayed, Ordering::SeqCst);
        self.sub.update_counter(replayed);
        self.sub.update_cursor(SUB_ARENA_HEADER + offset as u64);
        self.num_entries.store(replayed as usize, Ordering::Relaxed);
        tracing::info!(
            replayed,
            expected = target,
            base = self.sub.base(),
            "recovered memtable sub-arena"
        );
        Ok(())
    }

    /// Bytes of PM consumed so far, header included.
    pub fn approximate_memory_usage(&self) -> usize {
        self.sub.cursor() as usize
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries.load(Ordering::Relaxed)
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::Relaxed)
    }

    /// Flushes the sub-arena extent to its backing file.
    pub fn persist(&self) -> Result<()> {
        self.sub.persist()
    }

    /// The sub-arena's (base, len) extent, for geometry records.
    pub fn extent(&self) -> (u64, u64) {
        (self.sub.base(), self.sub.capacity())
    }

    pub fn iter(self: &Arc<Self>) -> MemtableIterator {
        MemtableIterator::new(Arc::clone(self))
    }

    fn entry_at(&self, address: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        let bytes = self.sub.committed_from(address)?;
        let decoded = decode_pm_entry(bytes)?;
        Ok((decoded.internal_key.to_vec(), decoded.value.to_vec()))
    }
}

/// Lazy iterator over a memtable in internal-key order. Reads values
/// through the stored PM addresses at positioning time.
pub struct MemtableIterator {
    memtable: Arc<Memtable>,
    current: Option<(Vec<u8>, Vec<u8>)>,
    status: Result<()>,
}

impl MemtableIterator {
    fn new(memtable: Arc<Memtable>) -> Self {
        Self {
            memtable,
            current: None,
            status: Ok(()),
        }
    }

    fn position(&mut self, entry: Option<(Vec<u8>, u64)>) {
        self.current = None;
        let Some((key, address)) = entry else {
            return;
        };
        match self.memtable.entry_at(address) {
            Ok((_, value)) => self.current = Some((key, value)),
            Err(e) => self.status = Err(e),
        }
    }

    fn range_first(&self, bound: Bound<MapKey>) -> Option<(Vec<u8>, u64)> {
        self.memtable
            .index
            .range((bound, Bound::Unbounded))
            .next()
            .map(|entry| (entry.key().0.clone(), *entry.value()))
    }
}

impl InternalIterator for MemtableIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        let first = self.range_first(Bound::Unbounded);
        self.position(first);
    }

    fn seek(&mut self, target: &[u8]) {
        let first = self.range_first(Bound::Included(MapKey(target.to_vec())));
        self.position(first);
    }

    fn next(&mut self) {
        let Some((key, _)) = self.current.take() else {
            return;
        };
        let next = self.range_first(Bound::Excluded(MapKey(key)));
        self.position(next);
    }

    fn prev(&mut self) {
        self.status = Err(crate::error::Error::Unsupported(
            "memtable iterators are forward-only".to_string(),
        ));
        self.current = None;
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("key() on invalid iterator").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("value() on invalid iterator").1
    }

    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::PmArena;
    use crate::tmpfs::TempDir;

    fn new_memtable(dir: &TempDir, size: u64) -> (PmArena, Arc<Memtable>) {
        let arena = PmArena::open(&dir.path().join("mem.pm"), size).unwrap();
        let sub = arena.allocate(size / 2).unwrap();
        (arena, Arc::new(Memtable::new(sub, None)))
    }

    #[test]
    fn test_add_and_get() {
        let dir = TempDir::new().unwrap();
        let (_arena, mem) = new_memtable(&dir, 1 << 20);

        mem.add(1, ValueType::Value, b"alpha", b"one").unwrap();
        mem.add(2, ValueType::Value, b"beta", b"two").unwrap();

        assert_eq!(
            mem.get(b"alpha", 10).unwrap(),
            LookupResult::Found(b"one".to_vec())
        );
        assert_eq!(mem.get(b"gamma", 10).unwrap(), LookupResult::NotFound);
        assert_eq!(mem.num_entries(), 2);
    }

    #[test]
    fn test_overwrite_and_tombstone() {
        let dir = TempDir::new().unwrap();
        let (_arena, mem) = new_memtable(&dir, 1 << 20);

        mem.add(1, ValueType::Value, b"k", b"v1").unwrap();
        mem.add(2, ValueType::Value, b"k", b"v2").unwrap();
        assert_eq!(
            mem.get(b"k", 10).unwrap(),
            LookupResult::Found(b"v2".to_vec())
        );

        mem.add(3, ValueType::Deletion, b"k", b"").unwrap();
        assert_eq!(mem.get(b"k", 10).unwrap(), LookupResult::FoundTombstone);
    }

    #[test]
    fn test_snapshot_visibility() {
        let dir = TempDir::new().unwrap();
        let (_arena, mem) = new_memtable(&dir, 1 << 20);

        mem.add(1, ValueType::Value, b"k", b"v1").unwrap();
        mem.add(5, ValueType::Value, b"k", b"v2").unwrap();

        // A reader at sequence 3 sees the version written at 1.
        assert_eq!(
            mem.get(b"k", 3).unwrap(),
            LookupResult::Found(b"v1".to_vec())
        );
        assert_eq!(
            mem.get(b"k", 5).unwrap(),
            LookupResult::Found(b"v2".to_vec())
        );
        assert_eq!(mem.get(b"k", 0).unwrap(), LookupResult::NotFound);
    }

    #[test]
    fn test_filter_short_circuit() {
        let dir = TempDir::new().unwrap();
        let arena = PmArena::open(&dir.path().join("mem.pm"), 1 << 20).unwrap();
        let sub = arena.allocate(1 << 19).unwrap();
        let mem = Memtable::new(sub, Some(BloomFilter::new(128, 0.01)));

        mem.add(1, ValueType::Value, b"present", b"v").unwrap();
        assert_eq!(
            mem.get(b"present", 10).unwrap(),
            LookupResult::Found(b"v".to_vec())
        );
        let searches_before = mem.searches();
        assert_eq!(mem.get(b"absent", 10).unwrap(), LookupResult::NotFound);
        // The filter answered without touching the index.
        assert_eq!(mem.searches(), searches_before);
    }

    #[test]
    fn test_iterator_internal_key_order() {
        let dir = TempDir::new().unwrap();
        let (_arena, mem) = new_memtable(&dir, 1 << 20);

        mem.add(1, ValueType::Value, b"b", b"b1").unwrap();
        mem.add(2, ValueType::Value, b"a", b"a2").unwrap();
        mem.add(3, ValueType::Value, b"a", b"a3").unwrap();

        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            let parsed = format::parse_internal_key(iter.key()).unwrap();
            seen.push((parsed.user_key.to_vec(), parsed.sequence));
            iter.next();
        }
        // "a" first, newest version first within the key.
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 3),
                (b"a".to_vec(), 2),
                (b"b".to_vec(), 1)
            ]
        );
    }

    #[test]
    fn test_counter_matches_appends_and_cursor() {
        let dir = TempDir::new().unwrap();
        let arena = PmArena::open(&dir.path().join("mem.pm"), 1 << 20).unwrap();
        let sub = arena.allocate(1 << 19).unwrap();
        let mem = Memtable::new(sub, None);

        let mut expected_bytes = SUB_ARENA_HEADER as usize;
        for i in 0..10u32 {
            let key = format!("key{i}");
            mem.add(i as u64 + 1, ValueType::Value, key.as_bytes(), b"val")
                .unwrap();
            expected_bytes +=
                encode_pm_entry(key.as_bytes(), i as u64 + 1, ValueType::Value, b"val").len();
        }
        assert_eq!(mem.sub.counter(), 10);
        assert_eq!(mem.approximate_memory_usage(), expected_bytes);
    }

    #[test]
    fn test_recovery_rebuilds_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mem.pm");
        let (base, len);
        {
            let arena = PmArena::open(&path, 1 << 20).unwrap();
            let sub = arena.allocate(1 << 19).unwrap();
            let mem = Memtable::new(sub, None);
            mem.add(7, ValueType::Value, b"a", b"1").unwrap();
            mem.add(8, ValueType::Value, b"b", b"2").unwrap();
            mem.add(9, ValueType::Deletion, b"a", b"").unwrap();
            mem.persist().unwrap();
            (base, len) = mem.extent();
            std::mem::forget(mem);
        }

        let arena = PmArena::open(&path, 1 << 20).unwrap();
        arena.recover(&[(base, len)]).unwrap();
        let sub = arena.reallocate(base, len).unwrap();
        let mem = Memtable::new(sub, None);
        let mut max_seq = 0;
        mem.recover(&mut max_seq).unwrap();

        assert_eq!(max_seq, 9);
        assert_eq!(mem.num_entries(), 3);
        assert_eq!(mem.get(b"a", 100).unwrap(), LookupResult::FoundTombstone);
        assert_eq!(
            mem.get(b"b", 100).unwrap(),
            LookupResult::Found(b"2".to_vec())
        );
        assert_eq!(
            mem.get(b"a", 8).unwrap(),
            LookupResult::Found(b"1".to_vec())
        );
    }

    #[test]
    fn test_recovery_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mem.pm");
        let (base, len);
        {
            let arena = PmArena::open(&path, 1 << 20).unwrap();
            let sub = arena.allocate(1 << 19).unwrap();
            let mem = Memtable::new(sub, None);
            mem.add(1, ValueType::Value, b"a", b"1").unwrap();
            mem.add(2, ValueType::Value, b"b", b"2").unwrap();
            // Claim one more entry than was actually written, as a crash
            // between counter update and payload ordering never produces
            // but a truncated tail can.
            mem.sub.update_counter(3);
            mem.persist().unwrap();
            (base, len) = mem.extent();
            std::mem::forget(mem);
        }

        let arena = PmArena::open(&path, 1 << 20).unwrap();
        arena.recover(&[(base, len)]).unwrap();
        let sub = arena.reallocate(base, len).unwrap();
        let mem = Memtable::new(sub, None);
        let mut max_seq = 0;
        mem.recover(&mut max_seq).unwrap();

        assert_eq!(mem.num_entries(), 2);
        assert_eq!(mem.sub.counter(), 2);
        assert_eq!(max_seq, 2);
    }
}
