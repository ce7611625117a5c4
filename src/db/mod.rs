//! The database coordinator: write path, reads, snapshots, recovery and
//! background-work scheduling.
//!
//! Writers queue under the state mutex; the writer at the front of the
//! queue grabs the whole group, assigns consecutive sequence numbers and
//! applies the merged batch to the memtable with the mutex released so
//! readers proceed. When the memtable reaches capacity it is promoted to
//! immutable, a fresh memtable takes over, and the background worker
//! merges the immutable table into the leaf tier.
//!
//! On-disk state under the database directory:
//!
//! - `LOCK` - advisory lock file
//! - `CURRENT` - ASCII seed naming the active geometry log
//! - `<seed>.log` - ASCII records `n,base_1,len_1,...,base_n,len_n,`
//!   describing the PM sub-arena layout of (immutable..., active)
//!   memtables; the last record wins
//! - `NNNNNN.seg` - segment files
//! - `leafindex_recovery` - leaf index sentinel
//! - the two PM backing files

pub(crate) mod compaction;
pub(crate) mod gc;
pub(crate) mod optimize;

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;

use crate::arena::PmArena;
use crate::batch::WriteBatch;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::filter::BloomFilter;
use crate::flock::FileLock;
use crate::format::SequenceNumber;
use crate::iterator::{BoxedInternalIterator, DbIter, MergingIterator};
use crate::leaf::index::{LeafIndexDb, LeafSnapshot};
use crate::leaf::store::LeafStore;
use crate::memtable::{LookupResult, Memtable};
use crate::segment::SegmentManager;
use crate::stats::LeafStatStore;

const CURRENT_FILE: &str = "CURRENT";
const LOCK_FILE: &str = "LOCK";

/// Upper bound on a merged writer group.
const MAX_GROUP_SIZE: usize = 1 << 20;
/// A small leading write only grows by this much, so it is not delayed
/// behind large followers.
const SMALL_WRITE_SLOP: usize = 128 << 10;

/// A consistent point-in-time view over the database. Holds a leaf-index
/// snapshot so leaf iteration is stable for as long as the snapshot lives.
pub struct Snapshot {
    sequence: SequenceNumber,
    leaf: Arc<LeafSnapshot>,
}

impl Snapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

struct Writer {
    batch: Option<WriteBatch>,
    sync: bool,
    done: bool,
    result: Option<Result<()>>,
}

type WriterRef = Arc<Mutex<Writer>>;

pub(crate) struct DbState {
    pub(crate) mem: Arc<Memtable>,
    pub(crate) imm: Option<Arc<Memtable>>,
    pub(crate) max_sequence: SequenceNumber,
    pub(crate) memtable_capacity: usize,
    pub(crate) background_compaction_scheduled: bool,
    pub(crate) bg_error: Option<Error>,
    writers: VecDeque<WriterRef>,
    log: GeometryLog,
}

pub(crate) struct DbInner {
    pub(crate) opts: Options,
    pub(crate) arena: PmArena,
    pub(crate) segments: SegmentManager,
    pub(crate) leaf_index: Arc<LeafIndexDb>,
    pub(crate) leaf_store: LeafStore,
    pub(crate) stats: Arc<LeafStatStore>,
    pub(crate) state: Mutex<DbState>,
    pub(crate) write_cv: Condvar,
    pub(crate) bg_cv: Condvar,
    /// Serializes GC passes and leaf optimization against each other.
    pub(crate) gc_mutex: Mutex<()>,
    pub(crate) shutting_down: AtomicBool,
    opt_shutdown: (Mutex<bool>, Condvar),
    _lock: FileLock,
}

/// A key-value store with a persistent-memory memtable tier and a
/// leaf-indexed segment tier.
pub struct Db {
    inner: Arc<DbInner>,
    opt_thread: Option<JoinHandle<()>>,
}

impl Db {
    pub fn open(opts: Options) -> Result<Db> {
        fs::create_dir_all(&opts.dir)?;
        let lock = FileLock::lock(opts.dir.join(LOCK_FILE))?;

        let leaf_index = Arc::new(LeafIndexDb::open(&opts)?);
        let stats = Arc::new(LeafStatStore::new());
        for (max_key, raw) in leaf_index.scan(None)? {
            let lie = crate::leaf::entry::LeafIndexEntry::from_bytes(raw)?;
            stats.new_leaf(&max_key, lie.num_miniruns());
        }

        let segments = SegmentManager::open(&opts)?;
        let leaf_store = LeafStore::new(segments.clone(), Arc::clone(&leaf_index), Arc::clone(&stats));
        let arena = PmArena::open(&opts.memtable_pm_path(), opts.nvmemtable_size as u64)?;

        let current_path = opts.dir.join(CURRENT_FILE);
        let mut max_sequence: SequenceNumber = 0;
        let (mem, imm, log) = if current_path.exists() {
            let seed: u64 = fs::read_to_string(&current_path)?
                .trim()
                .parse()
                .map_err(|_| Error::Corruption("CURRENT does not hold a seed".to_string()))?;
            let extents = GeometryLog::read_last_record(&opts.dir, seed)?;
            if extents.is_empty() || extents.len() > 2 {
                return errcorruption!("geometry record lists {} extents", extents.len());
            }
            arena.recover(&extents)?;

            let active = *extents.last().expect("checked non-empty");
            let mem_sub = arena.reallocate(active.0, active.1)?;
            let mem = Arc::new(Memtable::new(mem_sub, None));
            mem.recover(&mut max_sequence)?;

            let imm = if extents.len() == 2 {
                let sub = arena.reallocate(extents[0].0, extents[0].1)?;
                let imm = Arc::new(Memtable::new(sub, None));
                imm.recover(&mut max_sequence)?;
                Some(imm)
            } else {
                None
            };
            let log = GeometryLog::open(&opts.dir, seed)?;
            remove_stale_logs(&opts.dir, seed);
            tracing::info!(seed, max_sequence, imm = imm.is_some(), "database recovered");
            (mem, imm, log)
        } else {
            max_sequence = 1;
            let sub = arena.allocate(arena_extent_for(opts.write_buffer_size))?;
            let mem = Arc::new(Memtable::new(sub, None));
            let mut log = GeometryLog::create(&opts.dir, max_sequence)?;
            log.append_record(&[mem.extent()])?;
            write_current(&opts.dir, max_sequence)?;
            tracing::info!("database initialized");
            (mem, None, log)
        };
        max_sequence = max_sequence.max(1);

        let memtable_capacity = adapted_capacity(&opts, opts.write_buffer_size, segments.approximate_size());
        let had_imm = imm.is_some();

        let inner = Arc::new(DbInner {
            state: Mutex::new(DbState {
                mem,
                imm,
                max_sequence,
                memtable_capacity,
                background_compaction_scheduled: false,
                bg_error: None,
                writers: VecDeque::new(),
                log,
            }),
            opts,
            arena,
            segments,
            leaf_index,
            leaf_store,
            stats,
            write_cv: Condvar::new(),
            bg_cv: Condvar::new(),
            gc_mutex: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            opt_shutdown: (Mutex::new(false), Condvar::new()),
            _lock: lock,
        });

        let weak: Weak<DbInner> = Arc::downgrade(&inner);
        inner.segments.set_gc_callback(move || {
            weak.upgrade()
                .map(|inner| match gc::garbage_collect(&inner) {
                    Ok(collected) => collected,
                    Err(e) => {
                        tracing::error!(error = %e, "gc on segment shortage failed");
                        0
                    }
                })
                .unwrap_or(0)
        });

        let opt_thread = Some(optimize::spawn_optimizer(Arc::clone(&inner)));

        if had_imm {
            let mut state = inner.state.lock()?;
            maybe_schedule_compaction(&inner, &mut state);
        }

        Ok(Db {
            inner,
            opt_thread,
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch)
    }

    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        self.write_internal(Some(batch), false)
    }

    /// Like [`Db::write`] but also flushes the memtable's PM extent before
    /// acknowledging.
    pub fn write_sync(&self, batch: WriteBatch) -> Result<()> {
        self.write_internal(Some(batch), true)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_at_sequence(key, None)
    }

    pub fn get_at(&self, key: &[u8], snapshot: &Snapshot) -> Result<Option<Vec<u8>>> {
        self.get_at_sequence(key, Some(snapshot.sequence))
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        let state = self.inner.state.lock()?;
        let sequence = state.max_sequence;
        drop(state);
        Ok(Snapshot {
            sequence,
            leaf: self.inner.leaf_index.snapshot()?,
        })
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        self.inner.leaf_index.release_snapshot(&snapshot.leaf);
    }

    /// Iterator over the newest visible version of every user key, in key
    /// order, with tombstones hidden.
    pub fn iter(&self) -> Result<DbIter> {
        let state = self.inner.state.lock()?;
        let sequence = state.max_sequence;
        let iter = self.iter_locked(&state, sequence)?;
        Ok(iter)
    }

    /// Iterator pinned to a snapshot.
    pub fn iter_at(&self, snapshot: &Snapshot) -> Result<DbIter> {
        let state = self.inner.state.lock()?;
        let iter = self.iter_locked(&state, snapshot.sequence)?;
        Ok(iter)
    }

    fn iter_locked(&self, state: &DbState, sequence: SequenceNumber) -> Result<DbIter> {
        let mut children: Vec<BoxedInternalIterator> = Vec::new();
        children.push(Box::new(state.mem.iter()));
        if let Some(imm) = &state.imm {
            children.push(Box::new(imm.iter()));
        }
        children.push(Box::new(self.inner.leaf_store.iter(None)?));
        Ok(DbIter::new(
            Box::new(MergingIterator::new(children)),
            sequence,
        ))
    }

    /// Forces the active memtable into the leaf tier and waits for the
    /// compaction to finish.
    pub fn compact_memtable(&self) -> Result<()> {
        self.write_internal(None, false)?;
        let mut state = self.inner.state.lock()?;
        while (state.imm.is_some() || state.background_compaction_scheduled)
            && state.bg_error.is_none()
        {
            state = self.inner.bg_cv.wait(state)?;
        }
        match &state.bg_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Runs one garbage-collection pass; returns the number of segments
    /// collected.
    pub fn garbage_collect(&self) -> Result<usize> {
        gc::garbage_collect(&self.inner)
    }

    /// Clears a sticky background error so compaction can resume.
    pub fn clear_background_error(&self) -> Result<()> {
        let mut state = self.inner.state.lock()?;
        state.bg_error = None;
        maybe_schedule_compaction(&self.inner, &mut state);
        Ok(())
    }

    /// Total bytes in published segment files.
    pub fn segments_size(&self) -> u64 {
        self.inner.segments.approximate_size()
    }

    pub fn num_leaves(&self) -> Result<usize> {
        self.inner.leaf_index.num_leaves()
    }

    fn get_at_sequence(&self, key: &[u8], at: Option<SequenceNumber>) -> Result<Option<Vec<u8>>> {
        let (mem, imm, sequence) = {
            let state = self.inner.state.lock()?;
            (
                Arc::clone(&state.mem),
                state.imm.clone(),
                at.unwrap_or(state.max_sequence),
            )
        };
        match mem.get(key, sequence)? {
            LookupResult::Found(value) => return Ok(Some(value)),
            LookupResult::FoundTombstone => return Ok(None),
            LookupResult::NotFound => {}
        }
        if let Some(imm) = imm {
            match imm.get(key, sequence)? {
                LookupResult::Found(value) => return Ok(Some(value)),
                LookupResult::FoundTombstone => return Ok(None),
                LookupResult::NotFound => {}
            }
        }
        self.inner.leaf_store.get(key, sequence)
    }

    /// `batch = None` forces a memtable rotation without writing anything.
    fn write_internal(&self, batch: Option<WriteBatch>, sync: bool) -> Result<()> {
        let inner = &self.inner;
        let me: WriterRef = Arc::new(Mutex::new(Writer {
            batch,
            sync,
            done: false,
            result: None,
        }));

        let mut state = inner.state.lock()?;
        state.writers.push_back(Arc::clone(&me));
        loop {
            {
                let mut writer = me.lock()?;
                if writer.done {
                    return writer.result.take().unwrap_or(Ok(()));
                }
            }
            let at_front = state
                .writers
                .front()
                .map(|w| Arc::ptr_eq(w, &me))
                .unwrap_or(false);
            if at_front {
                break;
            }
            state = inner.write_cv.wait(state)?;
        }

        let force = me.lock()?.batch.is_none();
        let (returned_state, mut status) = make_room_for_write(inner, state, force);
        state = returned_state;

        let mut members: Vec<WriterRef> = vec![Arc::clone(&me)];
        if status.is_ok() && !force {
            let (mut group, grouped) = build_batch_group(&mut state)?;
            members = grouped;
            group.set_sequence(state.max_sequence + 1);
            let count = group.count() as SequenceNumber;
            let mem = Arc::clone(&state.mem);
            let sync_requested = sync || members.iter().any(|w| w.lock().map(|w| w.sync).unwrap_or(false));

            // Appends proceed without the mutex so readers are not blocked.
            drop(state);
            status = apply_batch(&mem, &group, sync_requested);
            state = inner.state.lock()?;
            if status.is_ok() {
                state.max_sequence += count;
            }
        }

        for member in &members {
            let front = state.writers.pop_front();
            debug_assert!(front.map(|w| Arc::ptr_eq(&w, member)).unwrap_or(false));
            if !Arc::ptr_eq(member, &me) {
                let mut writer = member.lock()?;
                writer.done = true;
                writer.result = Some(status.clone());
            }
        }
        drop(state);
        inner.write_cv.notify_all();
        status
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        if let Ok(mut state) = self.inner.state.lock() {
            while state.background_compaction_scheduled {
                match self.inner.bg_cv.wait(state) {
                    Ok(guard) => state = guard,
                    Err(_) => return,
                }
            }
        }
        let (lock, cv) = &self.inner.opt_shutdown;
        if let Ok(mut stop) = lock.lock() {
            *stop = true;
            cv.notify_all();
        }
        if let Some(handle) = self.opt_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Removes every file the database created under `opts.dir`, including the
/// PM backing files.
pub fn destroy(opts: &Options) -> Result<()> {
    let dir = &opts.dir;
    if !dir.exists() {
        return Ok(());
    }
    // Take the lock first so a live instance is never destroyed.
    let _lock = FileLock::lock(dir.join(LOCK_FILE))?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let known = name == CURRENT_FILE
            || name == crate::leaf::index::RECOVERY_SENTINEL
            || name.ends_with(".log")
            || name.ends_with(".seg")
            || name.ends_with(".seg.tmp")
            || name.ends_with(".pm");
        if known {
            fs::remove_file(entry.path())?;
        }
    }
    fs::remove_file(dir.join(LOCK_FILE))?;
    let _ = fs::remove_dir(dir);
    Ok(())
}

fn apply_batch(mem: &Memtable, group: &WriteBatch, sync: bool) -> Result<()> {
    for (seq, vtype, key, value) in group.iter() {
        mem.add(seq, vtype, key, value)?;
    }
    if sync {
        mem.persist()?;
    }
    Ok(())
}

/// Merges the front writer's batch with queued followers, capped so large
/// groups do not delay small writes. Stops at a rotation marker or at a
/// sync write following a non-sync leader.
fn build_batch_group(state: &mut DbState) -> Result<(WriteBatch, Vec<WriterRef>)> {
    let first = Arc::clone(state.writers.front().expect("group leader present"));
    let first_sync = first.lock()?.sync;
    let mut group = first
        .lock()?
        .batch
        .take()
        .expect("group leader carries a batch");
    let mut size = group.approximate_size();
    let max_size = if size <= SMALL_WRITE_SLOP {
        size + SMALL_WRITE_SLOP
    } else {
        MAX_GROUP_SIZE
    };

    let mut members = vec![first];
    for writer_ref in state.writers.iter().skip(1) {
        let mut writer = writer_ref.lock()?;
        if writer.sync && !first_sync {
            break;
        }
        let Some(batch) = writer.batch.as_ref() else {
            // Rotation marker; never folded into a group.
            break;
        };
        size += batch.approximate_size();
        if size > max_size {
            break;
        }
        let batch = writer.batch.take().expect("checked above");
        group.append(&batch);
        drop(writer);
        members.push(Arc::clone(writer_ref));
    }
    Ok((group, members))
}

/// Blocks until the active memtable has room (or rotates it). Takes the
/// state guard and hands it back so waits can release the mutex.
fn make_room_for_write<'a>(
    inner: &'a Arc<DbInner>,
    mut state: MutexGuard<'a, DbState>,
    mut force: bool,
) -> (MutexGuard<'a, DbState>, Result<()>) {
    loop {
        let usage = state.mem.approximate_memory_usage();
        if !force && usage <= state.memtable_capacity {
            return (state, Ok(()));
        }
        if state.imm.is_some() {
            if let Some(e) = &state.bg_error {
                let err = e.clone();
                return (state, Err(err));
            }
            tracing::info!("memtable full and compaction ongoing; write stalls");
            state = match inner.bg_cv.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => {
                    let guard = poisoned.into_inner();
                    return (guard, Err(Error::IO("state mutex poisoned".to_string())));
                }
            };
            continue;
        }

        // Rotate: allocate the successor first so failure leaves the
        // current memtable untouched.
        let new_capacity = adapted_capacity(
            &inner.opts,
            state.memtable_capacity,
            inner.segments.approximate_size(),
        );
        let sub = match inner.arena.allocate(arena_extent_for(new_capacity)) {
            Ok(sub) => sub,
            Err(e) => return (state, Err(e)),
        };
        let new_extent = (sub.base(), sub.capacity());

        let filter = if inner.opts.use_memtable_dynamic_filter {
            let per_entry = state.memtable_capacity.max(1) / state.mem.num_entries().max(1);
            let expected = (new_capacity / per_entry.max(1)).max(64);
            Some(BloomFilter::new(
                expected,
                inner.opts.memtable_dynamic_filter_fp_rate,
            ))
        } else {
            None
        };

        // The geometry record must land before the swap: a crash after the
        // append recovers both extents, a crash before it recovers the old
        // layout.
        let old_extent = state.mem.extent();
        if let Err(e) = state.log.append_record(&[old_extent, new_extent]) {
            return (state, Err(e));
        }

        let new_mem = Arc::new(Memtable::new(sub, filter));
        let old_mem = std::mem::replace(&mut state.mem, new_mem);
        state.imm = Some(old_mem);
        state.memtable_capacity = new_capacity;
        tracing::info!(new_capacity, "memtable rotated");

        force = false;
        maybe_schedule_compaction(inner, &mut state);
    }
}

pub(crate) fn maybe_schedule_compaction(inner: &Arc<DbInner>, state: &mut DbState) {
    if state.background_compaction_scheduled
        || inner.shutting_down.load(Ordering::SeqCst)
        || state.bg_error.is_some()
        || state.imm.is_none()
    {
        return;
    }
    state.background_compaction_scheduled = true;
    let inner = Arc::clone(inner);
    std::thread::spawn(move || compaction::background_call(inner));
}

/// Memtable capacity adapted from the size of the segment tier, clamped to
/// the configured bounds.
fn adapted_capacity(opts: &Options, current: usize, segments_size: u64) -> usize {
    let adapted = (current + segments_size as usize) / opts.memtbl_to_l0_ratio.max(1);
    adapted
        .max(opts.write_buffer_size)
        .min(opts.max_memtbl_capacity)
}

/// Extent to carve for a memtable of the given capacity: the capacity plus
/// slack so the entry that crosses the threshold still fits.
fn arena_extent_for(capacity: usize) -> u64 {
    (capacity + capacity / 16 + 4096) as u64
}

/// Drops geometry logs orphaned by a crash between publication steps.
fn remove_stale_logs(dir: &Path, current_seed: u64) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(".log") {
            if stem.parse::<u64>().map_or(false, |seed| seed != current_seed) {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

fn write_current(dir: &Path, seed: u64) -> Result<()> {
    let tmp = dir.join("CURRENT_temp");
    let mut file = File::create(&tmp)?;
    write!(file, "{seed}")?;
    file.sync_all()?;
    fs::rename(&tmp, dir.join(CURRENT_FILE))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::tmpfs::TempDir;

    /// Small capacities so rotation, split and GC all fire in tests.
    fn test_options(dir: &TempDir) -> Options {
        Options::new(dir.path())
            .write_buffer_size(32 * 1024)
            .max_memtbl_capacity(64 * 1024)
            .nvmemtable_size(8 << 20)
            .nvmleafindex_size(4 << 20)
            .leaf_datasize_thresh(16 * 1024)
            .leaf_max_num_miniruns(4)
            .segment_file_size_thresh(64 * 1024)
            .split_leaf_num_threads(2)
            .compact_num_threads(2)
    }

    fn open_db(dir: &TempDir) -> Db {
        Db::open(test_options(dir)).expect("open database")
    }

    fn lcg_next(state: &mut u64) -> u64 {
        *state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        *state
    }

    /// Deterministic pseudo-random 16-byte key set with 100-byte values;
    /// returns the final value per key.
    fn load_random_keys(db: &Db, count: usize, seed: u64) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut rng = seed;
        let mut expected = BTreeMap::new();
        for i in 0..count {
            let key = format!("{:016x}", lcg_next(&mut rng)).into_bytes();
            let value = format!("value_{i:06}_{}", "x".repeat(88)).into_bytes();
            db.put(&key, &value).expect("put");
            expected.insert(key, value);
        }
        expected
    }

    fn assert_matches_expected(db: &Db, expected: &BTreeMap<Vec<u8>, Vec<u8>>) {
        for (key, value) in expected {
            assert_eq!(
                db.get(key).expect("get").as_deref(),
                Some(value.as_slice()),
                "wrong value for key {:?}",
                String::from_utf8_lossy(key)
            );
        }
        let mut iter = db.iter().expect("iterator");
        iter.seek_to_first();
        let mut scanned = Vec::new();
        while iter.valid() {
            scanned.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        iter.status().expect("iterator status");
        let want: Vec<(Vec<u8>, Vec<u8>)> =
            expected.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(scanned.len(), want.len(), "scan count mismatch");
        assert_eq!(scanned, want, "scan content mismatch");
    }

    #[test]
    fn test_sequential_put_get() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        for i in 0..26u8 {
            let key = [b'a' + i];
            let value = format!("{}", i + 1);
            db.put(&key, value.as_bytes()).unwrap();
        }
        for i in 0..26u8 {
            let key = [b'a' + i];
            let want = format!("{}", i + 1);
            assert_eq!(db.get(&key).unwrap(), Some(want.into_bytes()));
        }
        assert_eq!(db.get(b"zz").unwrap(), None);
    }

    #[test]
    fn test_overwrite_and_delete() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        db.put(b"k", b"v1").unwrap();
        db.put(b"k", b"v2").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));

        db.delete(b"k").unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);

        db.put(b"k", b"v3").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v3".to_vec()));
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        db.put(b"a", b"1").unwrap();
        let snapshot = db.snapshot().unwrap();
        db.put(b"a", b"2").unwrap();

        assert_eq!(db.get_at(b"a", &snapshot).unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"a").unwrap(), Some(b"2".to_vec()));

        // Repeated reads under the snapshot stay stable across flushes.
        db.compact_memtable().unwrap();
        assert_eq!(db.get_at(b"a", &snapshot).unwrap(), Some(b"1".to_vec()));
        db.release_snapshot(snapshot);
    }

    #[test]
    fn test_delete_shadows_flushed_value() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        db.put(b"k", b"v").unwrap();
        db.compact_memtable().unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));

        // The tombstone lives in the memtable, the value in a leaf.
        db.delete(b"k").unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);

        // And still shadows it once both are in the leaf tier.
        db.compact_memtable().unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_write_batch_is_atomic_and_ordered() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let mut batch = WriteBatch::new();
        batch.put(b"a".as_slice(), b"1".as_slice());
        batch.delete(b"a".as_slice());
        batch.put(b"b".as_slice(), b"2".as_slice());
        db.write(batch).unwrap();

        assert_eq!(db.get(b"a").unwrap(), None);
        assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_compact_memtable_moves_data_to_leaves() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        for i in 0..50u32 {
            db.put(format!("key{i:04}").as_bytes(), b"value").unwrap();
        }
        db.compact_memtable().unwrap();

        assert!(db.num_leaves().unwrap() >= 1);
        assert!(db.segments_size() > 0);
        for i in 0..50u32 {
            assert_eq!(
                db.get(format!("key{i:04}").as_bytes()).unwrap(),
                Some(b"value".to_vec())
            );
        }
    }

    #[test]
    fn test_flush_and_split_preserve_content() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        // Enough data for several rotations, flushes and leaf splits.
        let expected = load_random_keys(&db, 1500, 42);
        db.compact_memtable().unwrap();

        assert!(db.num_leaves().unwrap() > 1, "expected the leaf layer to split");
        assert_matches_expected(&db, &expected);
    }

    #[test]
    fn test_gc_preserves_content_and_reclaims_space() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        // Churn: every key overwritten repeatedly, each round flushed so
        // leaves accumulate runs and splits invalidate the old ones.
        let mut expected = BTreeMap::new();
        for round in 0..6 {
            for i in 0..200u32 {
                let key = format!("key{i:05}").into_bytes();
                let value = format!("round{round}_value{i:05}_{}", "y".repeat(40)).into_bytes();
                db.put(&key, &value).unwrap();
                expected.insert(key, value);
            }
            db.compact_memtable().unwrap();
        }

        let size_before = db.segments_size();
        let mut collected = 0;
        loop {
            let n = db.garbage_collect().unwrap();
            if n == 0 {
                break;
            }
            collected += n;
        }
        assert!(collected > 0, "churn should leave gc candidates");
        assert!(
            db.segments_size() < size_before,
            "gc should reclaim segment storage"
        );
        assert_matches_expected(&db, &expected);
    }

    #[test]
    fn test_gc_skips_runs_above_all_leaf_keys() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        for i in 0..20u32 {
            db.put(format!("key{i:02}").as_bytes(), b"v").unwrap();
        }
        db.compact_memtable().unwrap();

        // Hand-build a segment no leaf references: one invalidated run (to
        // make it a gc candidate) and one valid run whose keys sort after
        // every leaf max key, so the liveness probe runs off the index.
        let (seg_id, mut builder) = db.inner.segments.new_segment_builder(false).unwrap();
        for run in 0..2u32 {
            builder.start_minirun().unwrap();
            let mut key = Vec::new();
            crate::format::append_internal_key(
                &mut key,
                format!("zzz{run}").as_bytes(),
                1,
                crate::format::ValueType::Value,
            );
            builder.add(&key, b"orphan").unwrap();
            builder.finish_minirun().unwrap();
        }
        builder.finish().unwrap();
        db.inner.segments.invalidate_segment_run(seg_id, 0).unwrap();

        let collected = db.garbage_collect().unwrap();
        assert!(collected >= 1);
        assert!(db.inner.segments.get_segment(seg_id).is_none());
        // Nothing visible changed.
        for i in 0..20u32 {
            assert_eq!(
                db.get(format!("key{i:02}").as_bytes()).unwrap(),
                Some(b"v".to_vec())
            );
        }
    }

    #[test]
    fn test_empty_db_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let _db = open_db(&dir);
        }
        let db = open_db(&dir);
        let mut iter = db.iter().unwrap();
        iter.seek_to_first();
        assert!(!iter.valid());
        db.put(b"k", b"v").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_reopen_recovers_unflushed_writes() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_db(&dir);
            db.put(b"flushed", b"1").unwrap();
            db.compact_memtable().unwrap();
            // These stay in the PM memtable; nothing writes them to the
            // segment tier before the reopen.
            db.put(b"memonly", b"2").unwrap();
            db.delete(b"flushed").unwrap();
        }
        let db = open_db(&dir);
        assert_eq!(db.get(b"memonly").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.get(b"flushed").unwrap(), None);

        // Sequence numbers continue past recovered ones.
        db.put(b"memonly", b"3").unwrap();
        assert_eq!(db.get(b"memonly").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_recovery_after_heavy_writes() {
        let dir = TempDir::new().unwrap();
        let expected;
        {
            let db = open_db(&dir);
            expected = load_random_keys(&db, 800, 7);
        }
        let db = open_db(&dir);
        assert_matches_expected(&db, &expected);
    }

    #[test]
    fn test_iterator_under_snapshot_is_stable() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.put(b"a", b"1").unwrap();
        db.put(b"b", b"2").unwrap();
        let snapshot = db.snapshot().unwrap();
        db.put(b"b", b"changed").unwrap();
        db.put(b"c", b"3").unwrap();
        db.delete(b"a").unwrap();

        let mut iter = db.iter_at(&snapshot).unwrap();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
            ]
        );
        db.release_snapshot(snapshot);
    }

    #[test]
    fn test_second_open_fails_on_lock() {
        let dir = TempDir::new().unwrap();
        let _db = open_db(&dir);
        assert!(Db::open(test_options(&dir)).is_err());
    }

    #[test]
    fn test_destroy_removes_database_files() {
        let dir = TempDir::new().unwrap();
        let opts = test_options(&dir);
        {
            let db = Db::open(opts.clone()).unwrap();
            db.put(b"k", b"v").unwrap();
            db.compact_memtable().unwrap();
        }
        destroy(&opts).unwrap();
        assert!(!dir.path().join(CURRENT_FILE).exists());
        assert!(!dir.path().join(crate::leaf::index::RECOVERY_SENTINEL).exists());
        // A fresh database opens cleanly afterwards.
        let db = Db::open(opts).unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
    }
}

/// Append-only ASCII log of PM sub-arena layouts. Each record is
/// `n,base_1,len_1,...,base_n,len_n,` on its own line; the last complete
/// record wins during recovery.
pub(crate) struct GeometryLog {
    file: File,
    seed: u64,
}

impl GeometryLog {
    fn log_path(dir: &Path, seed: u64) -> PathBuf {
        dir.join(format!("{seed}.log"))
    }

    fn create(dir: &Path, seed: u64) -> Result<Self> {
        let file = File::create(Self::log_path(dir, seed))?;
        Ok(Self { file, seed })
    }

    fn open(dir: &Path, seed: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .open(Self::log_path(dir, seed))?;
        Ok(Self { file, seed })
    }

    pub(crate) fn seed(&self) -> u64 {
        self.seed
    }

    pub(crate) fn append_record(&mut self, extents: &[(u64, u64)]) -> Result<()> {
        let mut record = format!("{},", extents.len());
        for (base, len) in extents {
            record.push_str(&format!("{base},{len},"));
        }
        record.push('\n');
        self.file.write_all(record.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    fn read_last_record(dir: &Path, seed: u64) -> Result<Vec<(u64, u64)>> {
        let content = fs::read_to_string(Self::log_path(dir, seed))?;
        let mut last: Option<Vec<(u64, u64)>> = None;
        for line in content.lines() {
            let fields: Vec<&str> = line
                .split(',')
                .filter(|field| !field.is_empty())
                .collect();
            let Some(first) = fields.first() else { continue };
            let Ok(n) = first.parse::<usize>() else { continue };
            if fields.len() != 1 + 2 * n {
                // Torn tail record; the previous record wins.
                continue;
            }
            let mut extents = Vec::with_capacity(n);
            let mut ok = true;
            for pair in fields[1..].chunks_exact(2) {
                match (pair[0].parse::<u64>(), pair[1].parse::<u64>()) {
                    (Ok(base), Ok(len)) => extents.push((base, len)),
                    _ => {
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                last = Some(extents);
            }
        }
        last.ok_or_else(|| Error::Corruption(format!("{seed}.log holds no complete record")))
    }
}

/// Publication: the immutable memtable's contents are durable in the leaf
/// tier, so roll the geometry log to a record without it, flip `CURRENT`,
/// and release the immutable memtable.
pub(crate) fn publish_compaction(inner: &Arc<DbInner>) -> Result<()> {
    let mut state = inner.state.lock()?;
    if state.imm.is_none() {
        return Ok(());
    }
    let seed = state.max_sequence;
    let mem_extent = state.mem.extent();
    if seed == state.log.seed() {
        state.log.append_record(&[mem_extent])?;
    } else {
        let mut log = GeometryLog::create(&inner.opts.dir, seed)?;
        log.append_record(&[mem_extent])?;
        write_current(&inner.opts.dir, seed)?;
        let old_seed = state.log.seed();
        state.log = log;
        let _ = fs::remove_file(GeometryLog::log_path(&inner.opts.dir, old_seed));
    }
    state.imm = None;
    tracing::info!(seed, "compaction published");
    Ok(())
}

