//! Background compaction: flushing the immutable memtable into leaves,
//! splitting oversized leaves, and the storage-pressure loop that drives
//! garbage collection.
//!
//! Both the flush and the split phase fan out over worker threads. Work is
//! partitioned by leaf (striped round-robin over workers); every worker
//! owns its segment builders and stages leaf-index updates in a private
//! write batch, applied serially once the workers join.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::batch::WriteBatch;
use crate::error::{Error, Result};
use crate::format::{self, ValueType, MAX_SEQUENCE};
use crate::iterator::InternalIterator;
use crate::leaf::entry::{
    LeafIndexEntry, LeafIndexEntryBuilder, MiniRunIndexEntry, TraversalOrder,
};
use crate::memtable::Memtable;
use crate::segment::{SegmentBuilder, SegmentManager};

use super::{gc, maybe_schedule_compaction, publish_compaction, DbInner};

/// Staged leaf-index updates are flushed early past this size whenever a
/// segment rolls over, keeping worker memory bounded.
const LEAF_INDEX_WB_MAX: usize = 4 * 1024 * 1024;

/// Per-worker compaction state: staged leaf-index updates plus counters
/// folded into the log line at the end of the pass.
#[derive(Default)]
pub(crate) struct SubTaskState {
    pub written: u64,
    pub leaf_change: i64,
    pub wb: WriteBatch,
}

/// Hands out segment builders per group, rolling to a fresh segment once
/// the current file crosses the size threshold. Rolled-over and leftover
/// builders are finished (published) or discarded when empty.
pub(crate) struct GroupedSegmentAppender {
    builders: Vec<Option<SegmentBuilder>>,
    segments: SegmentManager,
    size_thresh: u64,
    gc_on_shortage: bool,
}

impl GroupedSegmentAppender {
    pub(crate) fn new(
        num_groups: usize,
        segments: SegmentManager,
        size_thresh: u64,
        gc_on_shortage: bool,
    ) -> Self {
        Self {
            builders: (0..num_groups).map(|_| None).collect(),
            segments,
            size_thresh,
            gc_on_shortage,
        }
    }

    /// The group's builder, rolling the segment first if it filled up.
    /// `switched` tells the caller a segment boundary was crossed (a safe
    /// point to flush staged leaf-index updates).
    pub(crate) fn builder(&mut self, group: usize) -> Result<(&mut SegmentBuilder, bool)> {
        let fresh_needed = match &self.builders[group] {
            Some(builder) => builder.file_size() >= self.size_thresh,
            None => true,
        };
        if !fresh_needed {
            return Ok((self.builders[group].as_mut().expect("checked above"), false));
        }
        if let Some(full) = self.builders[group].take() {
            retire_builder(full, &self.segments)?;
        }
        let (_, builder) = self.segments.new_segment_builder(self.gc_on_shortage)?;
        self.builders[group] = Some(builder);
        Ok((self.builders[group].as_mut().expect("just set"), true))
    }

    /// Publishes every open segment. Must be called before staged
    /// leaf-index updates referencing them are applied.
    pub(crate) fn finish_all(&mut self) -> Result<()> {
        for slot in &mut self.builders {
            if let Some(builder) = slot.take() {
                retire_builder(builder, &self.segments)?;
            }
        }
        Ok(())
    }
}

impl Drop for GroupedSegmentAppender {
    fn drop(&mut self) {
        if let Err(e) = self.finish_all() {
            tracing::warn!(error = %e, "failed to finish segment on appender drop");
        }
    }
}

fn retire_builder(builder: SegmentBuilder, segments: &SegmentManager) -> Result<()> {
    if builder.num_runs() == 0 && !builder.run_started() {
        let id = builder.segment_id();
        drop(builder);
        segments.discard_scratch(id)
    } else {
        builder.finish()
    }
}

/// Entry point of the background worker thread.
pub(crate) fn background_call(inner: Arc<DbInner>) {
    let skip = {
        let Ok(state) = inner.state.lock() else { return };
        inner.shutting_down.load(Ordering::SeqCst) || state.bg_error.is_some()
    };

    let result = if skip { Ok(()) } else { run_compaction(&inner) };

    let Ok(mut state) = inner.state.lock() else { return };
    if let Err(e) = result {
        tracing::error!(error = %e, "background compaction failed");
        state.bg_error = Some(e);
    }
    state.background_compaction_scheduled = false;
    maybe_schedule_compaction(&inner, &mut state);
    drop(state);
    inner.bg_cv.notify_all();
    inner.write_cv.notify_all();
}

/// The compaction phases, in order: storage-pressure GC, leaf split, flush
/// of the immutable memtable, publication.
///
/// The whole run holds the GC mutex, serializing it against leaf
/// optimization passes; gc-on-shortage callbacks fired by this thread's
/// own builders fall back to a no-op instead of re-entering.
fn run_compaction(inner: &Arc<DbInner>) -> Result<()> {
    let _leaf_guard = inner.gc_mutex.lock()?;
    let mut full_compacted = false;
    while inner.segments.under_storage_pressure() {
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        let collected = gc::garbage_collect_locked(inner)?;
        if collected == 0 {
            // Nothing left to reclaim by copying: force-split every leaf
            // to shake out space, then live with a higher ceiling.
            tracing::info!("gc reclaimed nothing; running full compaction");
            make_room_in_leaf_layer(inner, true)?;
            full_compacted = true;
            if inner.segments.under_storage_pressure() {
                let current = inner.segments.approximate_size();
                let slack = 1.0 - inner.segments.gc_threshold() + 0.2;
                let ceiling = current + (current as f64 * slack) as u64;
                inner.segments.set_storage_ceiling(ceiling);
                tracing::warn!(ceiling, "raised segment storage ceiling");
            }
        }
    }

    if !full_compacted {
        make_room_in_leaf_layer(inner, false)?;
    }
    if inner.shutting_down.load(Ordering::SeqCst) {
        return Ok(());
    }
    do_compaction_work(inner)?;
    publish_compaction(inner)
}

/// Splits leaves whose run count reached the cap (every leaf when
/// `force`). Candidates are striped round-robin over the split workers.
pub(crate) fn make_room_in_leaf_layer(inner: &Arc<DbInner>, force: bool) -> Result<()> {
    let candidates: Vec<(Vec<u8>, Vec<u8>)> = {
        let snapshot = inner.leaf_index.snapshot()?;
        let scan = inner.leaf_index.scan(Some(&snapshot));
        inner.leaf_index.release_snapshot(&snapshot);
        scan?
            .into_iter()
            .filter(|(_, raw)| {
                force
                    || LeafIndexEntry::from_bytes(raw.clone())
                        .map(|lie| lie.num_miniruns() >= inner.opts.leaf_max_num_miniruns)
                        .unwrap_or(false)
            })
            .collect()
    };
    if candidates.is_empty() {
        return Ok(());
    }
    tracing::info!(candidates = candidates.len(), force, "leaf split starting");

    let threads = inner.opts.split_leaf_num_threads.min(candidates.len()).max(1);
    let results = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for tid in 1..threads {
            let candidates = &candidates;
            handles.push(scope.spawn(move || split_worker(inner, candidates, tid, threads)));
        }
        let mut results = vec![split_worker(inner, &candidates, 0, threads)];
        for handle in handles {
            results.push(
                handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::IO("split worker panicked".to_string()))),
            );
        }
        results
    });

    for result in results {
        let mut state = result?;
        if !state.wb.is_empty() {
            inner.leaf_index.write(&mut state.wb)?;
        }
    }
    tracing::info!("leaf split finished");
    Ok(())
}

fn split_worker(
    inner: &Arc<DbInner>,
    candidates: &[(Vec<u8>, Vec<u8>)],
    tid: usize,
    threads: usize,
) -> Result<SubTaskState> {
    let mut state = SubTaskState::default();
    let mut appender = GroupedSegmentAppender::new(
        1,
        inner.segments.clone(),
        inner.opts.segment_file_size_thresh as u64,
        true,
    );
    for (i, (max_key, raw)) in candidates.iter().enumerate() {
        if i % threads == tid {
            split_one_leaf(inner, max_key, raw, &mut state, &mut appender)?;
        }
    }
    appender.finish_all()?;
    Ok(state)
}

/// Re-emits one leaf's live content as fresh single-run leaves of at most
/// `leaf_datasize_thresh * leaf_split_fill_frac` bytes each, preserving
/// the internal keys of retained versions, then retires the old leaf.
fn split_one_leaf(
    inner: &Arc<DbInner>,
    max_key: &[u8],
    lie_raw: &[u8],
    state: &mut SubTaskState,
    appender: &mut GroupedSegmentAppender,
) -> Result<()> {
    let lie = LeafIndexEntry::from_bytes(lie_raw.to_vec())?;
    let num_runs = lie.num_miniruns();
    if num_runs == 0 {
        state.wb.delete(max_key);
        state.leaf_change -= 1;
        inner.stats.delete_leaf(max_key);
        return Ok(());
    }

    let split_cap = ((inner.opts.leaf_datasize_thresh as f64 * inner.opts.leaf_split_fill_frac)
        as usize)
        .max(1);
    let mut iter = inner.leaf_store.db_iter_for_leaf(&lie, MAX_SEQUENCE)?;
    iter.seek_to_first();

    let mut new_leaves: Vec<(Vec<u8>, LeafIndexEntry)> = Vec::new();
    while iter.valid() {
        let (builder, switched) = appender.builder(0)?;
        if switched && state.wb.approximate_size() > LEAF_INDEX_WB_MAX {
            inner.leaf_index.write(&mut state.wb)?;
            state.wb.clear();
        }
        let seg_id = builder.segment_id();
        builder.start_minirun()?;

        let mut bytes = 0usize;
        let mut group_max_key = Vec::new();
        while iter.valid() {
            let entry_len = iter.internal_key().len() + iter.value().len();
            builder.add(iter.internal_key(), iter.value())?;
            bytes += entry_len;
            state.written += entry_len as u64;
            group_max_key = iter.key().to_vec();
            iter.next();
            if bytes >= split_cap {
                break;
            }
        }

        let run_no = builder.finish_minirun()?;
        let mre = MiniRunIndexEntry::build(
            seg_id,
            run_no,
            builder.finished_run_index_block(),
            builder.finished_run_filter_block(),
            builder.finished_run_data_size() as u32,
        );
        let new_lie =
            LeafIndexEntryBuilder::append_minirun_index_entry(&LeafIndexEntry::new(), &mre);
        new_leaves.push((group_max_key, new_lie));
    }
    iter.status()?;

    invalidate_leaf_runs(inner, &lie, 0, num_runs as u32 - 1)?;

    let new_keys: Vec<Vec<u8>> = new_leaves.iter().map(|(k, _)| k.clone()).collect();
    inner.stats.split_leaf(max_key, &new_keys);
    state.wb.delete(max_key);
    state.leaf_change -= 1;
    for (key, lie) in new_leaves {
        state.wb.put(key, lie.raw());
        state.leaf_change += 1;
    }
    Ok(())
}

/// Flushes the immutable memtable into the leaf tier. Work is partitioned
/// by leaf-index key boundaries; each subtask owns one boundary range.
pub(crate) fn do_compaction_work(inner: &Arc<DbInner>) -> Result<()> {
    let imm = {
        let state = inner.state.lock()?;
        match &state.imm {
            Some(imm) => Arc::clone(imm),
            None => return Ok(()),
        }
    };

    let snapshot = inner.leaf_index.snapshot()?;
    let boundaries = {
        let scan = inner.leaf_index.scan(Some(&snapshot));
        inner.leaf_index.release_snapshot(&snapshot);
        scan?
    };

    let num_tasks = boundaries.len() + 1;
    let threads = inner.opts.compact_num_threads.min(num_tasks).max(1);
    tracing::info!(
        leaves = boundaries.len(),
        threads,
        imm_bytes = imm.approximate_memory_usage(),
        "flush compaction starting"
    );

    let results = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for tid in 1..threads {
            let boundaries = &boundaries;
            let imm = &imm;
            handles.push(scope.spawn(move || compaction_worker(inner, imm, boundaries, tid, threads)));
        }
        let mut results = vec![compaction_worker(inner, &imm, &boundaries, 0, threads)];
        for handle in handles {
            results.push(
                handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::IO("compaction worker panicked".to_string()))),
            );
        }
        results
    });

    for result in results {
        let mut state = result?;
        if !state.wb.is_empty() {
            inner.leaf_index.write(&mut state.wb)?;
        }
    }
    tracing::info!("flush compaction finished");
    Ok(())
}

fn compaction_worker(
    inner: &Arc<DbInner>,
    imm: &Arc<Memtable>,
    boundaries: &[(Vec<u8>, Vec<u8>)],
    tid: usize,
    threads: usize,
) -> Result<SubTaskState> {
    let mut state = SubTaskState::default();
    let mut appender = GroupedSegmentAppender::new(
        1,
        inner.segments.clone(),
        inner.opts.segment_file_size_thresh as u64,
        true,
    );
    for i in 0..=boundaries.len() {
        if i % threads != tid {
            continue;
        }
        let start = if i == 0 {
            None
        } else {
            Some(boundaries[i - 1].0.as_slice())
        };
        let leaf = boundaries.get(i).map(|(k, v)| (k.as_slice(), v.as_slice()));
        flush_range(inner, imm, start, leaf, &mut state, &mut appender)?;
    }
    appender.finish_all()?;
    Ok(state)
}

/// Streams the immutable memtable's entries with user keys in
/// `(start, leaf.max_key]` into one new minirun appended to that leaf, or
/// packs the keys past the last leaf into brand-new leaves.
fn flush_range(
    inner: &Arc<DbInner>,
    imm: &Arc<Memtable>,
    start: Option<&[u8]>,
    leaf: Option<(&[u8], &[u8])>,
    state: &mut SubTaskState,
    appender: &mut GroupedSegmentAppender,
) -> Result<()> {
    let mut mit = imm.iter();
    match start {
        None => mit.seek_to_first(),
        Some(start) => {
            mit.seek(&format::seek_key(start, MAX_SEQUENCE));
            // The previous leaf owns every version of its max key.
            while mit.valid() && format::user_key(mit.key()) <= start {
                mit.next();
            }
        }
    }
    mit.status()?;

    if let Some((leaf_max_key, lie_raw)) = leaf {
        let lie = LeafIndexEntry::from_bytes(lie_raw.to_vec())?;
        let (builder, switched) = appender.builder(0)?;
        if switched && state.wb.approximate_size() > LEAF_INDEX_WB_MAX {
            inner.leaf_index.write(&mut state.wb)?;
            state.wb.clear();
        }
        let seg_id = builder.segment_id();

        let mut count = 0u64;
        while mit.valid() {
            if format::user_key(mit.key()) > leaf_max_key {
                break;
            }
            if !builder.run_started() {
                builder.start_minirun()?;
            }
            builder.add(mit.key(), mit.value())?;
            state.written += (mit.key().len() + mit.value().len()) as u64;
            count += 1;
            mit.next();
        }
        mit.status()?;
        inner.stats.update_write_hotness(leaf_max_key, count);

        if builder.run_started() {
            let run_no = builder.finish_minirun()?;
            let mre = MiniRunIndexEntry::build(
                seg_id,
                run_no,
                builder.finished_run_index_block(),
                builder.finished_run_filter_block(),
                builder.finished_run_data_size() as u32,
            );
            let new_lie = LeafIndexEntryBuilder::append_minirun_index_entry(&lie, &mre);
            state.wb.put(leaf_max_key, new_lie.raw());
            inner
                .stats
                .update_leaf_num_runs(leaf_max_key, new_lie.num_miniruns());
        } else if lie.is_empty() {
            // The leaf was emptied by self-compaction or split and gets
            // nothing new: retire it.
            state.wb.delete(leaf_max_key);
            state.leaf_change -= 1;
            inner.stats.delete_leaf(leaf_max_key);
        }
        return Ok(());
    }

    // Keys beyond the last leaf: pack fresh leaves.
    let new_leaf_cap = ((inner.opts.leaf_datasize_thresh as f64 * inner.opts.new_leaf_fill_frac)
        as usize)
        .max(1);
    while mit.valid() {
        let (builder, switched) = appender.builder(0)?;
        if switched && state.wb.approximate_size() > LEAF_INDEX_WB_MAX {
            inner.leaf_index.write(&mut state.wb)?;
            state.wb.clear();
        }
        let seg_id = builder.segment_id();
        builder.start_minirun()?;

        let mut bytes = 0usize;
        let mut count = 0u64;
        let mut leaf_max_key: Vec<u8> = Vec::new();
        while mit.valid() {
            let user_key = format::user_key(mit.key());
            let entry_len = mit.key().len() + mit.value().len();
            // A leaf holds at least one pair and never splits the versions
            // of one user key across leaves.
            if count > 0 && user_key != leaf_max_key.as_slice() && bytes + entry_len >= new_leaf_cap
            {
                break;
            }
            bytes += entry_len;
            leaf_max_key = user_key.to_vec();
            builder.add(mit.key(), mit.value())?;
            state.written += entry_len as u64;
            count += 1;
            mit.next();
        }
        mit.status()?;

        let run_no = builder.finish_minirun()?;
        let mre = MiniRunIndexEntry::build(
            seg_id,
            run_no,
            builder.finished_run_index_block(),
            builder.finished_run_filter_block(),
            builder.finished_run_data_size() as u32,
        );
        let new_lie =
            LeafIndexEntryBuilder::append_minirun_index_entry(&LeafIndexEntry::new(), &mre);
        state.wb.put(leaf_max_key.as_slice(), new_lie.raw());
        state.leaf_change += 1;
        inner.stats.new_leaf(&leaf_max_key, 1);
        inner.stats.update_write_hotness(&leaf_max_key, count);
    }
    Ok(())
}

/// Merges a leaf's run range `[start, end]` into one minirun, keeping only
/// the newest version of each user key. When the range covers the whole
/// leaf, keys whose newest version is a tombstone are dropped physically.
/// Returns the updated leaf index entry.
pub(crate) fn compact_leaf(
    inner: &Arc<DbInner>,
    builder: &mut SegmentBuilder,
    lie: &LeafIndexEntry,
    start: u32,
    end: u32,
) -> Result<LeafIndexEntry> {
    let cover_whole_range = (end - start + 1) as usize == lie.num_miniruns();
    let mut iter = inner.leaf_store.iter_leaf(lie, start, end)?;
    iter.seek_to_first();

    let mut current_user_key: Option<Vec<u8>> = None;
    while iter.valid() {
        let parsed = format::parse_internal_key(iter.key())?;
        let first_occurrence = current_user_key.as_deref() != Some(parsed.user_key);
        if first_occurrence {
            current_user_key = Some(parsed.user_key.to_vec());
            if !(cover_whole_range && parsed.vtype == ValueType::Deletion) {
                if !builder.run_started() {
                    builder.start_minirun()?;
                }
                builder.add(iter.key(), iter.value())?;
            }
        }
        iter.next();
    }
    iter.status()?;

    if !builder.run_started() {
        // Everything in the range compacted away.
        LeafIndexEntryBuilder::remove_minirun_range(lie, start, end)
    } else {
        let seg_id = builder.segment_id();
        let run_no = builder.finish_minirun()?;
        let mre = MiniRunIndexEntry::build(
            seg_id,
            run_no,
            builder.finished_run_index_block(),
            builder.finished_run_filter_block(),
            builder.finished_run_data_size() as u32,
        );
        LeafIndexEntryBuilder::replace_minirun_range(lie, start, end, &mre)
    }
}

/// Bumps the invalidation counters for the runs `[start, end]` of a leaf.
pub(crate) fn invalidate_leaf_runs(
    inner: &Arc<DbInner>,
    lie: &LeafIndexEntry,
    start: u32,
    end: u32,
) -> Result<()> {
    let mut status = Ok(());
    lie.for_each_minirun_index_entry(TraversalOrder::Forward, |mre, idx| {
        if idx >= start && idx <= end {
            if let Err(e) = inner
                .segments
                .invalidate_segment_run(mre.segment_id(), mre.run_no())
            {
                status = Err(e);
                return true;
            }
        }
        false
    })?;
    status
}
