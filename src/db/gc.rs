//! Segment garbage collection.
//!
//! Candidates are the segments with the highest invalidated-run ratio.
//! For each still-valid run we probe liveness: read the first key of the
//! run's *last* block, seek the leaf index for the owning leaf (leaf max
//! keys are inclusive upper bounds, so any key of the run lands on its
//! leaf), and scan that leaf's index entry for `(segment, run)`. Runs no
//! leaf references are stale and skipped; live runs are copied whole into
//! a destination segment and the leaf index entry is rewritten to point
//! at the copy. Once every run of a candidate is handled the segment file
//! is deleted.
//!
//! GC never garbage-collects on its own segment shortage (no nested GC)
//! and is serialized against leaf optimization by the GC mutex.

use std::collections::HashMap;
use std::sync::Arc;

use crate::batch::WriteBatch;
use crate::error::Result;
use crate::format;
use crate::iterator::InternalIterator;
use crate::leaf::entry::{LeafIndexEntry, LeafIndexEntryBuilder, MiniRunIndexEntry, TraversalOrder};
use crate::segment::Segment;

use super::compaction::GroupedSegmentAppender;
use super::DbInner;

const GC_SEGMENT_CANDIDATES: usize = 5;

/// Runs one GC pass; returns the number of segments collected.
///
/// The GC mutex is taken with `try_lock`: the holder (a compaction's leaf
/// phases, a leaf optimization, or another GC pass) already serializes the
/// work this pass would do, and a blocking lock here would deadlock when
/// that holder's own segment builder triggers gc-on-shortage.
pub(crate) fn garbage_collect(inner: &Arc<DbInner>) -> Result<usize> {
    let Ok(_guard) = inner.gc_mutex.try_lock() else {
        tracing::debug!("gc skipped; another pass holds the gc mutex");
        return Ok(0);
    };
    garbage_collect_locked(inner)
}

/// The GC pass body; the caller holds the GC mutex.
pub(crate) fn garbage_collect_locked(inner: &Arc<DbInner>) -> Result<usize> {
    let candidates = inner
        .segments
        .get_most_invalidated_segments(GC_SEGMENT_CANDIDATES);
    if candidates.is_empty() {
        return Ok(0);
    }
    tracing::info!(candidates = candidates.len(), "garbage collection starting");

    let snapshot = inner.leaf_index.snapshot()?;
    // Nested GC is forbidden: the destination builder never triggers
    // gc-on-shortage.
    let mut appender = GroupedSegmentAppender::new(
        1,
        inner.segments.clone(),
        inner.opts.segment_file_size_thresh as u64,
        false,
    );
    // Staged LIE rewrites, so a second run of the same leaf in this pass
    // observes the first rewrite instead of clobbering it.
    let mut pending: HashMap<Vec<u8>, LeafIndexEntry> = HashMap::new();

    let mut result = Ok(());
    for segment in &candidates {
        result = garbage_collect_segment(inner, segment, &mut appender, &mut pending, &snapshot);
        if result.is_err() {
            break;
        }
    }
    inner.leaf_index.release_snapshot(&snapshot);
    // Abort the pass on error: already-written destination segments get
    // published with no leaf references and a later pass collects them.
    result?;

    // Destination segments must be durable before the leaf index points
    // at them.
    appender.finish_all()?;
    if !pending.is_empty() {
        let mut wb = WriteBatch::new();
        for (leaf_key, lie) in &pending {
            wb.put(leaf_key.clone(), lie.raw());
        }
        inner.leaf_index.write(&mut wb)?;
    }
    for segment in &candidates {
        inner.segments.remove_segment(segment.id())?;
    }
    tracing::info!(collected = candidates.len(), "garbage collection finished");
    Ok(candidates.len())
}

fn garbage_collect_segment(
    inner: &Arc<DbInner>,
    segment: &Arc<Segment>,
    appender: &mut GroupedSegmentAppender,
    pending: &mut HashMap<Vec<u8>, LeafIndexEntry>,
    snapshot: &Arc<crate::leaf::index::LeafSnapshot>,
) -> Result<()> {
    let mut runs: Vec<(u32, crate::segment::MiniRunHandle)> = Vec::new();
    segment.for_each_run(|run_no, handle, _run_size, valid| {
        if valid {
            runs.push((run_no, *handle));
        }
        false
    });

    for (run_no, handle) in runs {
        // Probe user key from the first entry of the run's last block.
        let block = Arc::new(segment.read_block(handle.last_block_handle)?);
        let mut block_iter = block.iter();
        block_iter.seek_to_first();
        if !block_iter.valid() {
            block_iter.status()?;
            continue;
        }
        let probe = format::parse_internal_key(block_iter.key())?.user_key.to_vec();

        // Locate the owning leaf, preferring this pass's own rewrites.
        let owned = match inner.leaf_index.seek(&probe, Some(snapshot))? {
            Some((leaf_key, raw)) => {
                let lie = match pending.get(&leaf_key) {
                    Some(rewritten) => rewritten.clone(),
                    None => LeafIndexEntry::from_bytes(raw)?,
                };
                Some((leaf_key, lie))
            }
            None => None,
        };
        let Some((leaf_key, lie)) = owned else {
            continue;
        };

        // Is (segment, run) still referenced by that leaf?
        let mut run_idx: Option<u32> = None;
        lie.for_each_minirun_index_entry(TraversalOrder::Forward, |mre, idx| {
            if mre.segment_id() == segment.id() && mre.run_no() == run_no {
                run_idx = Some(idx);
                return true;
            }
            false
        })?;
        let Some(run_idx) = run_idx else {
            // Stale minirun: no leaf points at it anymore.
            continue;
        };

        let (builder, _switched) = appender.builder(0)?;
        let new_lie = copy_minirun(inner, builder, &lie, run_idx)?;
        pending.insert(leaf_key, new_lie);
    }
    Ok(())
}

/// Copies one entire minirun into the destination builder and returns the
/// leaf index entry with the old descriptor replaced by the copy's.
fn copy_minirun(
    inner: &Arc<DbInner>,
    builder: &mut crate::segment::SegmentBuilder,
    lie: &LeafIndexEntry,
    run_idx: u32,
) -> Result<LeafIndexEntry> {
    let mut source = inner.leaf_store.iter_leaf(lie, run_idx, run_idx)?;
    source.seek_to_first();
    builder.start_minirun()?;
    while source.valid() {
        builder.add(source.key(), source.value())?;
        source.next();
    }
    source.status()?;
    let seg_id = builder.segment_id();
    let run_no = builder.finish_minirun()?;
    let replacement = MiniRunIndexEntry::build(
        seg_id,
        run_no,
        builder.finished_run_index_block(),
        builder.finished_run_filter_block(),
        builder.finished_run_data_size() as u32,
    );
    LeafIndexEntryBuilder::replace_minirun_range(lie, run_idx, run_idx, &replacement)
}
