//! Read-hotness driven leaf optimization.
//!
//! A dedicated thread wakes on a fixed interval, refreshes the hotness
//! decay, and (when enabled) self-compacts the hottest multi-run leaves
//! down to a single minirun to cut their lookup latency.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::batch::WriteBatch;
use crate::leaf::entry::LeafIndexEntry;
use crate::error::Result;

use super::compaction::{compact_leaf, invalidate_leaf_runs, GroupedSegmentAppender};
use super::DbInner;

/// At most this many leaves are optimized per pass.
const OPTIMIZATION_K: usize = 100;

const LEAF_INDEX_WB_MAX: usize = 4 * 1024 * 1024;

pub(crate) fn spawn_optimizer(inner: Arc<DbInner>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let interval = inner.opts.read_refresh_interval;
        loop {
            {
                let (lock, cv) = &inner.opt_shutdown;
                let Ok(guard) = lock.lock() else { return };
                let Ok((guard, _timeout)) = cv.wait_timeout(guard, interval) else {
                    return;
                };
                if *guard {
                    return;
                }
            }
            if inner.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = optimize_leaves(&inner) {
                tracing::error!(error = %e, "leaf optimization pass failed");
            }
        }
    })
}

/// One optimization pass: refresh decays, pick the hottest candidates,
/// self-compact each down to one run.
pub(crate) fn optimize_leaves(inner: &Arc<DbInner>) -> Result<()> {
    inner.stats.refresh_hotness();
    if !inner.opts.enable_leaf_read_opt {
        return Ok(());
    }

    // A compaction or GC pass holding the mutex already reshapes the leaf
    // layer; skip this interval rather than queue behind it.
    let Ok(_guard) = inner.gc_mutex.try_lock() else {
        return Ok(());
    };

    // Hottest leaves with at least two runs; only positive hotness
    // qualifies.
    let mut candidates: Vec<(f64, Vec<u8>)> = Vec::new();
    inner.stats.for_each_leaf(|leaf_key, stat| {
        if stat.num_runs >= 2 && stat.read_hotness > 0.0 {
            candidates.push((stat.read_hotness, leaf_key.to_vec()));
        }
    });
    if candidates.is_empty() {
        return Ok(());
    }
    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(OPTIMIZATION_K);

    let snapshot = inner.leaf_index.snapshot()?;
    let mut appender = GroupedSegmentAppender::new(
        1,
        inner.segments.clone(),
        inner.opts.segment_file_size_thresh as u64,
        true,
    );
    let mut wb = WriteBatch::new();
    let mut compacted_runs = 0usize;

    let mut run = || -> Result<()> {
        for (_hotness, leaf_key) in &candidates {
            let Some(raw) = inner.leaf_index.get(leaf_key, Some(&snapshot))? else {
                continue;
            };
            let lie = LeafIndexEntry::from_bytes(raw)?;
            let num_runs = lie.num_miniruns();
            if num_runs < 2 {
                continue;
            }

            let (builder, switched) = appender.builder(0)?;
            if switched && wb.approximate_size() > LEAF_INDEX_WB_MAX {
                inner.leaf_index.write(&mut wb)?;
                wb.clear();
            }
            let new_lie = compact_leaf(inner, builder, &lie, 0, num_runs as u32 - 1)?;
            wb.put(leaf_key.clone(), new_lie.raw());
            invalidate_leaf_runs(inner, &lie, 0, num_runs as u32 - 1)?;
            compacted_runs += num_runs;
            inner.stats.update_leaf_num_runs(leaf_key, 1);
        }
        appender.finish_all()?;
        inner.leaf_index.write(&mut wb)?;
        Ok(())
    };
    let result = run();
    inner.leaf_index.release_snapshot(&snapshot);
    result?;

    if compacted_runs > 0 {
        tracing::info!(compacted_runs, "leaf optimization compacted runs");
    }
    Ok(())
}
