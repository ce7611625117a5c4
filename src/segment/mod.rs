//! Append-only segment files and their manager.
//!
//! A segment packs one or more miniruns followed by a footer of fixed-size
//! run-handle records:
//!
//! ```text
//! [minirun 0][minirun 1]...[minirun N-1]
//! [u64 run_start][u64 last_block_offset][u64 last_block_size]  x N
//! [u64 footer_byte_length]
//! ```
//!
//! Builders write under the scratch name `NNNNNN.seg.tmp`; the rename to
//! `NNNNNN.seg` is the publication point. The manager tracks per-segment
//! invalidation counts in memory only: the counts may be stale after a
//! crash, which is safe because GC re-checks liveness against the leaf
//! index before copying anything.

pub mod builder;

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::block::{Block, BlockHandle};
use crate::config::Options;
use crate::error::Result;

pub use builder::SegmentBuilder;

const RUN_HANDLE_LEN: u64 = 24;

/// Location of one minirun inside its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiniRunHandle {
    pub run_start: u64,
    pub last_block_handle: BlockHandle,
}

/// A published, immutable segment file.
pub struct Segment {
    id: u32,
    file: Mutex<File>,
    size: u64,
    /// Offset where the footer begins; run data ends here.
    data_end: u64,
    run_handles: Vec<MiniRunHandle>,
    invalidated: RwLock<HashSet<u32>>,
}

impl Segment {
    pub fn open(id: u32, path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        if size < 8 {
            return errcorruption!("segment {id} too small for a footer");
        }

        file.seek(SeekFrom::End(-8))?;
        let mut len_buf = [0u8; 8];
        file.read_exact(&mut len_buf)?;
        let footer_len = u64::from_be_bytes(len_buf);
        if footer_len % RUN_HANDLE_LEN != 0 || footer_len + 8 > size {
            return errcorruption!("segment {id} footer length {footer_len} is malformed");
        }

        let data_end = size - 8 - footer_len;
        file.seek(SeekFrom::Start(data_end))?;
        let mut footer = vec![0u8; footer_len as usize];
        file.read_exact(&mut footer)?;

        let mut run_handles = Vec::with_capacity((footer_len / RUN_HANDLE_LEN) as usize);
        for record in footer.chunks_exact(RUN_HANDLE_LEN as usize) {
            run_handles.push(MiniRunHandle {
                run_start: u64::from_be_bytes(record[0..8].try_into().unwrap()),
                last_block_handle: BlockHandle {
                    offset: u64::from_be_bytes(record[8..16].try_into().unwrap()),
                    size: u64::from_be_bytes(record[16..24].try_into().unwrap()),
                },
            });
        }

        Ok(Self {
            id,
            file: Mutex::new(file),
            size,
            data_end,
            run_handles,
            invalidated: RwLock::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn num_runs(&self) -> usize {
        self.run_handles.len()
    }

    pub fn run_handle(&self, run_no: u32) -> Option<&MiniRunHandle> {
        self.run_handles.get(run_no as usize)
    }

    /// Byte extent of a run: from its start to the next run's start (or the
    /// footer for the last run).
    pub fn run_size(&self, run_no: u32) -> u64 {
        let start = self.run_handles[run_no as usize].run_start;
        let end = self
            .run_handles
            .get(run_no as usize + 1)
            .map(|h| h.run_start)
            .unwrap_or(self.data_end);
        end - start
    }

    /// Visits every run as `(run_no, handle, run_size, valid)`. The
    /// callback returns `true` to stop early.
    pub fn for_each_run(&self, mut f: impl FnMut(u32, &MiniRunHandle, u64, bool) -> bool) {
        let invalidated = self
            .invalidated
            .read()
            .map(|set| set.clone())
            .unwrap_or_default();
        for (run_no, handle) in self.run_handles.iter().enumerate() {
            let run_no = run_no as u32;
            let valid = !invalidated.contains(&run_no);
            if f(run_no, handle, self.run_size(run_no), valid) {
                break;
            }
        }
    }

    /// Marks a run invalidated; returns false if it already was.
    pub fn invalidate_run(&self, run_no: u32) -> bool {
        self.invalidated
            .write()
            .map(|mut set| set.insert(run_no))
            .unwrap_or(false)
    }

    pub fn invalidated_count(&self) -> usize {
        self.invalidated.read().map(|set| set.len()).unwrap_or(0)
    }

    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_block(&self, handle: BlockHandle) -> Result<Block> {
        Block::decode(self.read_at(handle.offset, handle.size as usize)?)
    }
}

type GcCallback = Box<dyn Fn() -> usize + Send + Sync>;

struct ManagerInner {
    dir: PathBuf,
    fp_rate: f64,
    gc_threshold: f64,
    /// Adaptive ceiling on total segment storage; zero disables pressure
    /// checks.
    storage_ceiling: AtomicU64,
    next_id: AtomicU32,
    segments: RwLock<BTreeMap<u32, Arc<Segment>>>,
    gc_callback: RwLock<Option<GcCallback>>,
}

/// Owns the pool of segment files under the database directory.
#[derive(Clone)]
pub struct SegmentManager {
    inner: Arc<ManagerInner>,
}

impl SegmentManager {
    /// Scans the directory, opening published segments and discarding
    /// leftover scratch files from a previous crash.
    pub fn open(opts: &Options) -> Result<Self> {
        let dir = opts.dir.clone();
        let mut segments = BTreeMap::new();
        let mut max_id = 0u32;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".seg.tmp") {
                if stem.parse::<u32>().is_ok() {
                    tracing::warn!(file = name, "removing unfinished segment scratch file");
                    let _ = fs::remove_file(entry.path());
                }
                continue;
            }
            if let Some(stem) = name.strip_suffix(".seg") {
                if let Ok(id) = stem.parse::<u32>() {
                    let segment = Segment::open(id, &entry.path())?;
                    max_id = max_id.max(id);
                    segments.insert(id, Arc::new(segment));
                }
            }
        }
        tracing::info!(count = segments.len(), "segment manager opened");
        Ok(Self {
            inner: Arc::new(ManagerInner {
                dir,
                fp_rate: opts.minirun_filter_fp_rate,
                gc_threshold: opts.segments_storage_size_gc_threshold,
                storage_ceiling: AtomicU64::new(opts.maximum_segments_storage_size as u64),
                next_id: AtomicU32::new(max_id + 1),
                segments: RwLock::new(segments),
                gc_callback: RwLock::new(None),
            }),
        })
    }

    /// Installs the callback invoked for synchronous GC when a new builder
    /// is requested under storage pressure.
    pub fn set_gc_callback(&self, callback: impl Fn() -> usize + Send + Sync + 'static) {
        if let Ok(mut slot) = self.inner.gc_callback.write() {
            *slot = Some(Box::new(callback));
        }
    }

    pub fn segment_path(&self, id: u32) -> PathBuf {
        self.inner.dir.join(format!("{id:06}.seg"))
    }

    fn scratch_path(&self, id: u32) -> PathBuf {
        self.inner.dir.join(format!("{id:06}.seg.tmp"))
    }

    /// Allocates a segment id and opens a builder over its scratch file.
    /// When `gc_on_shortage` is set and storage pressure has been reached,
    /// a synchronous GC pass runs first.
    pub fn new_segment_builder(&self, gc_on_shortage: bool) -> Result<(u32, SegmentBuilder)> {
        if gc_on_shortage && self.under_storage_pressure() {
            let callback = self.inner.gc_callback.read()?;
            if let Some(gc) = callback.as_ref() {
                let collected = gc();
                tracing::info!(collected, "synchronous gc on segment shortage");
            }
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.scratch_path(id))?;
        Ok((id, SegmentBuilder::new(self.clone(), id, file, self.inner.fp_rate)))
    }

    /// Publishes a finished segment: renames the scratch file to the
    /// canonical name and registers the reader.
    pub fn rename_segment(&self, id: u32) -> Result<()> {
        let target = self.segment_path(id);
        fs::rename(self.scratch_path(id), &target)?;
        let segment = Arc::new(Segment::open(id, &target)?);
        self.inner.segments.write()?.insert(id, segment);
        Ok(())
    }

    pub fn get_segment(&self, id: u32) -> Option<Arc<Segment>> {
        self.inner.segments.read().ok()?.get(&id).cloned()
    }

    /// Bumps the invalidation count for `(seg_id, run_no)`. Idempotent per
    /// run; unknown segments are ignored (they may already be collected).
    pub fn invalidate_segment_run(&self, seg_id: u32, run_no: u32) -> Result<()> {
        if let Some(segment) = self.get_segment(seg_id) {
            if run_no as usize >= segment.num_runs() {
                return errinvalid!("segment {seg_id} has no run {run_no}");
            }
            segment.invalidate_run(run_no);
        }
        Ok(())
    }

    /// Drops the scratch file of a builder that never produced a run.
    pub fn discard_scratch(&self, id: u32) -> Result<()> {
        let path = self.scratch_path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Deletes a segment's file and metadata. Called by GC once every run
    /// in it has been copied forward or found stale.
    pub fn remove_segment(&self, id: u32) -> Result<()> {
        let removed = self.inner.segments.write()?.remove(&id);
        if removed.is_some() {
            fs::remove_file(self.segment_path(id))?;
        }
        Ok(())
    }

    /// Up to `k` segments ordered by descending invalidated/total ratio.
    /// Segments with nothing invalidated are not candidates.
    pub fn get_most_invalidated_segments(&self, k: usize) -> Vec<Arc<Segment>> {
        let Ok(segments) = self.inner.segments.read() else {
            return Vec::new();
        };
        let mut scored: Vec<(f64, Arc<Segment>)> = segments
            .values()
            .filter(|seg| seg.invalidated_count() > 0 && seg.num_runs() > 0)
            .map(|seg| {
                (
                    seg.invalidated_count() as f64 / seg.num_runs() as f64,
                    Arc::clone(seg),
                )
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(k).map(|(_, seg)| seg).collect()
    }

    pub fn for_each_segment(&self, mut f: impl FnMut(&Arc<Segment>)) {
        if let Ok(segments) = self.inner.segments.read() {
            for segment in segments.values() {
                f(segment);
            }
        }
    }

    /// Sum of published segment file sizes.
    pub fn approximate_size(&self) -> u64 {
        self.inner
            .segments
            .read()
            .map(|segments| segments.values().map(|s| s.size()).sum())
            .unwrap_or(0)
    }

    pub fn storage_ceiling(&self) -> u64 {
        self.inner.storage_ceiling.load(Ordering::SeqCst)
    }

    /// Raises the adaptive storage ceiling after a fruitless GC pass.
    pub fn set_storage_ceiling(&self, ceiling: u64) {
        self.inner.storage_ceiling.store(ceiling, Ordering::SeqCst);
    }

    pub fn gc_threshold(&self) -> f64 {
        self.inner.gc_threshold
    }

    pub fn under_storage_pressure(&self) -> bool {
        let ceiling = self.storage_ceiling();
        ceiling > 0 && self.approximate_size() as f64 >= self.gc_threshold() * ceiling as f64
    }
}
