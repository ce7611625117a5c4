//! Builders that stream key-value pairs into segment files as miniruns.

use std::fs::File;
use std::io::{BufWriter, Write};

use crate::block::{BlockBuilder, BlockHandle, BLOCK_SIZE};
use crate::error::Result;
use crate::filter::BloomFilter;
use crate::format;
use crate::segment::{MiniRunHandle, SegmentManager};

/// Builds one minirun at a time into the shared segment file: data blocks,
/// then the run's index block and filter block. The index and filter are
/// kept in memory after a run finishes so the caller can embed them in a
/// minirun index entry.
pub struct MiniRunBuilder {
    fp_rate: f64,
    offset: u64,
    data_block: BlockBuilder,
    block_first_key: Option<Vec<u8>>,
    index_entries: Vec<(Vec<u8>, BlockHandle)>,
    filter_keys: Vec<Vec<u8>>,
    data_size: u64,
    last_block_handle: BlockHandle,
    finished_index_block: Vec<u8>,
    finished_filter_block: Vec<u8>,
}

impl MiniRunBuilder {
    fn new(fp_rate: f64) -> Self {
        Self {
            fp_rate,
            offset: 0,
            data_block: BlockBuilder::new(),
            block_first_key: None,
            index_entries: Vec::new(),
            filter_keys: Vec::new(),
            data_size: 0,
            last_block_handle: BlockHandle::default(),
            finished_index_block: Vec::new(),
            finished_filter_block: Vec::new(),
        }
    }

    /// Begins a new run at the given file offset.
    fn reset(&mut self, run_start: u64) {
        self.offset = run_start;
        self.data_block = BlockBuilder::new();
        self.block_first_key = None;
        self.index_entries.clear();
        self.filter_keys.clear();
        self.data_size = 0;
        self.last_block_handle = BlockHandle::default();
    }

    fn add(&mut self, writer: &mut BufWriter<File>, key: &[u8], value: &[u8]) -> Result<()> {
        if self.block_first_key.is_none() {
            self.block_first_key = Some(key.to_vec());
        }
        self.data_block.add_entry(key, value);
        self.filter_keys.push(format::user_key(key).to_vec());
        if self.data_block.len() >= BLOCK_SIZE {
            self.flush_data_block(writer)?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self, writer: &mut BufWriter<File>) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let block = std::mem::take(&mut self.data_block).finish();
        let first_key = self
            .block_first_key
            .take()
            .expect("non-empty block without a first key");
        let handle = BlockHandle {
            offset: self.offset,
            size: block.len() as u64,
        };
        writer.write_all(&block)?;
        self.index_entries.push((first_key, handle));
        self.last_block_handle = handle;
        self.data_size += block.len() as u64;
        self.offset += block.len() as u64;
        Ok(())
    }

    /// Flushes the tail data block and writes the index and filter blocks.
    fn finish(&mut self, writer: &mut BufWriter<File>) -> Result<()> {
        self.flush_data_block(writer)?;

        let mut index_builder = BlockBuilder::new();
        for (first_key, handle) in &self.index_entries {
            index_builder.add_entry(first_key, &handle.encode());
        }
        self.finished_index_block = index_builder.finish();
        writer.write_all(&self.finished_index_block)?;
        self.offset += self.finished_index_block.len() as u64;

        let mut filter = BloomFilter::new(self.filter_keys.len(), self.fp_rate);
        for key in &self.filter_keys {
            filter.insert(key);
        }
        self.finished_filter_block = filter.encode();
        writer.write_all(&self.finished_filter_block)?;
        self.offset += self.finished_filter_block.len() as u64;
        Ok(())
    }

    fn file_size(&self) -> u64 {
        self.offset
    }
}

/// Streams miniruns into one segment file and publishes it on finish.
pub struct SegmentBuilder {
    writer: BufWriter<File>,
    seg_id: u32,
    manager: SegmentManager,
    run_builder: MiniRunBuilder,
    run_started: bool,
    prev_file_size: u64,
    run_handles: Vec<MiniRunHandle>,
    num_entries: u64,
}

impl SegmentBuilder {
    pub(super) fn new(manager: SegmentManager, seg_id: u32, file: File, fp_rate: f64) -> Self {
        Self {
            writer: BufWriter::new(file),
            seg_id,
            manager,
            run_builder: MiniRunBuilder::new(fp_rate),
            run_started: false,
            prev_file_size: 0,
            run_handles: Vec::new(),
            num_entries: 0,
        }
    }

    pub fn segment_id(&self) -> u32 {
        self.seg_id
    }

    pub fn run_started(&self) -> bool {
        self.run_started
    }

    /// Begins a fresh minirun. A run must not already be open.
    pub fn start_minirun(&mut self) -> Result<()> {
        if self.run_started {
            return errinvalid!("minirun already started in segment {}", self.seg_id);
        }
        self.run_builder.reset(self.prev_file_size);
        self.run_started = true;
        Ok(())
    }

    /// Appends one internal-key/value pair to the open minirun. Keys must
    /// arrive in internal-key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(self.run_started);
        self.run_builder.add(&mut self.writer, key, value)?;
        self.num_entries += 1;
        Ok(())
    }

    /// Finalizes the open minirun, records its handle, and returns its
    /// zero-based run number within this segment.
    pub fn finish_minirun(&mut self) -> Result<u32> {
        if !self.run_started {
            return errinvalid!("finish_minirun without an open run");
        }
        self.run_builder.finish(&mut self.writer)?;
        let run_no = self.run_handles.len() as u32;
        self.run_handles.push(MiniRunHandle {
            run_start: self.prev_file_size,
            last_block_handle: self.run_builder.last_block_handle,
        });
        self.prev_file_size = self.run_builder.file_size();
        self.run_started = false;
        Ok(run_no)
    }

    /// Index block of the most recently finished minirun.
    pub fn finished_run_index_block(&self) -> &[u8] {
        debug_assert!(!self.run_started);
        &self.run_builder.finished_index_block
    }

    /// Filter block of the most recently finished minirun.
    pub fn finished_run_filter_block(&self) -> &[u8] {
        debug_assert!(!self.run_started);
        &self.run_builder.finished_filter_block
    }

    /// Data-block bytes of the most recently finished minirun.
    pub fn finished_run_data_size(&self) -> u64 {
        debug_assert!(!self.run_started);
        self.run_builder.data_size
    }

    /// Writes the footer, syncs, and publishes the segment under its
    /// canonical name. Publication is the point where readers may observe
    /// the segment.
    pub fn finish(mut self) -> Result<()> {
        let mut footer = Vec::with_capacity(self.run_handles.len() * 24 + 8);
        for handle in &self.run_handles {
            footer.extend_from_slice(&handle.run_start.to_be_bytes());
            footer.extend_from_slice(&handle.last_block_handle.offset.to_be_bytes());
            footer.extend_from_slice(&handle.last_block_handle.size.to_be_bytes());
        }
        let footer_len = footer.len() as u64;
        self.writer.write_all(&footer)?;
        self.writer.write_all(&footer_len.to_be_bytes())?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        drop(self.writer);
        self.manager.rename_segment(self.seg_id)
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Finished miniruns so far.
    pub fn num_runs(&self) -> usize {
        self.run_handles.len()
    }

    /// Bytes written to the file as of the last finished write.
    pub fn file_size(&self) -> u64 {
        if self.run_started {
            self.run_builder.file_size()
        } else {
            self.prev_file_size
        }
    }
}
