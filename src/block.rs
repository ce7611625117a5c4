//! Key/value blocks: the unit of storage inside miniruns.
//!
//! Entries are prefix-compressed against the previous key with restart
//! points every [`RESTART_INTERVAL`] entries:
//!
//! ```text
//! [u16 shared][u16 unshared][u32 vlen][key suffix][value]  (repeated)
//! [u32 restart offset] x N
//! [u32 restart count]
//! [u32 crc32 of everything above]
//! ```
//!
//! Blocks always hold internal keys; ordering and seeks use the
//! internal-key comparator.

use std::cmp::Ordering;
use std::io::Cursor;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::format::compare_internal_keys;
use crate::iterator::InternalIterator;

pub const RESTART_INTERVAL: usize = 16;

/// Target size of a data block; the entry that crosses it still fits.
pub const BLOCK_SIZE: usize = 4096;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Location of a block inside a segment file (file-absolute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[..8].copy_from_slice(&self.offset.to_be_bytes());
        buf[8..].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::ENCODED_LEN {
            return errcorruption!("block handle truncated");
        }
        Ok(Self {
            offset: u64::from_be_bytes(data[..8].try_into().unwrap()),
            size: u64::from_be_bytes(data[8..16].try_into().unwrap()),
        })
    }
}

pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restarts: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Keys must be added in internal-key order.
    pub fn add_entry(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restarts.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };
        let unshared = key.len() - shared;

        self.buffer
            .write_u16::<BigEndian>(shared as u16)
            .expect("vec write");
        self.buffer
            .write_u16::<BigEndian>(unshared as u16)
            .expect("vec write");
        self.buffer
            .write_u32::<BigEndian>(value.len() as u32)
            .expect("vec write");
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        for restart in &self.restarts {
            self.buffer
                .write_u32::<BigEndian>(*restart)
                .expect("vec write");
        }
        self.buffer
            .write_u32::<BigEndian>(self.restarts.len() as u32)
            .expect("vec write");
        let checksum = CRC32.checksum(&self.buffer);
        self.buffer
            .write_u32::<BigEndian>(checksum)
            .expect("vec write");
        self.buffer
    }

    /// Bytes accumulated so far, before the restart array and trailer.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A decoded, checksum-verified block.
#[derive(Clone)]
pub struct Block {
    data: Vec<u8>,
    restarts: Vec<u32>,
}

impl Block {
    pub fn decode(data: Vec<u8>) -> Result<Self> {
        if data.len() < 8 {
            return errcorruption!("block shorter than its trailer");
        }
        let crc_offset = data.len() - 4;
        let stored = Cursor::new(&data[crc_offset..]).read_u32::<BigEndian>()?;
        let actual = CRC32.checksum(&data[..crc_offset]);
        if stored != actual {
            return errcorruption!("block checksum mismatch: stored {stored:#x}, actual {actual:#x}");
        }

        let count_offset = crc_offset - 4;
        let num_restarts = Cursor::new(&data[count_offset..]).read_u32::<BigEndian>()? as usize;
        let restart_bytes = num_restarts * 4;
        if count_offset < restart_bytes {
            return errcorruption!("block restart array out of bounds");
        }
        let restart_offset = count_offset - restart_bytes;

        let mut cursor = Cursor::new(&data[restart_offset..count_offset]);
        let mut restarts = Vec::with_capacity(num_restarts);
        for _ in 0..num_restarts {
            restarts.push(cursor.read_u32::<BigEndian>()?);
        }

        Ok(Self {
            data: data[..restart_offset].to_vec(),
            restarts,
        })
    }

    pub fn iter(self: &Arc<Self>) -> BlockIterator {
        BlockIterator::new(Arc::clone(self))
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Key at a restart point, which never shares a prefix.
    fn restart_key(&self, restart_index: usize) -> Result<&[u8]> {
        let mut pos = self.restarts[restart_index] as usize;
        let shared = Cursor::new(&self.data[pos..]).read_u16::<BigEndian>()? as usize;
        if shared != 0 {
            return errcorruption!("restart point key has a shared prefix");
        }
        pos += 2;
        let unshared = Cursor::new(&self.data[pos..]).read_u16::<BigEndian>()? as usize;
        pos += 6;
        if pos + unshared > self.data.len() {
            return errcorruption!("restart key out of bounds");
        }
        Ok(&self.data[pos..pos + unshared])
    }
}

pub struct BlockIterator {
    block: Arc<Block>,
    /// Offset of the next undecoded entry.
    next_offset: usize,
    current: Option<(Vec<u8>, std::ops::Range<usize>)>,
    status: Result<()>,
}

impl BlockIterator {
    fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            next_offset: 0,
            current: None,
            status: Ok(()),
        }
    }

    fn reset_to(&mut self, offset: usize) {
        self.next_offset = offset;
        self.current = None;
    }

    /// Decodes the entry at `next_offset`, building its key from the
    /// previous entry's key.
    fn parse_next(&mut self) -> Result<bool> {
        if self.next_offset >= self.block.data.len() {
            self.current = None;
            return Ok(false);
        }
        let data = &self.block.data;
        let mut pos = self.next_offset;

        let shared = Cursor::new(&data[pos..]).read_u16::<BigEndian>()? as usize;
        pos += 2;
        let unshared = Cursor::new(&data[pos..]).read_u16::<BigEndian>()? as usize;
        pos += 2;
        let value_len = Cursor::new(&data[pos..]).read_u32::<BigEndian>()? as usize;
        pos += 4;

        let prev_key = self.current.as_ref().map(|(k, _)| k.as_slice()).unwrap_or(&[]);
        if shared > prev_key.len() || pos + unshared + value_len > data.len() {
            return errcorruption!("block entry out of bounds");
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&prev_key[..shared]);
        key.extend_from_slice(&data[pos..pos + unshared]);
        pos += unshared;

        let value = pos..pos + value_len;
        pos += value_len;

        self.current = Some((key, value));
        self.next_offset = pos;
        Ok(true)
    }

    fn step(&mut self) {
        match self.parse_next() {
            Ok(_) => {}
            Err(e) => {
                self.status = Err(e);
                self.current = None;
            }
        }
    }
}

impl InternalIterator for BlockIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        self.reset_to(0);
        self.step();
    }

    fn seek(&mut self, target: &[u8]) {
        // Binary search the restart array for the last restart whose key is
        // before the target, then scan forward.
        let mut left = 0usize;
        let mut right = self.block.restarts.len();
        while left < right {
            let mid = left + (right - left) / 2;
            match self.block.restart_key(mid) {
                Ok(key) => match compare_internal_keys(key, target) {
                    Ordering::Less => left = mid + 1,
                    _ => right = mid,
                },
                Err(e) => {
                    self.status = Err(e);
                    self.current = None;
                    return;
                }
            }
        }
        let restart = left.saturating_sub(1);
        let offset = self
            .block
            .restarts
            .get(restart)
            .copied()
            .unwrap_or(0) as usize;
        self.reset_to(offset);
        self.step();
        loop {
            let before_target = match &self.current {
                Some((key, _)) => compare_internal_keys(key, target) == Ordering::Less,
                None => return,
            };
            if !before_target {
                return;
            }
            self.step();
        }
    }

    fn next(&mut self) {
        if self.valid() {
            self.step();
        }
    }

    fn prev(&mut self) {
        self.status = Err(crate::error::Error::Unsupported(
            "block iterators are forward-only".to_string(),
        ));
        self.current = None;
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("key() on invalid iterator").0
    }

    fn value(&self) -> &[u8] {
        let (_, range) = self.current.as_ref().expect("value() on invalid iterator");
        &self.block.data[range.clone()]
    }

    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{append_internal_key, ValueType};

    fn ikey(user_key: &[u8], seq: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        append_internal_key(&mut buf, user_key, seq, ValueType::Value);
        buf
    }

    fn build_block(entries: &[(Vec<u8>, Vec<u8>)]) -> Arc<Block> {
        let mut builder = BlockBuilder::new();
        for (key, value) in entries {
            builder.add_entry(key, value);
        }
        Arc::new(Block::decode(builder.finish()).expect("decode block"))
    }

    fn sample_entries(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    ikey(format!("key_{i:04}").as_bytes(), 1),
                    format!("value_{i:04}").into_bytes(),
                )
            })
            .collect()
    }

    #[test]
    fn test_build_and_scan() {
        let entries = sample_entries(50);
        let block = build_block(&entries);
        let mut iter = block.iter();
        iter.seek_to_first();
        for (key, value) in &entries {
            assert!(iter.valid());
            assert_eq!(iter.key(), key.as_slice());
            assert_eq!(iter.value(), value.as_slice());
            iter.next();
        }
        assert!(!iter.valid());
        iter.status().unwrap();
    }

    #[test]
    fn test_seek_lands_on_first_at_or_after() {
        let entries = sample_entries(40);
        let block = build_block(&entries);
        let mut iter = block.iter();

        iter.seek(&ikey(b"key_0017", 1));
        assert!(iter.valid());
        assert_eq!(iter.key(), entries[17].0.as_slice());

        // A key between two entries lands on the later one.
        iter.seek(&ikey(b"key_0017x", 1));
        assert!(iter.valid());
        assert_eq!(iter.key(), entries[18].0.as_slice());

        // Past the end.
        iter.seek(&ikey(b"key_9999", 1));
        assert!(!iter.valid());
        iter.status().unwrap();
    }

    #[test]
    fn test_seek_newest_version_precedence() {
        let mut entries = vec![
            (ikey(b"k", 9), b"v9".to_vec()),
            (ikey(b"k", 5), b"v5".to_vec()),
            (ikey(b"k", 1), b"v1".to_vec()),
        ];
        entries.sort_by(|a, b| compare_internal_keys(&a.0, &b.0));
        let block = build_block(&entries);
        let mut iter = block.iter();

        // Seeking at sequence 6 skips the version at 9.
        iter.seek(&crate::format::seek_key(b"k", 6));
        assert!(iter.valid());
        assert_eq!(iter.value(), b"v5");
    }

    #[test]
    fn test_corrupt_checksum_detected() {
        let entries = sample_entries(4);
        let mut builder = BlockBuilder::new();
        for (key, value) in &entries {
            builder.add_entry(key, value);
        }
        let mut bytes = builder.finish();
        bytes[3] ^= 0x01;
        assert!(matches!(
            Block::decode(bytes),
            Err(crate::error::Error::Corruption(_))
        ));
    }

    #[test]
    fn test_restart_points_are_usable() {
        // Enough entries to force several restart points.
        let entries = sample_entries(100);
        let block = build_block(&entries);
        assert!(block.restarts.len() > 1);
        for probe in [0usize, 15, 16, 17, 63, 99] {
            let mut iter = block.iter();
            iter.seek(&entries[probe].0);
            assert!(iter.valid());
            assert_eq!(iter.key(), entries[probe].0.as_slice());
        }
    }
}
