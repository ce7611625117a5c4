//! Leaf index entries and their algebra.
//!
//! A leaf index entry (LIE) is the value stored in the leaf index under a
//! leaf's maximum user key. It is a raw concatenation of length-prefixed
//! minirun index entries (MREs), oldest first, newest last:
//!
//! ```text
//! [u32 entry_len][MRE bytes]  (repeated)
//! ```
//!
//! Each MRE names one minirun and embeds its index and filter blocks so
//! reads never touch the segment file for metadata:
//!
//! ```text
//! [u32 segment_id][u32 run_no]
//! [u32 index_block_len][index block]
//! [u32 filter_block_len][filter block]
//! [u32 run_data_size]
//! ```
//!
//! The algebra (`append`, `remove range`, `replace range`) always produces
//! a new value blob; removed entries appended back reconstruct the
//! original bytes exactly.

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiniRunIndexEntry {
    segment_id: u32,
    run_no: u32,
    index_block: Vec<u8>,
    filter_block: Vec<u8>,
    run_data_size: u32,
}

impl MiniRunIndexEntry {
    pub fn build(
        segment_id: u32,
        run_no: u32,
        index_block: &[u8],
        filter_block: &[u8],
        run_data_size: u32,
    ) -> Self {
        Self {
            segment_id,
            run_no,
            index_block: index_block.to_vec(),
            filter_block: filter_block.to_vec(),
            run_data_size,
        }
    }

    pub fn segment_id(&self) -> u32 {
        self.segment_id
    }

    pub fn run_no(&self) -> u32 {
        self.run_no
    }

    pub fn index_block(&self) -> &[u8] {
        &self.index_block
    }

    pub fn filter_block(&self) -> &[u8] {
        &self.filter_block
    }

    pub fn run_data_size(&self) -> u32 {
        self.run_data_size
    }

    fn encoded_len(&self) -> usize {
        4 + 4 + 4 + self.index_block.len() + 4 + self.filter_block.len() + 4
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut scratch = [0u8; 4];
        BigEndian::write_u32(&mut scratch, self.segment_id);
        out.extend_from_slice(&scratch);
        BigEndian::write_u32(&mut scratch, self.run_no);
        out.extend_from_slice(&scratch);
        BigEndian::write_u32(&mut scratch, self.index_block.len() as u32);
        out.extend_from_slice(&scratch);
        out.extend_from_slice(&self.index_block);
        BigEndian::write_u32(&mut scratch, self.filter_block.len() as u32);
        out.extend_from_slice(&scratch);
        out.extend_from_slice(&self.filter_block);
        BigEndian::write_u32(&mut scratch, self.run_data_size);
        out.extend_from_slice(&scratch);
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let read_u32 = |at: usize| -> Result<u32> {
            if at + 4 > payload.len() {
                return errcorruption!("minirun index entry truncated");
            }
            Ok(BigEndian::read_u32(&payload[at..at + 4]))
        };
        let segment_id = read_u32(0)?;
        let run_no = read_u32(4)?;
        let index_len = read_u32(8)? as usize;
        let mut at = 12;
        if at + index_len > payload.len() {
            return errcorruption!("minirun index entry index block truncated");
        }
        let index_block = payload[at..at + index_len].to_vec();
        at += index_len;
        let filter_len = read_u32(at)? as usize;
        at += 4;
        if at + filter_len > payload.len() {
            return errcorruption!("minirun index entry filter block truncated");
        }
        let filter_block = payload[at..at + filter_len].to_vec();
        at += filter_len;
        let run_data_size = read_u32(at)?;
        at += 4;
        if at != payload.len() {
            return errcorruption!("minirun index entry has trailing bytes");
        }
        Ok(Self {
            segment_id,
            run_no,
            index_block,
            filter_block,
            run_data_size,
        })
    }
}

/// Traversal order for [`LeafIndexEntry::for_each_minirun_index_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalOrder {
    /// Oldest run to newest.
    Forward,
    /// Newest run to oldest, the lookup order.
    Reverse,
}

/// The serialized list of minirun descriptors that constitute one leaf.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafIndexEntry {
    raw: Vec<u8>,
}

impl LeafIndexEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps and validates a raw value blob read from the leaf index.
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self> {
        let entry = Self { raw };
        entry.entries()?;
        Ok(entry)
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn num_miniruns(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    /// Total data-block bytes across the leaf's miniruns.
    pub fn leaf_data_size(&self) -> u64 {
        self.entries()
            .map(|entries| entries.iter().map(|e| e.run_data_size as u64).sum())
            .unwrap_or(0)
    }

    /// Decodes every MRE, oldest first.
    pub fn entries(&self) -> Result<Vec<MiniRunIndexEntry>> {
        let mut entries = Vec::new();
        let mut at = 0;
        while at < self.raw.len() {
            if at + 4 > self.raw.len() {
                return errcorruption!("leaf index entry length prefix truncated");
            }
            let len = BigEndian::read_u32(&self.raw[at..at + 4]) as usize;
            at += 4;
            if at + len > self.raw.len() {
                return errcorruption!("leaf index entry payload truncated");
            }
            entries.push(MiniRunIndexEntry::decode(&self.raw[at..at + len])?);
            at += len;
        }
        Ok(entries)
    }

    /// Visits MREs as `(entry, run_index)`; the callback returns `true` to
    /// stop. Run indices are always the forward (oldest = 0) positions.
    pub fn for_each_minirun_index_entry(
        &self,
        order: TraversalOrder,
        mut f: impl FnMut(&MiniRunIndexEntry, u32) -> bool,
    ) -> Result<()> {
        let entries = self.entries()?;
        match order {
            TraversalOrder::Forward => {
                for (idx, entry) in entries.iter().enumerate() {
                    if f(entry, idx as u32) {
                        break;
                    }
                }
            }
            TraversalOrder::Reverse => {
                for (idx, entry) in entries.iter().enumerate().rev() {
                    if f(entry, idx as u32) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Pure operations producing new LIE blobs.
pub struct LeafIndexEntryBuilder;

impl LeafIndexEntryBuilder {
    /// Appends `mre` as the newest run.
    pub fn append_minirun_index_entry(
        base: &LeafIndexEntry,
        mre: &MiniRunIndexEntry,
    ) -> LeafIndexEntry {
        let mut raw = Vec::with_capacity(base.raw.len() + 4 + mre.encoded_len());
        raw.extend_from_slice(&base.raw);
        let mut scratch = [0u8; 4];
        BigEndian::write_u32(&mut scratch, mre.encoded_len() as u32);
        raw.extend_from_slice(&scratch);
        mre.encode_into(&mut raw);
        LeafIndexEntry { raw }
    }

    /// Drops the runs in the inclusive index range `[start, end]`.
    pub fn remove_minirun_range(
        base: &LeafIndexEntry,
        start: u32,
        end: u32,
    ) -> Result<LeafIndexEntry> {
        Self::splice(base, start, end, None)
    }

    /// Replaces the runs in `[start, end]` with the single `replacement`.
    pub fn replace_minirun_range(
        base: &LeafIndexEntry,
        start: u32,
        end: u32,
        replacement: &MiniRunIndexEntry,
    ) -> Result<LeafIndexEntry> {
        Self::splice(base, start, end, Some(replacement))
    }

    fn splice(
        base: &LeafIndexEntry,
        start: u32,
        end: u32,
        replacement: Option<&MiniRunIndexEntry>,
    ) -> Result<LeafIndexEntry> {
        let entries = base.entries()?;
        if start > end || end as usize >= entries.len() {
            return errinvalid!(
                "run range [{start}, {end}] out of bounds for {} runs",
                entries.len()
            );
        }
        let mut result = LeafIndexEntry::new();
        for (idx, entry) in entries.iter().enumerate() {
            let idx = idx as u32;
            if idx < start || idx > end {
                result = Self::append_minirun_index_entry(&result, entry);
            } else if idx == start {
                if let Some(replacement) = replacement {
                    result = Self::append_minirun_index_entry(&result, replacement);
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mre(seg: u32, run: u32) -> MiniRunIndexEntry {
        MiniRunIndexEntry::build(
            seg,
            run,
            format!("index-{seg}-{run}").as_bytes(),
            format!("filter-{seg}-{run}").as_bytes(),
            100 + run,
        )
    }

    fn lie_of(entries: &[MiniRunIndexEntry]) -> LeafIndexEntry {
        let mut lie = LeafIndexEntry::new();
        for entry in entries {
            lie = LeafIndexEntryBuilder::append_minirun_index_entry(&lie, entry);
        }
        lie
    }

    #[test]
    fn test_append_and_decode() {
        let lie = lie_of(&[mre(1, 0), mre(1, 1), mre(2, 0)]);
        assert_eq!(lie.num_miniruns(), 3);
        assert_eq!(lie.leaf_data_size(), 100 + 101 + 100);

        let entries = lie.entries().unwrap();
        assert_eq!(entries[0], mre(1, 0));
        assert_eq!(entries[2], mre(2, 0));

        let roundtrip = LeafIndexEntry::from_bytes(lie.raw().to_vec()).unwrap();
        assert_eq!(roundtrip.entries().unwrap(), entries);
    }

    #[test]
    fn test_traversal_orders() {
        let lie = lie_of(&[mre(1, 0), mre(1, 1), mre(1, 2)]);

        let mut forward = Vec::new();
        lie.for_each_minirun_index_entry(TraversalOrder::Forward, |e, idx| {
            forward.push((e.run_no(), idx));
            false
        })
        .unwrap();
        assert_eq!(forward, vec![(0, 0), (1, 1), (2, 2)]);

        let mut reverse = Vec::new();
        lie.for_each_minirun_index_entry(TraversalOrder::Reverse, |e, idx| {
            reverse.push((e.run_no(), idx));
            false
        })
        .unwrap();
        assert_eq!(reverse, vec![(2, 2), (1, 1), (0, 0)]);

        // Early stop.
        let mut count = 0;
        lie.for_each_minirun_index_entry(TraversalOrder::Forward, |_, _| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_remove_range_length_law() {
        let entries = [mre(1, 0), mre(1, 1), mre(1, 2), mre(1, 3)];
        let lie = lie_of(&entries);
        for start in 0..entries.len() as u32 {
            for end in start..entries.len() as u32 {
                let removed =
                    LeafIndexEntryBuilder::remove_minirun_range(&lie, start, end).unwrap();
                assert_eq!(
                    removed.num_miniruns(),
                    entries.len() - (end - start + 1) as usize
                );
            }
        }
    }

    #[test]
    fn test_remove_then_reappend_reconstructs_bytes() {
        let entries = [mre(1, 0), mre(1, 1), mre(1, 2)];
        let lie = lie_of(&entries);
        // Removing the newest runs and appending them back is byte-identical.
        let mut rebuilt = LeafIndexEntryBuilder::remove_minirun_range(&lie, 1, 2).unwrap();
        rebuilt = LeafIndexEntryBuilder::append_minirun_index_entry(&rebuilt, &entries[1]);
        rebuilt = LeafIndexEntryBuilder::append_minirun_index_entry(&rebuilt, &entries[2]);
        assert_eq!(rebuilt.raw(), lie.raw());
    }

    #[test]
    fn test_replace_range() {
        let lie = lie_of(&[mre(1, 0), mre(1, 1), mre(1, 2)]);
        let replacement = mre(9, 0);
        let replaced =
            LeafIndexEntryBuilder::replace_minirun_range(&lie, 0, 1, &replacement).unwrap();
        let entries = replaced.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], replacement);
        assert_eq!(entries[1], mre(1, 2));
    }

    #[test]
    fn test_bad_ranges_are_invalid_argument() {
        let lie = lie_of(&[mre(1, 0), mre(1, 1)]);
        assert!(LeafIndexEntryBuilder::remove_minirun_range(&lie, 1, 0).is_err());
        assert!(LeafIndexEntryBuilder::remove_minirun_range(&lie, 0, 2).is_err());
        assert!(
            LeafIndexEntryBuilder::replace_minirun_range(&lie, 2, 2, &mre(9, 9)).is_err()
        );
    }

    #[test]
    fn test_corrupt_raw_detected() {
        let lie = lie_of(&[mre(1, 0)]);
        let mut raw = lie.raw().to_vec();
        raw.truncate(raw.len() - 1);
        assert!(LeafIndexEntry::from_bytes(raw).is_err());
    }
}
