//! Persistent-memory arena management.
//!
//! A [`PmArena`] maps one fixed-size backing file and carves it into
//! [`SubArena`]s, append-only byte buffers that each back one memtable (or
//! the leaf index). Every sub-arena starts with a 16-byte header:
//!
//! ```text
//! [u64 live_count][u64 write_cursor]
//! ```
//!
//! The cursor counts from the start of the sub-arena, so a fresh sub-arena
//! has `cursor = 16`. Appends write the payload first and advance the
//! cursor afterwards; the live count is advanced only once the entry it
//! covers is fully written. A header reporting N entries therefore
//! guarantees N complete entries between the header and the persisted
//! cursor, which is what recovery replays.
//!
//! Addresses handed out by [`SubArena::insert`] are offsets into the
//! backing file and stay valid across remapping after a restart.
//!
//! All unsafe code of the crate lives here. Sub-arenas own disjoint
//! extents, appends to one sub-arena are serialized by its append lock, and
//! readers only dereference bytes at or below the committed cursor.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// Size of the per-sub-arena header.
pub const SUB_ARENA_HEADER: u64 = 16;

#[derive(Debug)]
struct ArenaInner {
    /// Keeps the mapping alive and provides flushing; all access goes
    /// through `ptr` so appends never alias a whole-map borrow.
    map: MmapMut,
    ptr: *mut u8,
    len: u64,
    state: Mutex<ArenaState>,
}

// Sub-arenas own disjoint extents and serialize their own appends; see the
// module docs for the aliasing rules.
unsafe impl Send for ArenaInner {}
unsafe impl Sync for ArenaInner {}

#[derive(Debug, Default)]
struct ArenaState {
    /// Free extents as (base, len), sorted by base, coalesced.
    free: Vec<(u64, u64)>,
    /// Live extents in allocation order; this order is what the geometry
    /// record preserves (immutables first, active last).
    live: Vec<(u64, u64)>,
}

/// Owner of one PM backing file.
#[derive(Clone)]
pub struct PmArena {
    inner: Arc<ArenaInner>,
}

impl PmArena {
    /// Maps (creating and sizing if necessary) the backing file.
    pub fn open(path: &Path, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < size {
            file.set_len(size)?;
        }
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let ptr = map.as_mut_ptr();
        Ok(Self {
            inner: Arc::new(ArenaInner {
                map,
                ptr,
                len: size,
                state: Mutex::new(ArenaState {
                    free: vec![(0, size)],
                    live: Vec::new(),
                }),
            }),
        })
    }

    /// Carves a fresh sub-arena of `size` bytes (header included) and
    /// initializes its header. First-fit over the free list.
    pub fn allocate(&self, size: u64) -> Result<SubArena> {
        let size = size.max(SUB_ARENA_HEADER + 1);
        let base = {
            let mut state = self.inner.state.lock()?;
            let slot = state
                .free
                .iter()
                .position(|&(_, flen)| flen >= size)
                .ok_or(Error::OutOfMemory)?;
            let (fbase, flen) = state.free[slot];
            if flen == size {
                state.free.remove(slot);
            } else {
                state.free[slot] = (fbase + size, flen - size);
            }
            state.live.push((fbase, size));
            fbase
        };
        let sub = SubArena::new(self.inner.clone(), base, size);
        sub.write_header(0, SUB_ARENA_HEADER);
        Ok(sub)
    }

    /// Rebuilds a sub-arena handle over an extent previously registered by
    /// [`PmArena::recover`]. The header is left untouched so the owning
    /// memtable can replay it.
    pub fn reallocate(&self, base: u64, size: u64) -> Result<SubArena> {
        let state = self.inner.state.lock()?;
        if !state.live.contains(&(base, size)) {
            return errinvalid!("reallocate of unregistered extent ({base}, {size})");
        }
        drop(state);
        Ok(SubArena::new(self.inner.clone(), base, size))
    }

    /// Re-marks the given extents as allocated, in order. Everything else
    /// becomes free space. Used once during recovery before any
    /// `reallocate` call.
    pub fn recover(&self, extents: &[(u64, u64)]) -> Result<()> {
        let mut state = self.inner.state.lock()?;
        for &(base, len) in extents {
            if base.checked_add(len).map_or(true, |end| end > self.inner.len) {
                return errcorruption!("recovered extent ({base}, {len}) exceeds arena");
            }
        }
        let mut sorted = extents.to_vec();
        sorted.sort_unstable();
        for pair in sorted.windows(2) {
            if pair[0].0 + pair[0].1 > pair[1].0 {
                return errcorruption!("recovered extents overlap");
            }
        }
        state.live = extents.to_vec();
        state.free.clear();
        let mut at = 0;
        for &(base, len) in &sorted {
            if base > at {
                state.free.push((at, base - at));
            }
            at = base + len;
        }
        if at < self.inner.len {
            state.free.push((at, self.inner.len - at));
        }
        Ok(())
    }

    /// Live extents as (base, len) in allocation order, the payload of one
    /// geometry log record.
    pub fn geometry(&self) -> Vec<(u64, u64)> {
        self.inner.state.lock().map(|s| s.live.clone()).unwrap_or_default()
    }
}

/// One append-only carve-out of a [`PmArena`]. Dropping the sub-arena
/// returns its extent to the arena's free list.
#[derive(Debug)]
pub struct SubArena {
    inner: Arc<ArenaInner>,
    base: u64,
    len: u64,
    append_lock: Mutex<()>,
}

impl SubArena {
    fn new(inner: Arc<ArenaInner>, base: u64, len: u64) -> Self {
        Self {
            inner,
            base,
            len,
            append_lock: Mutex::new(()),
        }
    }

    /// File offset of this sub-arena's header.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Total extent length, header included.
    pub fn capacity(&self) -> u64 {
        self.len
    }

    /// Copies `data` into the arena at the write cursor and returns its
    /// stable address. The cursor is advanced after the payload is in
    /// place; the live count is untouched (callers advance it once the
    /// entry is indexed).
    pub fn insert(&self, data: &[u8]) -> Result<u64> {
        let _guard = self.append_lock.lock()?;
        let cursor = self.read_u64(8);
        let end = cursor
            .checked_add(data.len() as u64)
            .ok_or(Error::OutOfMemory)?;
        if end > self.len {
            return Err(Error::OutOfMemory);
        }
        let address = self.base + cursor;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.inner.ptr.add(address as usize),
                data.len(),
            );
        }
        self.write_u64(8, end);
        Ok(address)
    }

    /// Persists `n` as the header's live-entry count.
    pub fn update_counter(&self, n: u64) {
        self.write_u64(0, n);
    }

    pub fn counter(&self) -> u64 {
        self.read_u64(0)
    }

    /// Persists the write cursor, used by recovery after a truncated
    /// replay.
    pub fn update_cursor(&self, cursor: u64) {
        self.write_u64(8, cursor.clamp(SUB_ARENA_HEADER, self.len));
    }

    pub fn cursor(&self) -> u64 {
        self.read_u64(8)
    }

    /// Committed bytes from `address` (a value previously returned by
    /// [`SubArena::insert`], or `base + 16` for replay) up to the cursor.
    pub fn committed_from(&self, address: u64) -> Result<&[u8]> {
        let end = self.base + self.cursor();
        if address < self.base + SUB_ARENA_HEADER || address > end {
            return errcorruption!("pm address {address} outside sub-arena");
        }
        // Bytes below the cursor are never rewritten, so this slice is
        // stable for the life of the mapping.
        unsafe {
            Ok(std::slice::from_raw_parts(
                self.inner.ptr.add(address as usize),
                (end - address) as usize,
            ))
        }
    }

    /// Flushes the sub-arena's extent to the backing file.
    pub fn persist(&self) -> Result<()> {
        self.inner
            .map
            .flush_range(self.base as usize, self.len as usize)?;
        Ok(())
    }

    fn read_u64(&self, off: u64) -> u64 {
        let mut buf = [0u8; 8];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.inner.ptr.add((self.base + off) as usize),
                buf.as_mut_ptr(),
                8,
            );
        }
        u64::from_le_bytes(buf)
    }

    fn write_u64(&self, off: u64, v: u64) {
        let bytes = v.to_le_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.inner.ptr.add((self.base + off) as usize),
                8,
            );
        }
    }

    fn write_header(&self, counter: u64, cursor: u64) {
        self.write_u64(0, counter);
        self.write_u64(8, cursor);
    }
}

impl Drop for SubArena {
    fn drop(&mut self) {
        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        if let Some(idx) = state
            .live
            .iter()
            .position(|&(b, l)| b == self.base && l == self.len)
        {
            state.live.remove(idx);
        }
        // Re-insert into the free list sorted by base, coalescing with
        // either neighbor.
        let pos = state
            .free
            .iter()
            .position(|&(b, _)| b > self.base)
            .unwrap_or(state.free.len());
        state.free.insert(pos, (self.base, self.len));
        let mut i = pos;
        if i > 0 && state.free[i - 1].0 + state.free[i - 1].1 == state.free[i].0 {
            state.free[i - 1].1 += state.free[i].1;
            state.free.remove(i);
            i -= 1;
        }
        if i + 1 < state.free.len() && state.free[i].0 + state.free[i].1 == state.free[i + 1].0 {
            state.free[i].1 += state.free[i + 1].1;
            state.free.remove(i + 1);
        }
    }
}
