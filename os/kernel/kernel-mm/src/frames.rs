//! # Physical Frame Allocator
//!
//! Owns every physical 4 KiB frame below the end of the highest usable
//! memory region.
//!
//! ## Frame table
//!
//! One [`FrameRecord`] per frame, indexed by frame number. The table itself
//! is carved out of usable RAM at [`init`](FrameAllocator::init) and accessed
//! through the [`PhysMapper`]; its frames are reserved like the kernel image.
//!
//! ```text
//! record = | state:u8 | pad | refcount:u32 | prev:u32 | next:u32 |   (16 bytes)
//! ```
//!
//! ## Free list
//!
//! Free frames are linked by index (`prev`/`next`, [`NIL`] terminated) in
//! ascending address order. Allocation is first-fit: the list is walked until
//! `count` consecutive frame numbers appear in a row, which for an
//! address-ordered list means they are also adjacent list nodes.
//!
//! A two-level bitmap of free frames sits right behind the records. Freeing a
//! frame finds its list predecessor there: one bit per frame, plus one
//! summary bit per non-empty bitmap word, so the search touches at most one
//! summary word per 4096 frames.
//!
//! ## Reference counts
//!
//! Refcounts are atomics and never go below zero. The transition to zero is a
//! compare-exchange, so exactly one caller gets to put the frame back on the
//! list. The list itself sits behind a [`SpinLock`] taken with interrupts
//! masked.

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use kernel_info::boot::BootMemoryInfo;
use kernel_memory_addresses::{
    FrameRange, PAGE_SIZE, PhysicalFrame, PhysicalRange, pages_for,
};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, error, info, trace, warn};

/// End-of-list marker.
pub const NIL: u32 = u32::MAX;

const FREE: u8 = 0;
const RESERVED: u8 = 1;
const IN_USE: u8 = 2;

/// Allocation state of a frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameState {
    /// On the free list, refcount 0.
    Free,
    /// Never allocatable.
    Reserved,
    /// Handed out, refcount at least 1.
    InUse,
}

/// Per-frame bookkeeping.
#[repr(C)]
pub struct FrameRecord {
    state: AtomicU8,
    refcount: AtomicU32,
    prev: AtomicU32,
    next: AtomicU32,
}

const _: () = assert!(size_of::<FrameRecord>() == 16);

impl FrameRecord {
    const fn new(state: u8) -> Self {
        Self {
            state: AtomicU8::new(state),
            refcount: AtomicU32::new(0),
            prev: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("the memory map contains no usable memory")]
    NoUsableMemory,
    #[error("no usable run of {pages} pages can hold the frame table")]
    TableDoesNotFit { pages: u64 },
    #[error("{0} frames exceed the frame table")]
    CountOutOfBounds(usize),
    #[error("no run of {0} contiguous free frames")]
    Exhausted(usize),
    #[error("{0:?} is not allocated")]
    NotAllocated(PhysicalFrame),
    #[error("{0:?} lies outside the frame table")]
    OutOfTable(PhysicalFrame),
}

/// Frame counters; see [`FrameAllocator::stats`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FrameStats {
    /// Frames covered by the table.
    pub total: usize,
    /// Frames that are not reserved.
    pub usable: usize,
    /// Reserved frames, including the frame table.
    pub reserved: usize,
    /// Frames on the free list.
    pub free: usize,
    /// Frames with a non-zero refcount.
    pub in_use: usize,
}

struct FreeList {
    head: u32,
    tail: u32,
    len: usize,
    map: FreeMap,
}

/// Free frames as bits; only touched under the free-list lock.
struct FreeMap {
    words: &'static mut [u64],
    summary: &'static mut [u64],
}

impl FreeMap {
    /// Words needed for `frames` frames: `(bitmap, summary)`.
    const fn words_for(frames: u64) -> (usize, usize) {
        let words = frames.div_ceil(64);
        (words as usize, words.div_ceil(64) as usize)
    }

    fn set(&mut self, n: u32) {
        let w = n as usize / 64;
        self.words[w] |= 1 << (n % 64);
        self.summary[w / 64] |= 1 << (w % 64);
    }

    fn clear(&mut self, n: u32) {
        let w = n as usize / 64;
        self.words[w] &= !(1 << (n % 64));
        if self.words[w] == 0 {
            self.summary[w / 64] &= !(1 << (w % 64));
        }
    }

    /// Highest free frame below `n`.
    fn prev(&self, n: u32) -> Option<u32> {
        let w = n as usize / 64;
        let below = self.words[w] & low_bits(n % 64);
        if below != 0 {
            return Some(top_bit(w, below) as u32);
        }
        let s = w / 64;
        let word = core::iter::once(self.summary[s] & low_bits((w % 64) as u32))
            .chain(self.summary[..s].iter().rev().copied())
            .zip((0..=s).rev())
            .find(|&(bits, _)| bits != 0)
            .map(|(bits, s)| top_bit(s, bits))?;
        Some(top_bit(word, self.words[word]) as u32)
    }
}

/// Bits `0..n` set.
const fn low_bits(n: u32) -> u64 {
    (1u64 << n) - 1
}

/// Index of the highest set bit of `bits`, which is word `word` of a bitmap.
const fn top_bit(word: usize, bits: u64) -> usize {
    word * 64 + 63 - bits.leading_zeros() as usize
}

/// The physical frame allocator. See the [module docs](self).
pub struct FrameAllocator {
    table: &'static [FrameRecord],
    list: SpinLock<FreeList>,
    usable: usize,
    /// Frames holding the table itself.
    table_frames: FrameRange,
}

impl FrameAllocator {
    /// Build the frame table over the boot memory map.
    ///
    /// Frames overlapping the kernel image, any non-usable region, any
    /// `boot.reserved` range or the table's own storage are reserved; every
    /// other frame starts free with refcount 0.
    ///
    /// # Errors
    /// - [`FrameError::NoUsableMemory`] if the map has no usable region.
    /// - [`FrameError::TableDoesNotFit`] if no free run can hold the table.
    ///
    /// # Safety
    /// Every usable frame must be reachable through `mapper` for the rest of
    /// the kernel's lifetime and must not be used by anything else.
    pub unsafe fn init<M: PhysMapper>(
        boot: &BootMemoryInfo<'_>,
        mapper: &M,
    ) -> Result<Self, FrameError> {
        let end = boot.usable_end().ok_or(FrameError::NoUsableMemory)?;
        let total = end.as_u64() / PAGE_SIZE;
        if total == 0 || total >= u64::from(NIL) {
            return Err(FrameError::NoUsableMemory);
        }
        let (map_words, summary_words) = FreeMap::words_for(total);
        let table_bytes = total * size_of::<FrameRecord>() as u64
            + (map_words + summary_words) as u64 * size_of::<u64>() as u64;
        let table_pages = pages_for(table_bytes);
        let table_start = find_run(boot, total, table_pages)
            .ok_or(FrameError::TableDoesNotFit { pages: table_pages })?;
        let table_frames = FrameRange::new(PhysicalFrame::from_number(table_start), table_pages as usize);

        let len = total as usize;
        let ptr = mapper
            .phys_to_ptr(table_frames.start().base())
            .cast::<FrameRecord>();
        // SAFETY: the bitmap follows the records inside the same run; 16-byte
        // records keep it 8-byte aligned.
        let map = unsafe {
            let words = ptr.add(len).cast::<u64>();
            words.write_bytes(0, map_words + summary_words);
            FreeMap {
                words: core::slice::from_raw_parts_mut(words, map_words),
                summary: core::slice::from_raw_parts_mut(words.add(map_words), summary_words),
            }
        };
        let mut usable = 0;
        let mut list = FreeList {
            head: NIL,
            tail: NIL,
            len: 0,
            map,
        };
        for n in 0..total {
            let available = is_available(boot, n) && !table_frames.contains(PhysicalFrame::from_number(n));
            let record = FrameRecord::new(if available { FREE } else { RESERVED });
            if available {
                usable += 1;
                record.prev.store(list.tail, Ordering::Relaxed);
                if list.tail == NIL {
                    list.head = n as u32;
                } else {
                    // SAFETY: `tail < n` and was written in an earlier iteration.
                    unsafe { (*ptr.add(list.tail as usize)).next.store(n as u32, Ordering::Relaxed) };
                }
                list.tail = n as u32;
                list.len += 1;
                list.map.set(n as u32);
            }
            // SAFETY: the table run is usable, exclusively ours, and `n < len`.
            unsafe { ptr.add(n as usize).write(record) };
        }
        // SAFETY: all `len` records were initialized above; the storage is
        // reserved forever.
        let table = unsafe { core::slice::from_raw_parts(ptr, len) };

        info!(
            "frame table: {total} frames, {usable} usable, table at {:?} ({table_pages} pages)",
            table_frames.start()
        );
        Ok(Self {
            table,
            list: SpinLock::new(list),
            usable,
            table_frames,
        })
    }

    /// Allocate `count` physically contiguous frames, each with refcount 1.
    ///
    /// `count == 0` yields an empty range.
    ///
    /// # Errors
    /// - [`FrameError::CountOutOfBounds`] if `count` exceeds the table.
    /// - [`FrameError::Exhausted`] if no suitable run is free.
    pub fn try_alloc(&self, count: usize) -> Result<FrameRange, FrameError> {
        if count == 0 {
            return Ok(FrameRange::empty());
        }
        if count > self.table.len() {
            return Err(FrameError::CountOutOfBounds(count));
        }

        let mut list = self.list.lock_irq();
        let mut run_start = NIL;
        let mut run_len = 0usize;
        let mut cur = list.head;
        while cur != NIL {
            if run_len > 0 && cur == run_start + run_len as u32 {
                run_len += 1;
            } else {
                run_start = cur;
                run_len = 1;
            }
            if run_len == count {
                break;
            }
            cur = self.record(cur).next.load(Ordering::Relaxed);
        }
        if run_len < count {
            return Err(FrameError::Exhausted(count));
        }

        let last = run_start + (count as u32 - 1);
        let before = self.record(run_start).prev.load(Ordering::Relaxed);
        let after = self.record(last).next.load(Ordering::Relaxed);
        self.link(&mut list, before, after);
        list.len -= count;
        for n in run_start..=last {
            list.map.clear(n);
            let r = self.record(n);
            r.prev.store(NIL, Ordering::Relaxed);
            r.next.store(NIL, Ordering::Relaxed);
            r.refcount.store(1, Ordering::Relaxed);
            r.state.store(IN_USE, Ordering::Release);
        }
        drop(list);
        let range = FrameRange::new(PhysicalFrame::from_number(u64::from(run_start)), count);
        trace!("alloc {range:?}");
        Ok(range)
    }

    /// [`try_alloc`](Self::try_alloc), logging failures.
    pub fn alloc(&self, count: usize) -> Option<FrameRange> {
        match self.try_alloc(count) {
            Ok(range) => Some(range),
            Err(e) => {
                warn!("frame allocation failed: {e}");
                None
            }
        }
    }

    /// Drop one reference from every frame in `range`.
    ///
    /// Frames reaching zero are cleared and returned to the free list. The
    /// whole range is validated first; nothing changes if any frame is free,
    /// reserved or outside the table.
    ///
    /// # Errors
    /// [`FrameError::NotAllocated`] / [`FrameError::OutOfTable`]; these are
    /// programming errors and also trip a debug assertion.
    pub fn free(&self, range: FrameRange) -> Result<(), FrameError> {
        for frame in range.iter() {
            let check = self.check_in_use(frame);
            debug_assert!(check.is_ok(), "freeing {frame:?}: {check:?}");
            check?;
        }
        for frame in range.iter() {
            self.decref(frame)?;
        }
        Ok(())
    }

    /// Add a reference to an allocated frame.
    ///
    /// # Errors
    /// Fails if the frame is not currently allocated.
    pub fn incref(&self, frame: PhysicalFrame) -> Result<u32, FrameError> {
        let r = self.in_table(frame)?;
        let mut cur = r.refcount.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return Err(FrameError::NotAllocated(frame));
            }
            match r.refcount.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(cur + 1),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Drop a reference; the caller that drops the last one returns the frame
    /// to the free list. Returns the new count.
    ///
    /// # Errors
    /// Fails (without changing anything) if the count is already zero.
    pub fn decref(&self, frame: PhysicalFrame) -> Result<u32, FrameError> {
        let r = self.in_table(frame)?;
        let mut cur = r.refcount.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                error!("refcount underflow on {frame:?}");
                return Err(FrameError::NotAllocated(frame));
            }
            match r.refcount.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => cur = seen,
            }
        }
        if cur == 1 {
            self.enqueue(frame.number() as u32);
        }
        Ok(cur - 1)
    }

    /// Current reference count; 0 for free, reserved or unknown frames.
    #[must_use]
    pub fn refcount(&self, frame: PhysicalFrame) -> u32 {
        self.in_table(frame)
            .map_or(0, |r| r.refcount.load(Ordering::Acquire))
    }

    /// State of `frame`, `None` if outside the table.
    #[must_use]
    pub fn state(&self, frame: PhysicalFrame) -> Option<FrameState> {
        let r = self.in_table(frame).ok()?;
        Some(match r.state.load(Ordering::Acquire) {
            FREE => FrameState::Free,
            IN_USE => FrameState::InUse,
            _ => FrameState::Reserved,
        })
    }

    /// Number of frames on the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.list.lock_irq().len
    }

    /// Frames that were not reserved at init.
    #[must_use]
    pub const fn usable_count(&self) -> usize {
        self.usable
    }

    /// Frames covered by the table.
    #[must_use]
    pub const fn total_count(&self) -> usize {
        self.table.len()
    }

    /// Frames holding the frame table.
    #[must_use]
    pub const fn table_frames(&self) -> FrameRange {
        self.table_frames
    }

    /// Counters gathered by scanning the table under the free-list lock.
    #[must_use]
    pub fn stats(&self) -> FrameStats {
        let list = self.list.lock_irq();
        let in_use = self
            .table
            .iter()
            .filter(|r| r.refcount.load(Ordering::Relaxed) > 0)
            .count();
        FrameStats {
            total: self.table.len(),
            usable: self.usable,
            reserved: self.table.len() - self.usable,
            free: list.len,
            in_use,
        }
    }

    fn enqueue(&self, n: u32) {
        let mut list = self.list.lock_irq();
        let r = self.record(n);
        r.state.store(FREE, Ordering::Release);

        let before = if list.tail == NIL || list.tail < n {
            list.tail
        } else {
            list.map.prev(n).unwrap_or(NIL)
        };
        let after = if before == NIL {
            list.head
        } else {
            self.record(before).next.load(Ordering::Relaxed)
        };
        r.prev.store(before, Ordering::Relaxed);
        r.next.store(after, Ordering::Relaxed);
        self.link(&mut list, before, n);
        self.link(&mut list, n, after);
        list.map.set(n);
        list.len += 1;
        trace!("free frame {n:#x}");
    }

    /// Make `b` follow `a` (either may be [`NIL`]).
    fn link(&self, list: &mut FreeList, a: u32, b: u32) {
        if a == NIL {
            list.head = b;
        } else {
            self.record(a).next.store(b, Ordering::Relaxed);
        }
        if b == NIL {
            list.tail = a;
        } else {
            self.record(b).prev.store(a, Ordering::Relaxed);
        }
    }

    fn check_in_use(&self, frame: PhysicalFrame) -> Result<(), FrameError> {
        let r = self.in_table(frame)?;
        if r.state.load(Ordering::Acquire) == IN_USE && r.refcount.load(Ordering::Acquire) > 0 {
            Ok(())
        } else {
            Err(FrameError::NotAllocated(frame))
        }
    }

    fn in_table(&self, frame: PhysicalFrame) -> Result<&FrameRecord, FrameError> {
        usize::try_from(frame.number())
            .ok()
            .and_then(|n| self.table.get(n))
            .ok_or(FrameError::OutOfTable(frame))
    }

    #[inline]
    fn record(&self, n: u32) -> &FrameRecord {
        &self.table[n as usize]
    }
}

impl FrameAlloc for FrameAllocator {
    fn alloc_4k(&self) -> Option<PhysicalFrame> {
        self.alloc(1).map(|r| r.start())
    }

    fn share_4k(&self, frame: PhysicalFrame) {
        if let Err(e) = self.incref(frame) {
            error!("cannot share {frame:?}: {e}");
            debug_assert!(false, "sharing unallocated {frame:?}");
        }
    }

    fn release_4k(&self, frame: PhysicalFrame) {
        if let Err(e) = self.decref(frame) {
            debug_assert!(false, "releasing {frame:?}: {e}");
        }
    }
}

impl core::fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("total", &self.table.len())
            .field("usable", &self.usable)
            .field("table_frames", &self.table_frames)
            .finish_non_exhaustive()
    }
}

/// A frame is available if a usable region contains it and nothing reserved
/// touches it.
fn is_available(boot: &BootMemoryInfo<'_>, n: u64) -> bool {
    let touches = |r: &PhysicalRange| r.outer_frames().contains(&n);
    let usable = boot
        .regions
        .iter()
        .any(|r| r.is_usable() && r.range().inner_frames().contains(&n));
    usable
        && !boot.regions.iter().any(|r| !r.is_usable() && touches(&r.range()))
        && !touches(&boot.kernel_image)
        && !boot.reserved.iter().any(touches)
}

/// First run of `pages` available frames below `total`.
fn find_run(boot: &BootMemoryInfo<'_>, total: u64, pages: u64) -> Option<u64> {
    let mut start = 0;
    let mut len = 0;
    for n in 0..total {
        if is_available(boot, n) {
            if len == 0 {
                start = n;
            }
            len += 1;
            if len == pages {
                debug!("frame table placed at frame {start:#x}");
                return Some(start);
            }
        } else {
            len = 0;
        }
    }
    None
}
