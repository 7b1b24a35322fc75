use super::{HeapError, HeapStats};
use core::ptr::{NonNull, null_mut};

/// Header in front of every block, free or in use.
///
/// ```text
/// +--------+--------+---------------------------+
/// |  size  |  link  |      payload (size)       |
/// +--------+--------+---------------------------+
/// ^ block           ^ block + HEADER (16-aligned)
/// ```
///
/// - `size` is the number of payload bytes **after** the header.
/// - `link` is the address of the next free block while the block is free,
///   and `USED_MAGIC ^ block` while it is handed out.
#[repr(C, align(16))]
struct Block {
    size: usize,
    link: usize,
}

/// Header at the start of every arena; keeps blocks of physically adjacent
/// arenas from coalescing.
#[repr(C, align(16))]
struct Arena {
    len: usize,
    next: *mut Arena,
}

pub(super) const HEADER: usize = size_of::<Block>();
pub(super) const ALIGN: usize = 16;
const ARENA_HEADER: usize = size_of::<Arena>();
const MIN_PAYLOAD: usize = 16;
const MIN_BLOCK: usize = HEADER + MIN_PAYLOAD;
const USED_MAGIC: usize = 0x6b68_615f_7573_6564;

const _: () = assert!(HEADER == ALIGN && ARENA_HEADER == ALIGN);

#[inline]
const fn align_up(addr: usize, align: usize) -> Option<usize> {
    match addr.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Payload size actually used for a request of `size` bytes.
#[inline]
const fn round(size: usize) -> Option<usize> {
    let size = if size < MIN_PAYLOAD { MIN_PAYLOAD } else { size };
    align_up(size, ALIGN)
}

/// First-fit, split-and-coalesce free list over a chain of arenas.
///
/// # Invariants
/// - Free blocks are non-overlapping, sorted by address and never adjacent
///   (adjacent ones are merged on insertion).
/// - Every block lies inside exactly one arena.
/// - `allocated` is the sum of the payload sizes of blocks in use.
pub(super) struct FreeList {
    head: *mut Block,
    arenas: *mut Arena,
    arena_bytes: usize,
    allocated: usize,
}

// Safety: only used behind the heap's SpinLock; the raw pointers are only
// dereferenced while it is held.
unsafe impl Send for FreeList {}

impl FreeList {
    pub(super) const fn new() -> Self {
        Self {
            head: null_mut(),
            arenas: null_mut(),
            arena_bytes: 0,
            allocated: 0,
        }
    }

    /// Hand `[start, start + len)` to the allocator as one free block.
    ///
    /// Returns `false` (and does nothing) if the region is misaligned or too
    /// small to hold a single block.
    ///
    /// # Safety
    /// The range must be valid, writable and exclusive to this list for as
    /// long as the list lives.
    pub(super) unsafe fn add_arena(&mut self, start: usize, len: usize) -> bool {
        if start % ALIGN != 0 || len % ALIGN != 0 || len < ARENA_HEADER + MIN_BLOCK {
            return false;
        }
        let arena = start as *mut Arena;
        let block = (start + ARENA_HEADER) as *mut Block;
        unsafe {
            arena.write(Arena {
                len,
                next: self.arenas,
            });
            block.write(Block {
                size: len - ARENA_HEADER - HEADER,
                link: 0,
            });
            self.insert_free(block);
        }
        self.arenas = arena;
        self.arena_bytes += len;
        true
    }

    /// Carve `size` bytes aligned to `align` (a power of two) out of the
    /// first block that fits.
    pub(super) fn alloc(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let size = round(size)?;
        let align = align.max(ALIGN);
        let mut prev: *mut Block = null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            let start = cur as usize;
            let end = start + HEADER + unsafe { (*cur).size };
            if let Some(payload) = fit(start, end, size, align) {
                let used = unsafe { self.carve(prev, cur, payload, size) };
                self.allocated += used;
                return NonNull::new(payload as *mut u8);
            }
            prev = cur;
            cur = unsafe { next(cur) };
        }
        None
    }

    /// Return a block to the list. Returns its payload size.
    ///
    /// # Safety
    /// `ptr` must not be used afterwards. Pointers that did not come from
    /// this list are detected as long as their header area is readable.
    pub(super) unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let block = unsafe { self.validate(ptr)? };
        let size = unsafe { (*block).size };
        unsafe { self.insert_free(block) };
        self.allocated -= size;
        Ok(size)
    }

    /// Payload bytes usable behind `ptr`.
    ///
    /// # Safety
    /// As for [`free`](Self::free).
    pub(super) unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let block = unsafe { self.validate(ptr)? };
        Ok(unsafe { (*block).size })
    }

    /// Resize the block at `ptr` without moving it: shrink it, or absorb the
    /// free block right behind it. Returns `false` if it cannot grow in
    /// place.
    ///
    /// # Safety
    /// As for [`free`](Self::free).
    pub(super) unsafe fn resize_in_place(&mut self, ptr: NonNull<u8>, new_size: usize) -> Result<bool, HeapError> {
        let block = unsafe { self.validate(ptr)? };
        let want = round(new_size).ok_or(HeapError::Overflow)?;
        let cur = unsafe { (*block).size };
        if want > cur {
            let end = block as usize + HEADER + cur;
            let (prev, succ) = self.find_free(end);
            if succ.is_null() || succ as usize != end {
                return Ok(false);
            }
            let merged = cur + HEADER + unsafe { (*succ).size };
            if merged < want {
                return Ok(false);
            }
            unsafe {
                self.set_next(prev, next(succ));
                (*block).size = merged;
            }
            self.allocated += merged - cur;
        }
        unsafe { self.shrink(block, want) };
        Ok(true)
    }

    pub(super) fn stats(&self) -> HeapStats {
        let mut free_bytes = 0;
        let mut largest_free = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            let size = unsafe { (*cur).size };
            free_bytes += size;
            largest_free = largest_free.max(size);
            cur = unsafe { next(cur) };
        }
        HeapStats {
            arena_bytes: self.arena_bytes,
            allocated_bytes: self.allocated,
            free_bytes,
            largest_free,
        }
    }

    /// `true` if `alloc(size, align)` would succeed without growing.
    pub(super) fn can_fit(&self, size: usize, align: usize) -> bool {
        let Some(size) = round(size) else {
            return false;
        };
        let align = align.max(ALIGN);
        let mut cur = self.head;
        while !cur.is_null() {
            let start = cur as usize;
            let end = start + HEADER + unsafe { (*cur).size };
            if fit(start, end, size, align).is_some() {
                return true;
            }
            cur = unsafe { next(cur) };
        }
        false
    }

    /// Split block `cur` (whose predecessor in the list is `prev`) around a
    /// payload at `payload`. Returns the payload size handed out.
    unsafe fn carve(&mut self, prev: *mut Block, cur: *mut Block, payload: usize, size: usize) -> usize {
        let start = cur as usize;
        let end = start + HEADER + unsafe { (*cur).size };
        let header = payload - HEADER;
        let tail_start = payload + size;
        let mut after = unsafe { next(cur) };
        let mut used = size;

        if end - tail_start >= MIN_BLOCK {
            let tail = tail_start as *mut Block;
            unsafe {
                tail.write(Block {
                    size: end - tail_start - HEADER,
                    link: after as usize,
                });
            }
            after = tail;
        } else {
            used = end - payload;
        }
        if header > start {
            unsafe {
                (*cur).size = header - start - HEADER;
                (*cur).link = after as usize;
            }
            after = cur;
        }
        unsafe {
            self.set_next(prev, after);
            (header as *mut Block).write(Block {
                size: used,
                link: USED_MAGIC ^ header,
            });
        }
        used
    }

    /// Cut the used `block` down to `want` payload bytes if the rest is big
    /// enough to form a block of its own.
    unsafe fn shrink(&mut self, block: *mut Block, want: usize) {
        let size = unsafe { (*block).size };
        let rest = size - want;
        if rest < MIN_BLOCK {
            return;
        }
        let tail = (block as usize + HEADER + want) as *mut Block;
        unsafe {
            (*block).size = want;
            tail.write(Block {
                size: rest - HEADER,
                link: 0,
            });
            self.insert_free(tail);
        }
        self.allocated -= rest;
    }

    /// Insert `block` in address order and merge it with adjacent free
    /// neighbours.
    unsafe fn insert_free(&mut self, block: *mut Block) {
        let addr = block as usize;
        let (prev, succ) = self.find_free(addr);
        unsafe {
            (*block).link = succ as usize;
            self.set_next(prev, block);

            if !succ.is_null() && addr + HEADER + (*block).size == succ as usize {
                (*block).size += HEADER + (*succ).size;
                (*block).link = (*succ).link;
            }
            if !prev.is_null() && prev as usize + HEADER + (*prev).size == addr {
                (*prev).size += HEADER + (*block).size;
                (*prev).link = (*block).link;
            }
        }
    }

    /// Last free block below `addr` and the first at or above it.
    fn find_free(&self, addr: usize) -> (*mut Block, *mut Block) {
        let mut prev: *mut Block = null_mut();
        let mut cur = self.head;
        while !cur.is_null() && (cur as usize) < addr {
            prev = cur;
            cur = unsafe { next(cur) };
        }
        (prev, cur)
    }

    unsafe fn set_next(&mut self, prev: *mut Block, block: *mut Block) {
        if prev.is_null() {
            self.head = block;
        } else {
            unsafe { (*prev).link = block as usize };
        }
    }

    /// Header of the in-use block whose payload starts at `ptr`.
    unsafe fn validate(&self, ptr: NonNull<u8>) -> Result<*mut Block, HeapError> {
        let p = ptr.as_ptr() as usize;
        let Some(arena_end) = self.arena_end(p) else {
            return Err(HeapError::NotHeapPointer);
        };
        if p % ALIGN != 0 {
            return Err(HeapError::NotHeapPointer);
        }
        let header = p - HEADER;
        let block = header as *mut Block;
        let (size, link) = unsafe { ((*block).size, (*block).link) };
        if link == USED_MAGIC ^ header && size <= arena_end - p {
            return Ok(block);
        }
        if self.inside_free(header) {
            Err(HeapError::DoubleFree)
        } else {
            Err(HeapError::CorruptHeader)
        }
    }

    /// End of the arena whose block area contains the payload address `p`.
    fn arena_end(&self, p: usize) -> Option<usize> {
        let mut arena = self.arenas;
        while !arena.is_null() {
            let start = arena as usize;
            let end = start + unsafe { (*arena).len };
            if p >= start + ARENA_HEADER + HEADER && p < end {
                return Some(end);
            }
            arena = unsafe { (*arena).next };
        }
        None
    }

    /// `true` if `addr` lies within some free block, header included.
    fn inside_free(&self, addr: usize) -> bool {
        let mut cur = self.head;
        while !cur.is_null() && (cur as usize) <= addr {
            if addr < cur as usize + HEADER + unsafe { (*cur).size } {
                return true;
            }
            cur = unsafe { next(cur) };
        }
        false
    }
}

#[inline]
unsafe fn next(block: *mut Block) -> *mut Block {
    unsafe { (*block).link as *mut Block }
}

/// Payload address for `size` bytes at `align` inside the free block
/// `[start, end)`, leaving a head remainder that is either empty or a valid
/// block.
fn fit(start: usize, end: usize, size: usize, align: usize) -> Option<usize> {
    let mut payload = align_up(start + HEADER, align)?;
    loop {
        let head = payload - HEADER - start;
        if head == 0 || head >= MIN_BLOCK {
            break;
        }
        payload = payload.checked_add(align)?;
    }
    (payload.checked_add(size)? <= end).then_some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(4096))]
    struct Arena4K([u8; 4096]);

    fn arena(pages: usize) -> (usize, usize) {
        let mut v = Vec::with_capacity(pages);
        v.resize_with(pages, || Arena4K([0; 4096]));
        let buf: &'static mut [Arena4K] = v.leak();
        (buf.as_mut_ptr() as usize, pages * 4096)
    }

    fn list(pages: usize) -> FreeList {
        let mut l = FreeList::new();
        let (start, len) = arena(pages);
        assert!(unsafe { l.add_arena(start, len) });
        l
    }

    #[test]
    fn split_and_coalesce_restore_one_block() {
        let mut l = list(1);
        let total = l.stats().free_bytes;
        assert_eq!(total, 4096 - ARENA_HEADER - HEADER);

        let a = l.alloc(24, 8).unwrap();
        let b = l.alloc(100, 8).unwrap();
        let c = l.alloc(1, 8).unwrap();
        assert_eq!(a.as_ptr() as usize % ALIGN, 0);
        assert_eq!(unsafe { l.usable_size(a) }, Ok(32));
        assert_eq!(unsafe { l.usable_size(c) }, Ok(MIN_PAYLOAD));
        assert_eq!(l.stats().allocated_bytes, 32 + 112 + 16);

        // free out of order; the middle one must merge both ways
        unsafe {
            l.free(a).unwrap();
            l.free(c).unwrap();
            l.free(b).unwrap();
        }
        let s = l.stats();
        assert_eq!(s.allocated_bytes, 0);
        assert_eq!(s.free_bytes, total);
        assert_eq!(s.largest_free, total);
    }

    #[test]
    fn aligned_allocation_keeps_head_remainder() {
        let mut l = list(4);
        let small = l.alloc(16, 16).unwrap();
        let page = l.alloc(64, 4096).unwrap();
        assert_eq!(page.as_ptr() as usize % 4096, 0);
        unsafe {
            l.free(page).unwrap();
            l.free(small).unwrap();
        }
        assert_eq!(l.stats().largest_free, 4 * 4096 - ARENA_HEADER - HEADER);
    }

    #[test]
    fn detects_double_and_foreign_frees() {
        let mut l = list(1);
        let a = l.alloc(64, 16).unwrap();
        let b = l.alloc(64, 16).unwrap();
        unsafe {
            l.free(a).unwrap();
            assert_eq!(l.free(a), Err(HeapError::DoubleFree));
            let inside = NonNull::new(b.as_ptr().add(32)).unwrap();
            assert_eq!(l.free(inside), Err(HeapError::CorruptHeader));
            let mut local = [0u8; 64];
            let foreign = NonNull::new(local.as_mut_ptr()).unwrap();
            assert_eq!(l.free(foreign), Err(HeapError::NotHeapPointer));
            l.free(b).unwrap();
        }
    }

    #[test]
    fn resize_in_place_absorbs_successor() {
        let mut l = list(1);
        let a = l.alloc(32, 16).unwrap();
        let b = l.alloc(32, 16).unwrap();
        unsafe {
            l.free(b).unwrap();
            assert_eq!(l.resize_in_place(a, 1024), Ok(true));
            assert_eq!(l.usable_size(a), Ok(1024));
            assert_eq!(l.resize_in_place(a, 64), Ok(true));
            assert_eq!(l.usable_size(a), Ok(64));
            assert_eq!(l.resize_in_place(a, 8192), Ok(false));
            l.free(a).unwrap();
        }
        assert_eq!(l.stats().allocated_bytes, 0);
    }

    #[test]
    fn exhausted_list_reports_none() {
        let mut l = list(1);
        assert!(l.alloc(4096, 16).is_none());
        assert!(!l.can_fit(4096, 16));
        assert!(l.can_fit(4096 - ARENA_HEADER - HEADER, 16));
    }
}
