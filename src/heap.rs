//! # Heap
//!
//! A linear, owner-tagged, first-fit free-list allocator over one fixed
//! region of RAM. Task stacks and everything tasks allocate come from here.
//!
//! ## Block layout
//!
//! The region is tiled by blocks with no gaps. Each block starts with a
//! two-word header:
//!
//! ```text
//! word 0   owner tag   0 = free, usize::MAX = reserved, else an Owner
//! word 1   data size   in words
//! word 2.. data        <- pointer handed to the caller
//! ```
//!
//! The next header is always `header + HEADER_WORDS + size`. Adjacent free
//! blocks may coexist for a while; they are joined whenever an allocation
//! walks over them and by [`Heap::defragment`].
//!
//! ## Free policies
//!
//! With task management the scheduler frees a dead task's stack from inside
//! the context switch, so `free` has to be O(1) and must not walk the list:
//! [`FreePolicy::Deferred`] only rewrites the tag and the first-free hint.
//! Single-task builds use [`FreePolicy::Eager`], which merges with the free
//! neighbours on the spot.

use core::marker::PhantomData;
use core::ops::Range;
use core::ptr::{self, NonNull};

use crate::config::{HEADER_WORDS, SPLIT_THRESHOLD_WORDS, WORD};
use crate::err::AllocError;
use crate::task::TaskId;

const TAG_FREE: usize = 0;
const TAG_RESERVED: usize = usize::MAX;
const TAG_KERNEL: usize = usize::MAX - 1;
const TAG_SINGLE: usize = usize::MAX - 2;

// ---------------------------------------------------------------------------
// Ownership
// ---------------------------------------------------------------------------

/// Who a heap block belongs to. Used to reclaim everything a task owned
/// when it exits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Owner {
    /// Kernel bookkeeping, task stacks included. Never bulk-reclaimed.
    Kernel,
    /// The single-task context (no task management, or before `start`).
    Single,
    Task(TaskId),
}

impl Owner {
    fn tag(self) -> usize {
        match self {
            Owner::Kernel => TAG_KERNEL,
            Owner::Single => TAG_SINGLE,
            Owner::Task(id) => id.to_tag(),
        }
    }

    fn from_tag(tag: usize) -> Option<Self> {
        match tag {
            TAG_FREE | TAG_RESERVED => None,
            TAG_KERNEL => Some(Owner::Kernel),
            TAG_SINGLE => Some(Owner::Single),
            t => TaskId::from_tag(t).map(Owner::Task),
        }
    }
}

/// What a block is currently used for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Reserved,
    Owned(Owner),
}

/// One block as seen by [`Heap::blocks`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Word offset of the header inside the region.
    pub offset: usize,
    /// Data size in bytes.
    pub size: usize,
    pub state: BlockState,
}

// ---------------------------------------------------------------------------
// Allocator interface
// ---------------------------------------------------------------------------

/// The allocation interface the scheduler depends on.
pub trait Allocator {
    /// Allocate at least `size` bytes, word aligned, tagged with `owner`.
    fn allocate(&mut self, size: usize, owner: Owner) -> Result<NonNull<u8>, AllocError>;

    /// Release a block. A null pointer is ignored. Must not block.
    fn free(&mut self, ptr: *mut u8) -> Result<(), AllocError>;

    /// Release every block tagged with `owner`. Returns how many blocks
    /// were released.
    fn reclaim_owner(&mut self, owner: Owner) -> usize;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FreePolicy {
    /// O(1) tag write; coalescing is left to later allocations.
    Deferred,
    /// Merge with free neighbours immediately.
    Eager,
}

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

pub struct Heap<'a> {
    base: NonNull<usize>,
    words: usize,
    /// Header offset of the first free block, or `words` if there is none.
    /// Every block before it is in use.
    first_free: usize,
    policy: FreePolicy,
    _region: PhantomData<&'a mut [usize]>,
}

impl<'a> Heap<'a> {
    /// Manage all of `region` as one free block.
    pub fn new(region: &'a mut [usize], policy: FreePolicy) -> Self {
        let mut heap = Self::bare(region, policy);
        if heap.words >= HEADER_WORDS {
            heap.write_header(0, TAG_FREE, heap.words - HEADER_WORDS);
            heap.first_free = 0;
        } else {
            heap.words = 0;
            heap.first_free = 0;
        }
        heap
    }

    /// Manage `region` except for the `reserved` word ranges, which are
    /// turned into permanently reserved blocks (memory-mapped holes and the
    /// like). Ranges must be sorted, disjoint, and each must leave room for
    /// its own header right before it.
    pub fn with_reserved(
        region: &'a mut [usize],
        policy: FreePolicy,
        reserved: &[Range<usize>],
    ) -> Result<Self, AllocError> {
        let mut heap = Self::bare(region, policy);
        let words = heap.words;
        let mut cursor = 0;

        for r in reserved {
            if r.start < cursor + HEADER_WORDS || r.end < r.start || r.end > words {
                return Err(AllocError::InvalidLayout);
            }
            let hdr = r.start - HEADER_WORDS;
            if hdr > cursor {
                if hdr - cursor < HEADER_WORDS {
                    return Err(AllocError::InvalidLayout);
                }
                heap.write_header(cursor, TAG_FREE, hdr - cursor - HEADER_WORDS);
            }
            heap.write_header(hdr, TAG_RESERVED, r.end - r.start);
            cursor = r.end;
        }

        if cursor < words {
            if words - cursor < HEADER_WORDS {
                return Err(AllocError::InvalidLayout);
            }
            heap.write_header(cursor, TAG_FREE, words - cursor - HEADER_WORDS);
        }

        heap.update_first_free(0);
        Ok(heap)
    }

    fn bare(region: &'a mut [usize], policy: FreePolicy) -> Self {
        let words = region.len();
        // SAFETY: a slice pointer is never null.
        let base = unsafe { NonNull::new_unchecked(region.as_mut_ptr()) };
        Self {
            base,
            words,
            first_free: words,
            policy,
            _region: PhantomData,
        }
    }

    /// Address of the first word of the region.
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Region size in bytes.
    pub fn capacity(&self) -> usize {
        self.words * WORD
    }

    // -----------------------------------------------------------------------
    // Raw header access
    // -----------------------------------------------------------------------

    #[inline]
    fn read(&self, i: usize) -> usize {
        debug_assert!(i < self.words);
        // SAFETY: `i` is inside the region we borrowed for 'a. Headers are
        // only ever touched through this type.
        unsafe { ptr::read(self.base.as_ptr().add(i)) }
    }

    #[inline]
    fn write(&mut self, i: usize, v: usize) {
        debug_assert!(i < self.words);
        // SAFETY: as for `read`.
        unsafe { ptr::write(self.base.as_ptr().add(i), v) }
    }

    fn write_header(&mut self, h: usize, tag: usize, size: usize) {
        self.write(h, tag);
        self.write(h + 1, size);
    }

    #[inline]
    fn tag(&self, h: usize) -> usize {
        self.read(h)
    }

    #[inline]
    fn size(&self, h: usize) -> usize {
        self.read(h + 1)
    }

    #[inline]
    fn next(&self, h: usize) -> usize {
        h + HEADER_WORDS + self.size(h)
    }

    fn data_ptr(&self, h: usize) -> NonNull<u8> {
        // SAFETY: h + HEADER_WORDS <= words; the result stays inside (or one
        // past) the region and is never null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(h + HEADER_WORDS) as *mut u8) }
    }

    // -----------------------------------------------------------------------
    // Free-list maintenance
    // -----------------------------------------------------------------------

    /// Join the free block at `h` with every free block directly after it.
    /// Returns the resulting data size in words.
    fn try_join(&mut self, h: usize) -> usize {
        let mut size = self.size(h);
        let mut next = h + HEADER_WORDS + size;
        while next < self.words && self.tag(next) == TAG_FREE {
            size += HEADER_WORDS + self.size(next);
            next = h + HEADER_WORDS + size;
        }
        self.write(h + 1, size);
        size
    }

    /// Point the hint at the first free block at or after `start`.
    fn update_first_free(&mut self, start: usize) {
        let mut h = start;
        while h < self.words && self.tag(h) != TAG_FREE {
            h = self.next(h);
        }
        self.first_free = h.min(self.words);
    }

    /// Header offset for a pointer previously returned by `allocate`.
    fn header_of(&self, ptr: *mut u8) -> Result<usize, AllocError> {
        let addr = ptr as usize;
        let base = self.base_addr();
        if addr % WORD != 0
            || addr < base + HEADER_WORDS * WORD
            || addr >= base + self.words * WORD
        {
            return Err(AllocError::InvalidPointer);
        }
        Ok((addr - base) / WORD - HEADER_WORDS)
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Allocate `size` bytes for `owner`. First fit, starting at the
    /// first-free hint.
    pub fn allocate(&mut self, size: usize, owner: Owner) -> Result<NonNull<u8>, AllocError> {
        let need = size.div_ceil(WORD).max(1);
        let mut h = self.first_free;

        while h < self.words {
            if self.tag(h) == TAG_FREE {
                if self.policy == FreePolicy::Deferred {
                    self.try_join(h);
                }
                let have = self.size(h);
                if have >= need {
                    self.write(h, owner.tag());

                    if have - need >= SPLIT_THRESHOLD_WORDS {
                        let rest = h + HEADER_WORDS + need;
                        self.write_header(rest, TAG_FREE, have - need - HEADER_WORDS);
                        self.try_join(rest);
                        self.write(h + 1, need);
                    }

                    if h == self.first_free {
                        let next = self.next(h);
                        self.update_first_free(next);
                    }
                    return Ok(self.data_ptr(h));
                }
            }
            h = self.next(h);
        }

        log::debug!("heap: no block for {} bytes", size);
        Err(AllocError::OutOfMemory { requested: size })
    }

    /// Allocate `count * size` zeroed bytes. Fails on overflow or if either
    /// factor is zero.
    pub fn allocate_zeroed(
        &mut self,
        count: usize,
        size: usize,
        owner: Owner,
    ) -> Result<NonNull<u8>, AllocError> {
        let total = match count.checked_mul(size) {
            Some(t) if t != 0 => t,
            _ => return Err(AllocError::OutOfMemory { requested: usize::MAX }),
        };
        let p = self.allocate(total, owner)?;
        // SAFETY: the block just allocated holds at least `total` bytes.
        unsafe { ptr::write_bytes(p.as_ptr(), 0, total) };
        Ok(p)
    }

    /// Release the block `ptr` points to. Null is ignored.
    pub fn free(&mut self, ptr: *mut u8) -> Result<(), AllocError> {
        if ptr.is_null() {
            return Ok(());
        }
        let h = match self.header_of(ptr) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("heap: free of foreign pointer {:p}", ptr);
                return Err(e);
            }
        };

        match self.tag(h) {
            TAG_FREE => {
                log::warn!("heap: double free at offset {}", h);
                return Err(AllocError::DoubleFree);
            }
            TAG_RESERVED => return Err(AllocError::InvalidPointer),
            _ => {}
        }
        if self.next(h) > self.words {
            return Err(AllocError::InvalidPointer);
        }

        match self.policy {
            FreePolicy::Deferred => {
                self.write(h, TAG_FREE);
                if h < self.first_free {
                    self.first_free = h;
                }
            }
            FreePolicy::Eager => {
                // Walk to the block before `h`; this also proves `h` is a
                // real block boundary.
                let mut p = 0;
                let mut prev_free = None;
                while p < h {
                    prev_free = if self.tag(p) == TAG_FREE { Some(p) } else { None };
                    p = self.next(p);
                }
                if p != h {
                    return Err(AllocError::InvalidPointer);
                }
                self.write(h, TAG_FREE);
                let start = prev_free.unwrap_or(h);
                self.try_join(start);
                if start < self.first_free {
                    self.first_free = start;
                }
            }
        }
        Ok(())
    }

    /// Free every block owned by `owner`, then coalesce. Returns the number
    /// of blocks released.
    pub fn reclaim_all(&mut self, owner: Owner) -> usize {
        let tag = owner.tag();
        let mut released = 0;
        let mut h = 0;
        while h < self.words {
            if self.tag(h) == tag {
                self.write(h, TAG_FREE);
                released += 1;
            }
            h = self.next(h);
        }
        self.defragment();
        released
    }

    /// Join every run of adjacent free blocks.
    pub fn defragment(&mut self) {
        let mut h = 0;
        while h < self.words {
            if self.tag(h) == TAG_FREE {
                self.try_join(h);
            }
            h = self.next(h);
        }
        self.update_first_free(0);
    }

    /// Bytes held by free blocks, headers included. A fresh heap reports
    /// its whole capacity.
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut h = self.first_free;
        while h < self.words {
            if self.tag(h) == TAG_FREE {
                total += (HEADER_WORDS + self.size(h)) * WORD;
            }
            h = self.next(h);
        }
        total
    }

    /// Owner of the block `ptr` points to, if it is allocated.
    pub fn owner_of(&self, ptr: *const u8) -> Option<Owner> {
        let h = self.header_of(ptr as *mut u8).ok()?;
        Owner::from_tag(self.tag(h))
    }

    /// Walk every block in address order.
    pub fn blocks(&self) -> Blocks<'_, 'a> {
        Blocks { heap: self, at: 0 }
    }
}

// SAFETY: a heap has exclusive use of its region for 'a; the raw base
// pointer is never shared outside it.
unsafe impl Send for Heap<'_> {}

impl Allocator for Heap<'_> {
    fn allocate(&mut self, size: usize, owner: Owner) -> Result<NonNull<u8>, AllocError> {
        Heap::allocate(self, size, owner)
    }

    fn free(&mut self, ptr: *mut u8) -> Result<(), AllocError> {
        Heap::free(self, ptr)
    }

    fn reclaim_owner(&mut self, owner: Owner) -> usize {
        self.reclaim_all(owner)
    }
}

pub struct Blocks<'h, 'a> {
    heap: &'h Heap<'a>,
    at: usize,
}

impl Iterator for Blocks<'_, '_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.at >= self.heap.words {
            return None;
        }
        let h = self.at;
        let tag = self.heap.tag(h);
        let state = match tag {
            TAG_FREE => BlockState::Free,
            TAG_RESERVED => BlockState::Reserved,
            t => match Owner::from_tag(t) {
                Some(o) => BlockState::Owned(o),
                None => BlockState::Reserved,
            },
        };
        self.at = self.heap.next(h);
        Some(BlockInfo {
            offset: h,
            size: self.heap.size(h) * WORD,
            state,
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const A: Owner = Owner::Task(TaskId::new(1, 0));
    const B: Owner = Owner::Task(TaskId::new(2, 0));

    fn words(n: usize) -> usize {
        n * WORD
    }

    #[test]
    fn test_fresh_heap_is_one_free_block() {
        let mut mem = [0usize; 64];
        let heap = Heap::new(&mut mem, FreePolicy::Deferred);
        assert_eq!(heap.free_bytes(), words(64));
        let all: Vec<_> = heap.blocks().collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, BlockState::Free);
        assert_eq!(all[0].size, words(62));
    }

    #[test]
    fn test_allocate_rounds_to_words_and_splits() {
        let mut mem = [0usize; 64];
        let mut heap = Heap::new(&mut mem, FreePolicy::Deferred);

        let p = heap.allocate(1, A).unwrap();
        assert_eq!(p.as_ptr() as usize % WORD, 0);
        assert_eq!(heap.owner_of(p.as_ptr()), Some(A));

        let all: Vec<_> = heap.blocks().collect();
        assert_eq!(all[0].size, words(1));
        assert_eq!(all[1].state, BlockState::Free);
        assert_eq!(all[1].size, words(64 - 2 - 1 - 2));
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        // 2-word header + 10 data words; asking for 9 leaves one word.
        let mut mem = [0usize; 12];
        let mut heap = Heap::new(&mut mem, FreePolicy::Deferred);
        heap.allocate(words(9), A).unwrap();
        let all: Vec<_> = heap.blocks().collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].size, words(10));
        assert_eq!(heap.free_bytes(), 0);
    }

    #[test]
    fn test_allocate_then_free_keeps_free_bytes() {
        let mut mem = [0usize; 128];
        let mut heap = Heap::new(&mut mem, FreePolicy::Deferred);
        let before = heap.free_bytes();
        let p = heap.allocate(40, A).unwrap();
        assert!(heap.free_bytes() < before);
        heap.free(p.as_ptr()).unwrap();
        assert_eq!(heap.free_bytes(), before);
    }

    #[test]
    fn test_net_zero_sequence_restored_after_defragment() {
        let mut mem = [0usize; 256];
        let mut heap = Heap::new(&mut mem, FreePolicy::Deferred);
        let before = heap.free_bytes();

        let a = heap.allocate(24, A).unwrap();
        let b = heap.allocate(100, B).unwrap();
        let c = heap.allocate(8, A).unwrap();
        heap.free(b.as_ptr()).unwrap();
        let d = heap.allocate(60, B).unwrap();
        heap.free(a.as_ptr()).unwrap();
        heap.free(d.as_ptr()).unwrap();
        heap.free(c.as_ptr()).unwrap();

        heap.defragment();
        assert_eq!(heap.free_bytes(), before);
        assert_eq!(heap.blocks().count(), 1);
    }

    #[test]
    fn test_no_coalescing_across_a_used_block() {
        // Exactly two blocks: 16 and 32 data words.
        let mut mem = [0usize; 2 + 16 + 2 + 32];
        let mut heap = Heap::new(&mut mem, FreePolicy::Deferred);
        let first = heap.allocate(words(16), A).unwrap();
        let _second = heap.allocate(words(32), B).unwrap();
        assert_eq!(heap.blocks().count(), 2);

        heap.free(first.as_ptr()).unwrap();
        assert_eq!(
            heap.allocate(words(40), A),
            Err(AllocError::OutOfMemory { requested: words(40) })
        );
        // The freed block is still usable for something that fits.
        assert!(heap.allocate(words(16), A).is_ok());
    }

    #[test]
    fn test_deferred_free_coalesces_on_next_allocation() {
        let mut mem = [0usize; 2 + 8 + 2 + 8 + 2 + 8];
        let mut heap = Heap::new(&mut mem, FreePolicy::Deferred);
        let a = heap.allocate(words(8), A).unwrap();
        let b = heap.allocate(words(8), A).unwrap();
        let _c = heap.allocate(words(8), A).unwrap();

        heap.free(a.as_ptr()).unwrap();
        heap.free(b.as_ptr()).unwrap();
        // Two separate free blocks until someone needs the space.
        assert_eq!(heap.blocks().filter(|b| b.state == BlockState::Free).count(), 2);

        let big = heap.allocate(words(18), B).unwrap();
        assert_eq!(big, a);
        assert_eq!(heap.owner_of(big.as_ptr()), Some(B));
    }

    #[test]
    fn test_eager_free_merges_neighbours() {
        let mut mem = [0usize; 64];
        let mut heap = Heap::new(&mut mem, FreePolicy::Eager);
        let a = heap.allocate(words(8), Owner::Single).unwrap();
        let b = heap.allocate(words(8), Owner::Single).unwrap();
        let c = heap.allocate(words(8), Owner::Single).unwrap();

        heap.free(a.as_ptr()).unwrap();
        heap.free(c.as_ptr()).unwrap();
        heap.free(b.as_ptr()).unwrap();
        assert_eq!(heap.blocks().count(), 1);
        assert_eq!(heap.free_bytes(), words(64));
    }

    #[test]
    fn test_free_rejects_bad_pointers() {
        let mut mem = [0usize; 64];
        let mut heap = Heap::new(&mut mem, FreePolicy::Deferred);
        let p = heap.allocate(16, A).unwrap();

        assert_eq!(heap.free(core::ptr::null_mut()), Ok(()));
        let misaligned = unsafe { p.as_ptr().add(1) };
        assert_eq!(heap.free(misaligned), Err(AllocError::InvalidPointer));
        let mut outside = 0usize;
        assert_eq!(
            heap.free(&mut outside as *mut usize as *mut u8),
            Err(AllocError::InvalidPointer)
        );

        heap.free(p.as_ptr()).unwrap();
        assert_eq!(heap.free(p.as_ptr()), Err(AllocError::DoubleFree));
    }

    #[test]
    fn test_reclaim_all_frees_only_that_owner() {
        let mut mem = [0usize; 128];
        let mut heap = Heap::new(&mut mem, FreePolicy::Deferred);
        let before = heap.free_bytes();

        heap.allocate(16, A).unwrap();
        let keep = heap.allocate(16, B).unwrap();
        heap.allocate(32, A).unwrap();
        let after_alloc = heap.free_bytes();

        assert_eq!(heap.reclaim_all(A), 2);
        assert!(heap.free_bytes() > after_alloc);
        assert_eq!(heap.owner_of(keep.as_ptr()), Some(B));
        assert!(heap.blocks().all(|b| b.state != BlockState::Owned(A)));

        heap.free(keep.as_ptr()).unwrap();
        heap.defragment();
        assert_eq!(heap.free_bytes(), before);
    }

    #[test]
    fn test_reserved_blocks_are_never_handed_out() {
        let mut mem = [0usize; 64];
        let mut heap =
            Heap::with_reserved(&mut mem, FreePolicy::Deferred, &[20..30]).unwrap();

        let states: Vec<_> = heap.blocks().map(|b| b.state).collect();
        assert_eq!(states, [BlockState::Free, BlockState::Reserved, BlockState::Free]);

        // Free space around the hole: 16 words before, 32 after.
        assert_eq!(heap.free_bytes(), words(2 + 16) + words(2 + 32));
        assert!(heap.allocate(words(20), A).is_ok());
        assert!(heap.allocate(words(20), A).is_err());

        heap.defragment();
        assert!(heap.blocks().any(|b| b.state == BlockState::Reserved));
    }

    #[test]
    fn test_reserved_layout_validation() {
        let mut mem = [0usize; 64];
        assert_eq!(
            Heap::with_reserved(&mut mem, FreePolicy::Deferred, &[1..4]).err(),
            Some(AllocError::InvalidLayout)
        );
        assert_eq!(
            Heap::with_reserved(&mut mem, FreePolicy::Deferred, &[10..20, 12..30]).err(),
            Some(AllocError::InvalidLayout)
        );
    }

    #[test]
    fn test_allocate_zeroed() {
        let mut mem = [0xa5a5usize; 64];
        let mut heap = Heap::new(&mut mem, FreePolicy::Deferred);
        let p = heap.allocate_zeroed(4, 6, A).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 24) };
        assert!(bytes.iter().all(|&b| b == 0));

        assert!(heap.allocate_zeroed(usize::MAX, 2, A).is_err());
        assert!(heap.allocate_zeroed(0, 2, A).is_err());
    }

    #[test]
    fn test_first_free_hint_follows_allocations() {
        let mut mem = [0usize; 64];
        let mut heap = Heap::new(&mut mem, FreePolicy::Deferred);
        let a = heap.allocate(words(4), A).unwrap();
        let b = heap.allocate(words(4), A).unwrap();
        heap.free(a.as_ptr()).unwrap();
        // The hole left by `a` is found first.
        assert_eq!(heap.allocate(words(4), B).unwrap(), a);
        assert_ne!(heap.allocate(words(4), B).unwrap(), b);
    }
}
