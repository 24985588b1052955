//! Region-based variable-size heap allocator.
//!
//! [`MemHeap`] manages one caller-supplied memory region as an address-ordered
//! sequence of blocks that covers the region with no gaps and no overlap.
//! Each block begins with a header (see [`block`]) linking it to its physical
//! neighbours; free blocks are also linked into a free index.
//!
//! # Algorithm
//!
//! - **Allocation**: first-fit over the free index. If the chosen block has
//!   room for another minimum-size block after the request, the tail is split
//!   off and returned to the free index; otherwise the whole block is handed
//!   out.
//! - **Deallocation**: the block is validated (magic, in-use bit, neighbour
//!   sentinels), marked free, and merged with a free predecessor and/or
//!   successor, so two free blocks are never adjacent.
//! - **Resize**: shrinking splits off the tail; growing absorbs a free
//!   successor in place when it is large enough, and otherwise moves the
//!   allocation to a new block and copies the surviving prefix.
//!
//! # Thread Safety
//!
//! Every operation runs inside one short critical section. The heap never
//! suspends a caller: exhaustion is reported immediately.
//!
//! # Usage Example
//!
//! ```rust
//! use kmem::heap::MemHeap;
//!
//! let mut region = vec![0u8; 4096];
//! let heap = MemHeap::new(&mut region).unwrap();
//!
//! let ptr = heap.allocate(64).unwrap();
//! let ptr = heap.resize(ptr, 128).unwrap();
//! heap.free(ptr).unwrap();
//! assert_eq!(heap.stats().used, 0);
//! ```

use core::{
    alloc::{GlobalAlloc, Layout},
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
};

use snafu::ensure;
use spin::Mutex;

use self::block::{BlockFlags, BlockHeader};
use crate::{
    align::{self, ALIGN_MIN},
    error::{
        HeapError, MisusePolicy,
        heap_error::{
            CorruptedSnafu, ForeignOrDoubleFreeSnafu, InvalidAlignmentSnafu, OutOfMemorySnafu,
            RegionTooSmallSnafu,
        },
    },
};

mod block;

/// Smallest payload a block may carry before alignment.
const MIN_PAYLOAD: usize = 2 * size_of::<usize>();

/// What [`MemHeap::allocate`] does with a zero-byte request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
pub enum ZeroSizePolicy {
    /// Return `None`.
    #[default]
    Null,
    /// Return a distinct, valid minimum-size allocation that must be freed.
    MinimalBlock,
}

/// Heap construction options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    align: usize,
    zero_size: ZeroSizePolicy,
    misuse: MisusePolicy,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapConfig {
    /// Pointer alignment, [`ZeroSizePolicy::Null`], [`MisusePolicy::Abort`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            align: ALIGN_MIN,
            zero_size: ZeroSizePolicy::Null,
            misuse: MisusePolicy::Abort,
        }
    }

    /// Sets the alignment of every returned pointer.
    ///
    /// Must be a power of two. Values below pointer alignment are raised to
    /// it, since block headers store pointers.
    #[must_use]
    pub const fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    #[must_use]
    pub const fn with_zero_size(mut self, zero_size: ZeroSizePolicy) -> Self {
        self.zero_size = zero_size;
        self
    }

    #[must_use]
    pub const fn with_misuse(mut self, misuse: MisusePolicy) -> Self {
        self.misuse = misuse;
        self
    }
}

/// A point-in-time summary of heap usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes managed by the heap after aligning the region.
    pub total: usize,
    /// Bytes in in-use blocks, headers included.
    pub used: usize,
    /// Highest value `used` has reached.
    pub max_used: usize,
    /// Bytes in free blocks, headers included.
    pub free: usize,
    /// Number of in-use blocks.
    pub used_blocks: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
}

/// One block as reported by [`MemHeap::for_each_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the block header from the start of the managed region.
    pub offset: usize,
    /// Block size, header included.
    pub size: usize,
    /// Whether the block is in use.
    pub used: bool,
}

struct HeapInner {
    first: *mut BlockHeader,
    tail: *mut BlockHeader,
    free_head: *mut BlockHeader,
    header_size: usize,
    min_payload: usize,
    align: usize,
    len: usize,
    used: usize,
    max_used: usize,
    used_blocks: usize,
    free_blocks: usize,
}

unsafe impl Send for HeapInner {}

/// A variable-size allocator over one borrowed memory region.
pub struct MemHeap<'a> {
    inner: Mutex<HeapInner>,
    config: HeapConfig,
    _region: PhantomData<&'a mut [u8]>,
}

impl fmt::Debug for MemHeap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemHeap")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<'a> MemHeap<'a> {
    /// Creates a heap over `region` with the default configuration.
    pub fn new(region: &'a mut [u8]) -> Result<Self, HeapError> {
        Self::with_config(region, HeapConfig::default())
    }

    /// Creates a heap over `region`.
    ///
    /// The start of the region is rounded up and its length rounded down to
    /// the heap alignment.
    pub fn with_config(region: &'a mut [u8], config: HeapConfig) -> Result<Self, HeapError> {
        unsafe { Self::from_raw_parts(region.as_mut_ptr(), region.len(), config) }
    }

    /// Creates a heap over the raw range `start..start + len`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - The range is valid for reads and writes for the lifetime `'a`
    /// - Nothing else accesses the range while the heap exists, except
    ///   through pointers the heap hands out
    pub unsafe fn from_raw_parts(
        start: *mut u8,
        len: usize,
        config: HeapConfig,
    ) -> Result<Self, HeapError> {
        ensure!(
            config.align.is_power_of_two(),
            InvalidAlignmentSnafu {
                align: config.align
            }
        );
        let align = config.align.max(align_of::<BlockHeader>());
        let (Some(header_size), Some(min_payload)) = (
            align::align_up(size_of::<BlockHeader>(), align),
            align::align_up(MIN_PAYLOAD, align),
        ) else {
            return InvalidAlignmentSnafu {
                align: config.align,
            }
            .fail();
        };

        let needed = header_size
            .saturating_mul(2)
            .saturating_add(min_payload);
        let (base, managed) = align::align_region(start, len, align);
        ensure!(
            managed >= needed,
            RegionTooSmallSnafu {
                needed,
                actual: len
            }
        );

        let inner = unsafe {
            let tail_at = base.add(managed - header_size);
            let first = BlockHeader::write(
                base,
                BlockFlags::empty(),
                ptr::null_mut(),
                tail_at.cast(),
            );
            let tail = BlockHeader::write(tail_at, BlockFlags::USED, first, ptr::null_mut());
            let mut inner = HeapInner {
                first,
                tail,
                free_head: ptr::null_mut(),
                header_size,
                min_payload,
                align,
                len: managed,
                used: 0,
                max_used: 0,
                used_blocks: 0,
                free_blocks: 0,
            };
            inner.push_free(first);
            inner
        };

        log::debug!(
            "heap init: region={start:p}+{len:#x}, managed={base:p}+{managed:#x}, align={align}"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            config: config.with_align(align),
            _region: PhantomData,
        })
    }

    /// Returns the alignment every returned pointer satisfies.
    #[must_use]
    pub fn align(&self) -> usize {
        self.config.align
    }

    /// Allocates at least `size` bytes.
    ///
    /// Returns `None` if no free block is large enough. Zero-byte requests
    /// follow the configured [`ZeroSizePolicy`].
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = {
            let mut inner = self.inner.lock();
            let payload = if size == 0 {
                if self.config.zero_size.is_null() {
                    return None;
                }
                inner.min_payload
            } else {
                inner.payload_size(size)?
            };
            unsafe {
                let block = inner.allocate(payload)?;
                inner.payload_of(block)
            }
        };
        log::trace!("heap allocate: size={size} -> {ptr:p}");
        Some(ptr)
    }

    /// Allocates `count * size` bytes and zero-fills them.
    ///
    /// Returns `None` on overflow or exhaustion.
    #[must_use]
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let ptr = self.allocate(total)?;
        unsafe {
            ptr.as_ptr().write_bytes(0, total);
        }
        Some(ptr)
    }

    /// Returns a block to the heap, merging it with free neighbours.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not an in-use allocation of this heap, or a
    /// neighbouring block's sentinel is damaged, unless the heap was
    /// configured with [`MisusePolicy::Checked`].
    #[track_caller]
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let result = {
            let mut inner = self.inner.lock();
            inner.lookup(ptr).map(|block| unsafe { inner.release(block) })
        };
        match result {
            Ok(()) => {
                log::trace!("heap free: {ptr:p}");
                Ok(())
            }
            Err(e) => self.config.misuse.report(e),
        }
    }

    /// Resizes an allocation, preserving the first `min(old, new_size)` bytes.
    ///
    /// The allocation is adjusted in place when shrinking, or when growing
    /// into a free successor; otherwise its contents move to a new block and
    /// the old one is freed. A `new_size` of zero shrinks the block to the
    /// minimum size and keeps it allocated.
    ///
    /// On [`HeapError::OutOfMemory`] the original allocation is untouched.
    ///
    /// # Panics
    ///
    /// Panics on misuse, as [`free`](Self::free) does.
    #[track_caller]
    pub fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, HeapError> {
        let result = {
            let mut inner = self.inner.lock();
            match inner.lookup(ptr) {
                Ok(block) => Ok(unsafe { inner.resize(block, new_size) }),
                Err(e) => Err(e),
            }
        };
        match result {
            Ok(Some(new_ptr)) => {
                log::trace!("heap resize: {ptr:p} size={new_size} -> {new_ptr:p}");
                Ok(new_ptr)
            }
            Ok(None) => OutOfMemorySnafu { size: new_size }.fail(),
            Err(e) => self.config.misuse.report(e),
        }
    }

    /// Returns current usage figures.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let inner = self.inner.lock();
        let free = inner.len - inner.header_size - inner.used;
        HeapStats {
            total: inner.len,
            used: inner.used,
            max_used: inner.max_used,
            free,
            used_blocks: inner.used_blocks,
            free_blocks: inner.free_blocks,
        }
    }

    /// Calls `f` for every block in address order.
    ///
    /// The final block reported is the in-use tail sentinel, so the reported
    /// sizes always sum to [`HeapStats::total`].
    ///
    /// `f` runs with the heap locked and must not call back into this heap,
    /// directly or through a global allocator backed by it. Collect into
    /// storage reserved beforehand and inspect it after the walk.
    pub fn for_each_block<F>(&self, mut f: F)
    where
        F: FnMut(BlockInfo),
    {
        let inner = self.inner.lock();
        let base = inner.first.addr();
        let mut block = inner.first;
        unsafe {
            while !ptr::eq(block, inner.tail) {
                f(BlockInfo {
                    offset: block.addr() - base,
                    size: BlockHeader::size(block),
                    used: (*block).is_used(),
                });
                block = (*block).next;
            }
        }
        f(BlockInfo {
            offset: inner.tail.addr() - base,
            size: inner.header_size,
            used: true,
        });
    }

    /// Walks every block and the free index, verifying the heap invariants.
    ///
    /// Checks header sentinels, physical links, that block sizes sum to the
    /// managed length, that no two free blocks are adjacent, and that the
    /// free index and usage counters agree with the blocks.
    pub fn check(&self) -> Result<(), HeapError> {
        let inner = self.inner.lock();
        unsafe { inner.check() }
    }

    /// Tears the heap down, giving the region back to the caller.
    ///
    /// Fails, returning the heap, while any block is still in use.
    pub fn detach(self) -> Result<(), Self> {
        let used_blocks = self.inner.lock().used_blocks;
        if used_blocks > 0 {
            return Err(self);
        }
        log::debug!("heap detach");
        Ok(())
    }

    /// Tears the heap down even if blocks are still in use.
    ///
    /// Outstanding pointers must not be used afterwards.
    pub fn force_detach(self) {
        let used_blocks = self.inner.lock().used_blocks;
        if used_blocks > 0 {
            log::warn!("heap force-detached with {used_blocks} block(s) in use");
        }
    }
}

/// Lets a kernel install the heap as its `#[global_allocator]`.
///
/// Requests aligned beyond [`MemHeap::align`] fail with a null pointer.
///
/// Under [`MisusePolicy::Abort`] a bad `dealloc` or `realloc` panics, and a
/// global allocator must not unwind. A binary that installs the heap this way
/// builds with `panic = "abort"` or configures [`MisusePolicy::Checked`], in
/// which case the misuse is logged and the call is ignored.
unsafe impl GlobalAlloc for MemHeap<'_> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > self.align() {
            return ptr::null_mut();
        }
        self.allocate(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if let Err(error) = self.free(ptr) {
            log::warn!("dealloc ignored for {ptr:p}: {error}");
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        if layout.align() > self.align() {
            return ptr::null_mut();
        }
        self.resize(ptr, new_size)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

impl HeapInner {
    /// Rounds a non-zero request up to a payload size.
    fn payload_size(&self, size: usize) -> Option<usize> {
        Some(align::align_up(size, self.align)?.max(self.min_payload))
    }

    fn min_block(&self) -> usize {
        self.header_size + self.min_payload
    }

    unsafe fn payload_of(&self, block: *mut BlockHeader) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(block.cast::<u8>().add(self.header_size)) }
    }

    /// Maps a caller pointer back to its in-use block header.
    fn lookup(&self, ptr: NonNull<u8>) -> Result<*mut BlockHeader, HeapError> {
        let addr = ptr.addr().get();
        let first = self.first.addr();
        let tail = self.tail.addr();
        ensure!(
            addr >= first + self.header_size
                && addr < tail
                && align::is_aligned(addr, self.align),
            ForeignOrDoubleFreeSnafu { address: addr }
        );

        let block = self
            .first
            .cast::<u8>()
            .with_addr(addr - self.header_size)
            .cast::<BlockHeader>();
        unsafe {
            ensure!(
                (*block).is_valid() && (*block).is_used(),
                ForeignOrDoubleFreeSnafu { address: addr }
            );

            // Check both neighbours before anything touches them.
            let next = (*block).next;
            ensure!(
                next.addr() > block.addr()
                    && next.addr() <= tail
                    && align::is_aligned(next.addr(), self.align),
                CorruptedSnafu {
                    address: block.addr()
                }
            );
            ensure!(
                (*next).is_valid() && ptr::eq((*next).prev, block),
                CorruptedSnafu {
                    address: next.addr()
                }
            );
            let prev = (*block).prev;
            if !prev.is_null() {
                ensure!(
                    prev.addr() >= first
                        && prev.addr() < block.addr()
                        && align::is_aligned(prev.addr(), self.align),
                    CorruptedSnafu {
                        address: block.addr()
                    }
                );
                ensure!(
                    (*prev).is_valid() && ptr::eq((*prev).next, block),
                    CorruptedSnafu {
                        address: prev.addr()
                    }
                );
            }
        }
        Ok(block)
    }

    unsafe fn push_free(&mut self, block: *mut BlockHeader) {
        unsafe {
            (*block).prev_free = ptr::null_mut();
            (*block).next_free = self.free_head;
            if !self.free_head.is_null() {
                (*self.free_head).prev_free = block;
            }
        }
        self.free_head = block;
        self.free_blocks += 1;
    }

    unsafe fn unlink_free(&mut self, block: *mut BlockHeader) {
        unsafe {
            let prev = (*block).prev_free;
            let next = (*block).next_free;
            if prev.is_null() {
                self.free_head = next;
            } else {
                (*prev).next_free = next;
            }
            if !next.is_null() {
                (*next).prev_free = prev;
            }
            (*block).prev_free = ptr::null_mut();
            (*block).next_free = ptr::null_mut();
        }
        self.free_blocks -= 1;
    }

    /// Absorbs `next`, the physical successor of `block`, into `block`.
    unsafe fn merge(block: *mut BlockHeader, next: *mut BlockHeader) {
        unsafe {
            let after = (*next).next;
            (*block).next = after;
            (*after).prev = block;
            (*next).invalidate();
        }
    }

    /// Splits everything past the first `need` bytes of `block` into a new
    /// free block, if the remainder can hold a minimum-size block.
    ///
    /// The new block is not yet in the free index.
    unsafe fn carve(&self, block: *mut BlockHeader, need: usize) -> Option<*mut BlockHeader> {
        unsafe {
            let size = BlockHeader::size(block);
            if size - need < self.min_block() {
                return None;
            }
            let next = (*block).next;
            let rest = BlockHeader::write(
                block.cast::<u8>().add(need),
                BlockFlags::empty(),
                block,
                next,
            );
            (*next).prev = rest;
            (*block).next = rest;
            Some(rest)
        }
    }

    /// Marks a free, unindexed block as free, merges it with free
    /// neighbours, and indexes the result.
    unsafe fn coalesce(&mut self, block: *mut BlockHeader) {
        unsafe {
            let mut block = block;
            let prev = (*block).prev;
            if !prev.is_null() && !(*prev).is_used() {
                self.unlink_free(prev);
                Self::merge(prev, block);
                block = prev;
            }
            let next = (*block).next;
            if !(*next).is_used() {
                self.unlink_free(next);
                Self::merge(block, next);
            }
            self.push_free(block);
        }
    }

    fn note_used(&mut self, delta: usize) {
        self.used += delta;
        self.max_used = self.max_used.max(self.used);
    }

    /// First-fit allocation of a block with `payload` bytes.
    unsafe fn allocate(&mut self, payload: usize) -> Option<*mut BlockHeader> {
        let need = self.header_size.checked_add(payload)?;
        unsafe {
            let mut block = self.free_head;
            while !block.is_null() && BlockHeader::size(block) < need {
                block = (*block).next_free;
            }
            if block.is_null() {
                return None;
            }

            self.unlink_free(block);
            if let Some(rest) = self.carve(block, need) {
                // The successor of a free block is never free.
                self.push_free(rest);
            }
            (*block).set_used(true);
            self.used_blocks += 1;
            self.note_used(BlockHeader::size(block));
            Some(block)
        }
    }

    unsafe fn release(&mut self, block: *mut BlockHeader) {
        unsafe {
            self.used -= BlockHeader::size(block);
            self.used_blocks -= 1;
            (*block).set_used(false);
            self.coalesce(block);
        }
    }

    /// Returns the (possibly moved) payload pointer, or `None` if the block
    /// could neither grow in place nor move.
    unsafe fn resize(&mut self, block: *mut BlockHeader, new_size: usize) -> Option<NonNull<u8>> {
        let payload = if new_size == 0 {
            self.min_payload
        } else {
            self.payload_size(new_size)?
        };
        let need = self.header_size.checked_add(payload)?;
        unsafe {
            let old_size = BlockHeader::size(block);

            if need <= old_size {
                if let Some(rest) = self.carve(block, need) {
                    self.used -= BlockHeader::size(rest);
                    self.coalesce(rest);
                }
                return Some(self.payload_of(block));
            }

            let next = (*block).next;
            if !(*next).is_used() && old_size + BlockHeader::size(next) >= need {
                let mut gained = BlockHeader::size(next);
                self.unlink_free(next);
                Self::merge(block, next);
                if let Some(rest) = self.carve(block, need) {
                    gained -= BlockHeader::size(rest);
                    self.push_free(rest);
                }
                self.note_used(gained);
                return Some(self.payload_of(block));
            }

            let new_block = self.allocate(payload)?;
            let keep = (old_size - self.header_size).min(new_size);
            let src = self.payload_of(block);
            let dst = self.payload_of(new_block);
            ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), keep);
            self.release(block);
            Some(dst)
        }
    }

    unsafe fn check(&self) -> Result<(), HeapError> {
        unsafe {
            let mut total = 0;
            let mut used = 0;
            let mut used_blocks = 0;
            let mut free_blocks = 0;
            let mut prev: *mut BlockHeader = ptr::null_mut();
            let mut prev_free = false;
            let mut block = self.first;
            while !ptr::eq(block, self.tail) {
                let address = block.addr();
                let next = (*block).next;
                ensure!(
                    (*block).is_valid()
                        && ptr::eq((*block).prev, prev)
                        && next.addr() > address
                        && next.addr() <= self.tail.addr()
                        && align::is_aligned(next.addr(), self.align),
                    CorruptedSnafu { address }
                );
                let size = BlockHeader::size(block);
                total += size;
                if (*block).is_used() {
                    used += size;
                    used_blocks += 1;
                    prev_free = false;
                } else {
                    ensure!(!prev_free, CorruptedSnafu { address });
                    free_blocks += 1;
                    prev_free = true;
                }
                prev = block;
                block = next;
            }

            let address = self.tail.addr();
            ensure!(
                (*self.tail).is_valid()
                    && (*self.tail).is_used()
                    && ptr::eq((*self.tail).prev, prev),
                CorruptedSnafu { address }
            );
            total += self.header_size;
            ensure!(total == self.len, CorruptedSnafu { address });
            ensure!(
                used == self.used
                    && used_blocks == self.used_blocks
                    && free_blocks == self.free_blocks,
                CorruptedSnafu { address }
            );

            let mut indexed = 0;
            let mut prev: *mut BlockHeader = ptr::null_mut();
            let mut block = self.free_head;
            while !block.is_null() {
                let address = block.addr();
                ensure!(
                    (*block).is_valid()
                        && !(*block).is_used()
                        && ptr::eq((*block).prev_free, prev)
                        && indexed < free_blocks,
                    CorruptedSnafu { address }
                );
                indexed += 1;
                prev = block;
                block = (*block).next_free;
            }
            ensure!(
                indexed == free_blocks,
                CorruptedSnafu {
                    address: self.first.addr()
                }
            );
        }
        Ok(())
    }
}
