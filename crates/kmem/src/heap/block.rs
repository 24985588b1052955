//! In-region block header.
//!
//! Every block, free or in use, starts with a [`BlockHeader`]. Headers are
//! chained in address order through `prev`/`next`, which makes a block's
//! size implicit (`next - self`) and lets coalescing find both physical
//! neighbours in O(1). Free blocks are additionally linked into the free
//! index through `prev_free`/`next_free`; those two fields are meaningless
//! while the block is in use.
//!
//! ```text
//! region start                                                 region end
//! ┌────────┬──────────┬────────┬───────────────────┬─ ─ ─┬────────────┐
//! │ header │ payload  │ header │ payload           │     │ tail header│
//! └────────┴──────────┴────────┴───────────────────┴─ ─ ─┴────────────┘
//!   block 0             block 1                            sentinel (used)
//! ```
//!
//! The tail sentinel is a permanently in-use, payload-less block. It stops
//! coalescing at the end of the region and gives the last real block a
//! `next` to measure its size against.

use core::ptr;

use bitflags::bitflags;

/// Bits of [`BlockHeader::magic`] that hold the magic value.
const MAGIC_MASK: usize = !0xf;

/// Magic value stamped into every live header.
///
/// Truncated on 32-bit targets, where it still keeps the low flag bits clear.
#[expect(clippy::cast_possible_truncation)]
const MAGIC: usize = 0x1ea0_1ea0_4b6d_e3a0_u64 as usize & MAGIC_MASK;

bitflags! {
    /// State bits stored in the low bits of [`BlockHeader::magic`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(super) struct BlockFlags: usize {
        /// The block is handed out to a caller (or is the tail sentinel).
        const USED = 1 << 0;
    }
}

#[repr(C)]
#[derive(Debug)]
pub(super) struct BlockHeader {
    magic: usize,
    pub(super) prev: *mut Self,
    pub(super) next: *mut Self,
    pub(super) prev_free: *mut Self,
    pub(super) next_free: *mut Self,
}

impl BlockHeader {
    /// Writes a fresh header at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be valid for writes of `BlockHeader` and suitably aligned.
    pub(super) unsafe fn write(
        at: *mut u8,
        flags: BlockFlags,
        prev: *mut Self,
        next: *mut Self,
    ) -> *mut Self {
        #[expect(clippy::cast_ptr_alignment)]
        let block = at.cast::<Self>();
        assert!(block.is_aligned(), "block header must be aligned");
        unsafe {
            block.write(Self {
                magic: MAGIC | flags.bits(),
                prev,
                next,
                prev_free: ptr::null_mut(),
                next_free: ptr::null_mut(),
            });
        }
        block
    }

    /// Returns `true` if the header carries the magic value.
    pub(super) fn is_valid(&self) -> bool {
        self.magic & MAGIC_MASK == MAGIC
    }

    pub(super) fn flags(&self) -> BlockFlags {
        BlockFlags::from_bits_truncate(self.magic & !MAGIC_MASK)
    }

    pub(super) fn is_used(&self) -> bool {
        self.flags().contains(BlockFlags::USED)
    }

    pub(super) fn set_used(&mut self, used: bool) {
        let mut flags = self.flags();
        flags.set(BlockFlags::USED, used);
        self.magic = MAGIC | flags.bits();
    }

    /// Wipes the magic value of a header that has been merged away.
    pub(super) fn invalidate(&mut self) {
        self.magic = 0;
    }

    /// Returns the block size, header included.
    ///
    /// # Safety
    ///
    /// `block` must point to a live, non-sentinel header.
    pub(super) unsafe fn size(block: *const Self) -> usize {
        unsafe { (*block).next.addr() - block.addr() }
    }
}
