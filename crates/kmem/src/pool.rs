//! Fixed-block pool allocator with blocking allocation.
//!
//! A [`MemPool`] carves one region into `N` equally sized blocks. Each block
//! is preceded by one machine word, its link:
//!
//! ```text
//! ┌──────┬───────────────┬──────┬───────────────┬─ ─ ─┬──────┬───────────────┐
//! │ link │ payload (B)   │ link │ payload (B)   │     │ link │ payload (B)   │
//! └──────┴───────────────┴──────┴───────────────┴─ ─ ─┴──────┴───────────────┘
//! ```
//!
//! While a block is free its link points at the next free block, forming an
//! intrusive free list with O(1) allocate and free. While a block is in use
//! its link holds a tag derived from the pool's start address, which lets
//! [`MemPool::free`] reject foreign pointers and double frees.
//!
//! # Blocking
//!
//! When the free list is empty, [`MemPool::allocate`] with a non-zero
//! [`Timeout`] queues the caller on a FIFO [`WaitQueue`] and suspends it.
//! [`MemPool::free`] hands a freed block directly to the longest-waiting
//! thread instead of pushing it onto the free list, so a thread arriving later
//! can never take a block ahead of an earlier waiter.
//!
//! [`MemPool::close`] wakes every waiter with [`PoolError::Aborted`] and makes
//! later allocations fail the same way.

use core::{fmt, marker::PhantomData, ptr::NonNull};

use snafu::{OptionExt as _, ResultExt as _, ensure};
use spin::Mutex;

use crate::{
    align::{self, ALIGN_MIN},
    error::{
        MisusePolicy, PoolError, heap_error,
        pool_error::{
            AbortedSnafu, BackingSnafu, ForeignOrDoubleFreeSnafu, InvalidBlockSizeSnafu,
            OutOfMemorySnafu, RegionTooSmallSnafu, TimeoutSnafu,
        },
    },
    heap::MemHeap,
    sched::Scheduler,
    wait::{Timeout, WaitQueue, WakeReason},
};

/// Bytes of bookkeeping in front of every block.
pub const LINK_SIZE: usize = size_of::<usize>();

/// Low bit set in the link of an in-use block. Free-list links are
/// word-aligned addresses, so it is never set in them.
const USED_BIT: usize = 1;

/// Pool construction options.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    allow_empty: bool,
    misuse: MisusePolicy,
}

impl PoolConfig {
    /// Rejects empty pools, [`MisusePolicy::Abort`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allow_empty: false,
            misuse: MisusePolicy::Abort,
        }
    }

    /// Permits a pool whose region holds no block at all.
    ///
    /// Such a pool fails every non-blocking allocation, and blocking ones
    /// wait until they time out or the pool is closed.
    #[must_use]
    pub const fn with_allow_empty(mut self, allow_empty: bool) -> Self {
        self.allow_empty = allow_empty;
        self
    }

    #[must_use]
    pub const fn with_misuse(mut self, misuse: MisusePolicy) -> Self {
        self.misuse = misuse;
        self
    }
}

/// A point-in-time summary of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Usable bytes per block.
    pub block_size: usize,
    /// Total number of blocks.
    pub block_count: usize,
    /// Blocks on the free list.
    pub free: usize,
    /// Blocks handed out and not yet freed.
    pub in_use: usize,
    /// Threads suspended in [`MemPool::allocate`].
    pub waiting: usize,
}

/// A block address in transit from [`MemPool::free`] to a waiter.
#[derive(Debug)]
struct Block(NonNull<u8>);

unsafe impl Send for Block {}

struct PoolState<S>
where
    S: Scheduler,
{
    start: NonNull<u8>,
    free_head: Option<NonNull<u8>>,
    free_count: usize,
    closed: bool,
    waiters: WaitQueue<Block, S>,
}

unsafe impl<S> Send for PoolState<S> where S: Scheduler {}

impl<S> PoolState<S>
where
    S: Scheduler,
{
    fn used_tag(&self) -> usize {
        self.start.addr().get() | USED_BIT
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let block = self.free_head?;
        unsafe {
            let link = block.cast::<*mut u8>();
            self.free_head = NonNull::new(link.read());
            block.cast::<usize>().write(self.used_tag());
        }
        self.free_count -= 1;
        Some(block)
    }

    fn push(&mut self, block: NonNull<u8>) {
        let next = self
            .free_head
            .map_or(core::ptr::null_mut(), NonNull::as_ptr);
        unsafe {
            block.cast::<*mut u8>().write(next);
        }
        self.free_head = Some(block);
        self.free_count += 1;
    }
}

/// A pool of fixed-size blocks over one borrowed region.
///
/// `S` supplies thread suspension for blocking allocation.
pub struct MemPool<'a, S>
where
    S: Scheduler,
{
    state: Mutex<PoolState<S>>,
    block_size: usize,
    stride: usize,
    block_count: usize,
    config: PoolConfig,
    backing: Option<&'a MemHeap<'a>>,
    _region: PhantomData<&'a mut [u8]>,
}

/// A pool whose waiters are `std` threads.
#[cfg(any(test, feature = "std"))]
pub type HostPool<'a> = MemPool<'a, crate::sched::StdScheduler>;

impl<S> fmt::Debug for MemPool<'_, S>
where
    S: Scheduler,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("dynamic", &self.backing.is_some())
            .finish()
    }
}

/// Rounds `block_size` up and returns `(block_size, stride)`.
fn block_geometry(block_size: usize) -> Result<(usize, usize), PoolError> {
    ensure!(block_size > 0, InvalidBlockSizeSnafu { block_size });
    align::align_up(block_size, ALIGN_MIN)
        .and_then(|b| Some((b, b.checked_add(LINK_SIZE)?)))
        .context(InvalidBlockSizeSnafu { block_size })
}

impl<'a, S> MemPool<'a, S>
where
    S: Scheduler,
{
    /// Creates a pool over `buffer` with the default configuration.
    pub fn new(buffer: &'a mut [u8], block_size: usize) -> Result<Self, PoolError> {
        Self::with_config(buffer, block_size, PoolConfig::default())
    }

    /// Creates a pool over `buffer`.
    ///
    /// The block size is rounded up to pointer alignment and the pool holds
    /// `buffer.len() / (block_size + LINK_SIZE)` blocks, after trimming
    /// `buffer` to pointer alignment.
    pub fn with_config(
        buffer: &'a mut [u8],
        block_size: usize,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        unsafe { Self::from_raw_parts(buffer.as_mut_ptr(), buffer.len(), block_size, config) }
    }

    /// Creates a pool over the raw range `start..start + len`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - The range is valid for reads and writes for the lifetime `'a`
    /// - Nothing else accesses the range while the pool exists, except
    ///   through pointers the pool hands out
    pub unsafe fn from_raw_parts(
        start: *mut u8,
        len: usize,
        block_size: usize,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        let (size, stride) = block_geometry(block_size)?;
        let (base, managed) = align::align_region(start, len, ALIGN_MIN);
        let block_count = managed / stride;
        ensure!(
            block_count > 0 || config.allow_empty,
            RegionTooSmallSnafu {
                needed: stride,
                actual: len
            }
        );
        let base = NonNull::new(base).unwrap_or(NonNull::dangling());
        Ok(unsafe { Self::build(base, size, stride, block_count, config, None) })
    }

    /// Creates a pool of `block_count` blocks whose region is taken from
    /// `heap`, with the default configuration.
    ///
    /// The region goes back to `heap` when the pool is dropped.
    pub fn create(
        heap: &'a MemHeap<'a>,
        block_count: usize,
        block_size: usize,
    ) -> Result<Self, PoolError> {
        Self::create_with_config(heap, block_count, block_size, PoolConfig::default())
    }

    /// Creates a pool of `block_count` blocks whose region is taken from
    /// `heap`.
    pub fn create_with_config(
        heap: &'a MemHeap<'a>,
        block_count: usize,
        block_size: usize,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        let (size, stride) = block_geometry(block_size)?;
        ensure!(
            block_count > 0 || config.allow_empty,
            RegionTooSmallSnafu {
                needed: stride,
                actual: 0_usize
            }
        );
        if block_count == 0 {
            return Ok(unsafe { Self::build(NonNull::dangling(), size, stride, 0, config, None) });
        }

        let needed = block_count
            .checked_mul(stride)
            .context(InvalidBlockSizeSnafu { block_size })?;
        let region = heap
            .allocate(needed)
            .context(heap_error::OutOfMemorySnafu { size: needed })
            .context(BackingSnafu)?;
        log::debug!("pool region obtained from heap: {region:p}+{needed:#x}");
        Ok(unsafe { Self::build(region, size, stride, block_count, config, Some(heap)) })
    }

    /// Links all blocks of `base` into the free list, in address order.
    unsafe fn build(
        base: NonNull<u8>,
        block_size: usize,
        stride: usize,
        block_count: usize,
        config: PoolConfig,
        backing: Option<&'a MemHeap<'a>>,
    ) -> Self {
        let mut state = PoolState {
            start: base,
            free_head: None,
            free_count: 0,
            closed: false,
            waiters: WaitQueue::new(),
        };
        for i in (0..block_count).rev() {
            state.push(unsafe { base.add(i * stride) });
        }

        log::debug!(
            "pool init: start={base:p}, block_size={block_size}, stride={stride}, count={block_count}"
        );

        Self {
            state: Mutex::new(state),
            block_size,
            stride,
            block_count,
            config,
            backing,
            _region: PhantomData,
        }
    }

    /// Returns the usable size of each block.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the total number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Takes one block, waiting up to `timeout` for one to be freed.
    ///
    /// A free block is returned immediately without suspending. Otherwise a
    /// non-blocking `timeout` fails with [`PoolError::OutOfMemory`], and a
    /// blocking one suspends the caller until [`free`](Self::free) hands it a
    /// block ([`PoolError::Timeout`] if the deadline passes first).
    ///
    /// Fails with [`PoolError::Aborted`] if the pool is closed before or
    /// while waiting.
    pub fn allocate(&self, timeout: Timeout) -> Result<NonNull<u8>, PoolError> {
        let ticket = {
            let mut state = self.state.lock();
            ensure!(!state.closed, AbortedSnafu);
            if let Some(block) = state.pop() {
                let ptr = Self::payload_of(block);
                log::trace!("pool allocate: {ptr:p}");
                return Ok(ptr);
            }
            ensure!(!timeout.is_non_blocking(), OutOfMemorySnafu);
            state.waiters.enqueue()
        };

        log::trace!("pool allocate: suspending, timeout={timeout:?}");
        let reason = match ticket.suspend(timeout) {
            Some(reason) => reason,
            None => self.state.lock().waiters.cancel(&ticket),
        };
        match reason {
            WakeReason::Woken(Block(block)) => {
                let ptr = Self::payload_of(block);
                log::trace!("pool allocate: handed {ptr:p}");
                Ok(ptr)
            }
            WakeReason::TimedOut => TimeoutSnafu.fail(),
            WakeReason::Aborted => AbortedSnafu.fail(),
        }
    }

    /// Returns a block to the pool.
    ///
    /// If threads are waiting, the block goes straight to the one that has
    /// waited longest.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not an in-use block of this pool, unless the pool
    /// was configured with [`MisusePolicy::Checked`].
    #[track_caller]
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), PoolError> {
        let result = {
            let mut state = self.state.lock();
            self.block_of(&state, ptr).map(|block| {
                match state.waiters.wake_one(Block(block)) {
                    Ok(()) => true,
                    Err(Block(block)) => {
                        state.push(block);
                        false
                    }
                }
            })
        };
        match result {
            Ok(handed_off) => {
                log::trace!("pool free: {ptr:p}, handed_off={handed_off}");
                Ok(())
            }
            Err(e) => self.config.misuse.report(e),
        }
    }

    /// Closes the pool, failing every current and future waiter.
    ///
    /// Returns the number of threads woken with [`PoolError::Aborted`].
    /// Blocks still in use may be freed afterwards.
    pub fn close(&self) -> usize {
        let woken = {
            let mut state = self.state.lock();
            state.closed = true;
            state.waiters.wake_all()
        };
        log::debug!("pool closed: woke {woken} waiter(s)");
        woken
    }

    /// Returns current usage figures.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            block_size: self.block_size,
            block_count: self.block_count,
            free: state.free_count,
            in_use: self.block_count - state.free_count,
            waiting: state.waiters.len(),
        }
    }

    /// Tears the pool down.
    ///
    /// Fails, returning the pool, while any block is still in use. A
    /// heap-backed pool returns its region to the heap.
    pub fn detach(self) -> Result<(), Self> {
        if self.stats().in_use > 0 {
            return Err(self);
        }
        Ok(())
    }

    /// Tears the pool down even if blocks are still in use.
    ///
    /// Outstanding pointers must not be used afterwards.
    pub fn force_detach(self) {
        let in_use = self.stats().in_use;
        if in_use > 0 {
            log::warn!("pool force-detached with {in_use} block(s) in use");
        }
    }

    fn payload_of(block: NonNull<u8>) -> NonNull<u8> {
        unsafe { block.add(LINK_SIZE) }
    }

    /// Maps a caller pointer back to its in-use block.
    fn block_of(&self, state: &PoolState<S>, ptr: NonNull<u8>) -> Result<NonNull<u8>, PoolError> {
        let address = ptr.addr().get();
        let start = state.start.addr().get();
        let offset = address.wrapping_sub(start + LINK_SIZE);
        ensure!(
            address >= start + LINK_SIZE
                && offset < self.block_count * self.stride
                && offset % self.stride == 0,
            ForeignOrDoubleFreeSnafu { address }
        );
        let block = unsafe { state.start.add(offset) };
        let tag = unsafe { block.cast::<usize>().read() };
        ensure!(tag == state.used_tag(), ForeignOrDoubleFreeSnafu { address });
        Ok(block)
    }
}

impl<S> Drop for MemPool<'_, S>
where
    S: Scheduler,
{
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(heap) = self.backing.take() {
            log::debug!("pool region returned to heap: {:p}", state.start);
            if let Err(e) = heap.free(state.start) {
                log::error!("failed to return pool region to heap: {e}");
            }
        }
    }
}
