//! Kernel dynamic memory: a region heap and blocking fixed-block pools.
//!
//! This crate provides the two allocators a small kernel needs for dynamic
//! memory. Both operate over a memory region supplied by the caller, never
//! touch memory outside it, and are `no_std` compatible (with `alloc` for the
//! pool wait queue).
//!
//! # Available Allocators
//!
//! ## [`MemHeap`](heap::MemHeap)
//!
//! A variable-size allocator for general kernel use. Best suited for:
//!
//! - Allocations whose sizes are not known in advance
//! - Buffers that need to grow or shrink ([`resize`](heap::MemHeap::resize))
//! - Installing as the kernel's `#[global_allocator]`
//!
//! **Performance**: O(n) allocation in the number of free blocks (first-fit),
//! O(1) deallocation with immediate coalescing.
//!
//! ## [`MemPool`](pool::MemPool)
//!
//! A fixed-block allocator that can make callers wait for a block. Best
//! suited for:
//!
//! - Many objects of one size (messages, descriptors, packet buffers)
//! - Producer/consumer patterns where an empty pool should block, not fail
//! - Bounding the memory a subsystem may use
//!
//! **Performance**: O(1) allocation and deallocation. Blocked callers are
//! served in FIFO order.
//!
//! # Usage Examples
//!
//! ## Basic `MemHeap` Usage
//!
//! ```rust
//! use kmem::heap::{HeapConfig, MemHeap};
//!
//! let mut region = vec![0u8; 4096]; // In a kernel, this would be a RAM range
//! let heap = MemHeap::with_config(&mut region, HeapConfig::new().with_align(16)).unwrap();
//!
//! let ptr = heap.allocate(100).unwrap();
//! assert_eq!(ptr.addr().get() % 16, 0);
//! heap.free(ptr).unwrap();
//! ```
//!
//! ## Basic `MemPool` Usage
//!
//! ```rust
//! use core::time::Duration;
//!
//! use kmem::{
//!     heap::MemHeap,
//!     pool::HostPool,
//!     wait::Timeout,
//! };
//!
//! let mut region = vec![0u8; 8192];
//! let heap = MemHeap::new(&mut region).unwrap();
//!
//! // 16 blocks of 64 bytes, carved out of the heap
//! let pool = HostPool::create(&heap, 16, 64).unwrap();
//! let block = pool.allocate(Timeout::After(Duration::from_millis(10))).unwrap();
//! pool.free(block).unwrap();
//! ```
//!
//! # Design Considerations
//!
//! ## Memory Safety
//!
//! Allocation and deallocation are safe functions; reading and writing the
//! returned memory is not. Frees of pointers an allocator does not own, and
//! double frees, are detected and handled according to the configured
//! [`MisusePolicy`](error::MisusePolicy): a panic by default, or a returned
//! error.
//!
//! ## Thread Safety
//!
//! Both allocators are `Sync`. Every operation holds a spin lock for its
//! own duration only, and the lock is never held while a thread is
//! suspended.
//!
//! ## Scheduler Integration
//!
//! Blocking pool allocation suspends threads through the
//! [`Scheduler`](sched::Scheduler) trait, which the kernel implements. With
//! the `std` feature (on by default), [`StdScheduler`](sched::StdScheduler)
//! implements it for `std::thread`.
//!
//! ## Integration with Global Allocator
//!
//! [`MemHeap`](heap::MemHeap) implements `GlobalAlloc`:
//!
//! ```rust,ignore
//! use kmem::heap::MemHeap;
//! use spin::once::Once;
//!
//! struct KernelAllocator(Once<MemHeap<'static>>);
//!
//! unsafe impl GlobalAlloc for KernelAllocator {
//!     unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
//!         self.0.get().map_or(ptr::null_mut(), |heap| unsafe { heap.alloc(layout) })
//!     }
//!
//!     unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
//!         if let Some(heap) = self.0.get() {
//!             unsafe { heap.dealloc(ptr, layout) }
//!         }
//!     }
//! }
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub mod align;
pub mod error;
pub mod heap;
pub mod pool;
pub mod sched;
pub mod wait;

pub use self::{
    error::{HeapError, MisusePolicy, PoolError},
    heap::{HeapConfig, MemHeap},
    pool::{MemPool, PoolConfig},
};
