#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use core::{
    alloc::{GlobalAlloc as _, Layout},
    ptr::NonNull,
};
use std::thread;

use kmem::{
    HeapConfig, HeapError, MemHeap, MisusePolicy,
    heap::{BlockInfo, ZeroSizePolicy},
};
use proptest::{collection, prelude::*};

#[repr(C, align(16))]
struct Region<const N: usize>([u8; N]);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn assert_covers_region(heap: &MemHeap<'_>) {
    heap.check().unwrap();
    let mut blocks = Vec::<BlockInfo>::new();
    heap.for_each_block(|b| blocks.push(b));
    let mut offset = 0;
    for block in &blocks {
        assert_eq!(block.offset, offset, "gap or overlap before {block:?}");
        offset += block.size;
    }
    assert_eq!(offset, heap.stats().total);
    assert!(blocks.windows(2).all(|w| w[0].used || w[1].used));
}

#[test]
fn resize_preserves_prefix() {
    init_logger();
    let mut region = Region([0; 64 * 1024]);
    let heap = MemHeap::with_config(&mut region.0, HeapConfig::new().with_align(4)).unwrap();

    let ptr = heap.allocate(16).unwrap();
    let bytes = (0..16).collect::<Vec<u8>>();
    unsafe {
        ptr.as_ptr().copy_from_nonoverlapping(bytes.as_ptr(), 16);
    }

    let ptr = heap.resize(ptr, 32).unwrap();
    assert_eq!(unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 16) }, &bytes[..]);

    let ptr = heap.resize(ptr, 8).unwrap();
    assert_eq!(unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 8) }, &bytes[..8]);

    heap.free(ptr).unwrap();
    assert_covers_region(&heap);
    heap.detach().unwrap();
}

#[test]
fn zero_size_policies() {
    init_logger();
    let mut region = Region([0; 4096]);
    let heap = MemHeap::new(&mut region.0).unwrap();
    assert_eq!(heap.allocate(0), None);
    heap.detach().unwrap();

    let config = HeapConfig::new().with_zero_size(ZeroSizePolicy::MinimalBlock);
    let heap = MemHeap::with_config(&mut region.0, config).unwrap();
    let ptr = heap.allocate(0).unwrap();
    assert_eq!(heap.stats().used_blocks, 1);
    heap.free(ptr).unwrap();
    heap.detach().unwrap();
}

const SLOTS: usize = 40;
const HEAP_SIZE: usize = 64 * 1024;
const MAX_SLICE: usize = HEAP_SIZE / SLOTS;

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc { slot: usize, size: usize },
    AllocZeroed { slot: usize, count: usize, size: usize },
    Free { slot: usize },
    Resize { slot: usize, size: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..SLOTS, 1..=MAX_SLICE).prop_map(|(slot, size)| Op::Alloc { slot, size }),
        (0..SLOTS, 1..16_usize, 1..=MAX_SLICE / 16)
            .prop_map(|(slot, count, size)| Op::AllocZeroed { slot, count, size }),
        (0..SLOTS).prop_map(|slot| Op::Free { slot }),
        (0..SLOTS, 1..=MAX_SLICE).prop_map(|(slot, size)| Op::Resize { slot, size }),
    ]
}

fn assert_zeroed(ptr: NonNull<u8>, len: usize) {
    assert!((0..len).all(|i| unsafe { ptr.as_ptr().add(i).read() } == 0));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn allocate_resize_free_sequences(ops in collection::vec(arb_op(), 1..400)) {
        init_logger();
        let mut region = Box::new(Region([0xa5; HEAP_SIZE]));
        let heap = MemHeap::with_config(&mut region.0, HeapConfig::new().with_align(4)).unwrap();

        // Live allocations are kept all-zero so any prefix can be checked after a move.
        let mut slots: [Option<(NonNull<u8>, usize)>; SLOTS] = [None; SLOTS];
        for op in ops {
            match op {
                Op::Alloc { slot, size } if slots[slot].is_none() => {
                    slots[slot] = heap.allocate(size).map(|ptr| {
                        unsafe {
                            ptr.as_ptr().write_bytes(0, size);
                        }
                        (ptr, size)
                    });
                }
                Op::AllocZeroed { slot, count, size } if slots[slot].is_none() => {
                    slots[slot] = heap.allocate_zeroed(count, size).map(|ptr| {
                        assert_zeroed(ptr, count * size);
                        (ptr, count * size)
                    });
                }
                Op::Free { slot } => {
                    if let Some((ptr, size)) = slots[slot].take() {
                        assert_zeroed(ptr, size);
                        heap.free(ptr).unwrap();
                    }
                }
                Op::Resize { slot, size } => {
                    if let Some((ptr, old)) = slots[slot] {
                        match heap.resize(ptr, size) {
                            Ok(ptr) => {
                                let kept = old.min(size);
                                assert_zeroed(ptr, kept);
                                unsafe {
                                    ptr.as_ptr().add(kept).write_bytes(0, size - kept);
                                }
                                slots[slot] = Some((ptr, size));
                            }
                            Err(HeapError::OutOfMemory { .. }) => assert_zeroed(ptr, old),
                            Err(e) => panic!("unexpected heap error: {e}"),
                        }
                    }
                }
                Op::Alloc { .. } | Op::AllocZeroed { .. } => {}
            }
            assert_covers_region(&heap);
        }

        for (ptr, _) in slots.into_iter().flatten() {
            heap.free(ptr).unwrap();
        }
        assert_covers_region(&heap);
        let stats = heap.stats();
        prop_assert_eq!(stats.used, 0);
        prop_assert_eq!(stats.free_blocks, 1);
    }
}

#[test]
fn shared_between_threads() {
    init_logger();
    let mut region = Region([0; 256 * 1024]);
    let heap = MemHeap::new(&mut region.0).unwrap();

    thread::scope(|s| {
        for id in 0..8_u8 {
            let heap = &heap;
            s.spawn(move || {
                for round in 0..500_usize {
                    let size = 16 + (round * 37 + usize::from(id) * 11) % 700;
                    let Some(ptr) = heap.allocate(size) else {
                        continue;
                    };
                    unsafe {
                        ptr.as_ptr().write_bytes(id, size);
                    }
                    thread::yield_now();
                    assert!((0..size).all(|i| unsafe { ptr.as_ptr().add(i).read() } == id));
                    heap.free(ptr).unwrap();
                }
            });
        }
    });

    assert_covers_region(&heap);
    assert_eq!(heap.stats().used, 0);
}

#[test]
fn checked_misuse_is_returned() {
    init_logger();
    let mut region = Region([0; 4096]);
    let config = HeapConfig::new().with_misuse(MisusePolicy::Checked);
    let heap = MemHeap::with_config(&mut region.0, config).unwrap();

    let ptr = heap.allocate(64).unwrap();
    heap.free(ptr).unwrap();
    assert!(matches!(
        heap.free(ptr),
        Err(HeapError::ForeignOrDoubleFree { .. })
    ));
    assert!(matches!(
        heap.resize(ptr, 128),
        Err(HeapError::ForeignOrDoubleFree { .. })
    ));
    assert_covers_region(&heap);
}

#[test]
fn global_alloc_interface() {
    init_logger();
    let mut region = Region([0; 8192]);
    let heap = MemHeap::with_config(&mut region.0, HeapConfig::new().with_align(16)).unwrap();

    unsafe {
        let layout = Layout::array::<u64>(32).unwrap();
        let ptr = heap.alloc_zeroed(layout).cast::<u64>();
        assert!(!ptr.is_null());
        for i in 0..32 {
            assert_eq!(ptr.add(i).read(), 0);
            ptr.add(i).write(i as u64);
        }

        let grown = heap.realloc(ptr.cast(), layout, 64 * 8).cast::<u64>();
        assert!(!grown.is_null());
        for i in 0..32 {
            assert_eq!(grown.add(i).read(), i as u64);
        }
        heap.dealloc(grown.cast(), Layout::array::<u64>(64).unwrap());
    }

    assert_eq!(heap.stats().used, 0);
    assert_covers_region(&heap);
}
