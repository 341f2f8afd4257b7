//! General heap under random allocate/free traffic.

#![allow(clippy::arithmetic_side_effects)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::cast_possible_truncation)]

use overlay::heap::general::{GeneralHeap, GRANULE, MIN_ARENA};
use platform::sim::SimScheduler;

const BASE: u32 = 0x2000;
const ARENA: usize = 2048;

#[test]
fn minimum_arena_holds_one_allocation() {
    let mut arena = vec![0u8; MIN_ARENA as usize];
    let mut sched = SimScheduler::new();
    let mut heap = GeneralHeap::init(&mut arena, BASE, 256);
    let ptr = heap.alloc(&mut sched, 1);
    assert!(ptr.is_some(), "a 1-byte allocation must fit");
    let ptr = ptr.unwrap();
    assert_eq!(heap.alloc(&mut sched, 1), None, "arena is exhausted");
    heap.free(&mut sched, ptr);
    assert!(heap.alloc(&mut sched, GRANULE).is_some());
}

#[test]
fn user_data_survives_neighbouring_frees() {
    let mut arena = vec![0u8; ARENA];
    let mut sched = SimScheduler::new();
    let mut heap = GeneralHeap::init(&mut arena, BASE, 256);
    let a = heap.alloc(&mut sched, 40).unwrap();
    let b = heap.alloc_aligned(&mut sched, 100, 32).unwrap();
    let c = heap.alloc(&mut sched, 12).unwrap();
    heap.bytes_mut(b, 100).unwrap().fill(0x3C);
    heap.free(&mut sched, a);
    heap.free(&mut sched, c);
    assert!(heap.bytes(b, 100).unwrap().iter().all(|x| *x == 0x3C));
    heap.free(&mut sched, b);
}

#[test]
fn freed_space_is_reused_first_fit() {
    let mut arena = vec![0u8; ARENA];
    let mut sched = SimScheduler::new();
    let mut heap = GeneralHeap::init(&mut arena, BASE, 256);
    let a = heap.alloc(&mut sched, 64).unwrap();
    let _b = heap.alloc(&mut sched, 64).unwrap();
    heap.free(&mut sched, a);
    assert_eq!(heap.alloc(&mut sched, 32), Some(a), "lowest fitting block wins");
}

#[test]
#[should_panic(expected = "foreign pointer")]
fn freeing_pointer_outside_arena_halts() {
    let mut arena = vec![0u8; ARENA];
    let mut sched = SimScheduler::new();
    let mut heap = GeneralHeap::init(&mut arena, BASE, 256);
    heap.free(&mut sched, BASE - 0x100);
}

#[test]
#[should_panic(expected = "not granule aligned")]
fn misaligned_arena_halts() {
    let mut arena = vec![0u8; ARENA];
    let _ = GeneralHeap::init(&mut arena, BASE + 4, 256);
}

#[derive(Debug, Clone)]
enum Op {
    Alloc { size: u32, align_shift: u32 },
    Free(usize),
}

fn op() -> impl proptest::strategy::Strategy<Value = Op> {
    use proptest::prelude::*;
    prop_oneof![
        (1u32..200, 0u32..9).prop_map(|(size, align_shift)| Op::Alloc { size, align_shift }),
        (0usize..32).prop_map(Op::Free),
    ]
}

proptest::proptest! {
    #[test]
    fn live_blocks_never_overlap(ops in proptest::collection::vec(op(), 1..80)) {
        let mut arena = vec![0u8; ARENA];
        let mut sched = SimScheduler::new();
        let mut heap = GeneralHeap::init(&mut arena, BASE, 256);
        let total = heap.free_bytes();
        let mut live: Vec<(u32, u32, u8)> = Vec::new();

        for (n, op) in ops.into_iter().enumerate() {
            match op {
                Op::Alloc { size, align_shift } => {
                    let align = 1u32 << align_shift;
                    if let Some(ptr) = heap.alloc_aligned(&mut sched, size, align) {
                        proptest::prop_assert_eq!(ptr % align, 0);
                        proptest::prop_assert!(ptr >= BASE && ptr + size <= BASE + ARENA as u32);
                        for &(p, s, _) in &live {
                            proptest::prop_assert!(ptr + size <= p || ptr >= p + s, "overlap");
                        }
                        let fill = n as u8;
                        heap.bytes_mut(ptr, size).unwrap().fill(fill);
                        live.push((ptr, size, fill));
                    }
                }
                Op::Free(pick) => {
                    if !live.is_empty() {
                        let (ptr, size, fill) = live.swap_remove(pick % live.len());
                        proptest::prop_assert!(
                            heap.bytes(ptr, size).unwrap().iter().all(|b| *b == fill),
                            "allocation contents clobbered"
                        );
                        heap.free(&mut sched, ptr);
                    }
                }
            }
            proptest::prop_assert_eq!(sched.suspend_depth(), 0);
        }

        for (ptr, _, _) in live.drain(..) {
            heap.free(&mut sched, ptr);
        }
        proptest::prop_assert_eq!(heap.free_bytes(), total, "all space returns");
        proptest::prop_assert_eq!(heap.largest_free_block(), total, "and coalesces into one block");
    }
}
