//! Bump allocation inside DMEM overlays: bounds, alignment, overflow safety
//! and eager tagging of the blocks an allocation grows into.

#![allow(clippy::arithmetic_side_effects)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::cast_possible_truncation)]

mod common;

use common::*;
use overlay::{AllocError, DmaLock, MemClass, OvlSize};
use platform::{DmemTagMemory, TagMemory};

fn size_current(sys: &System<'_>, raw: u8) -> OvlSize {
    sys.table(MemClass::Dmem).get(idx(raw)).unwrap().size_current
}

// ── Bounds ──────────────────────────────────────────────────────────────────

#[test]
fn three_hundred_bytes_do_not_fit_in_256() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    let base = 0x1_1000;

    assert_eq!(sys.alloc(idx(SMALL), 100), Ok(base));
    assert_eq!(size_current(&sys, SMALL), 100);
    assert_eq!(sys.alloc(idx(SMALL), 100), Ok(base + 100));
    assert_eq!(size_current(&sys, SMALL), 200);
    assert_eq!(sys.alloc(idx(SMALL), 100), Err(AllocError::OutOfSpace));
    assert_eq!(size_current(&sys, SMALL), 200, "failed allocation must not move the live end");
    assert_eq!(sys.free_bytes(idx(SMALL)), 56);
}

#[test]
fn rejected_arguments_leave_overlay_untouched() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    assert_eq!(sys.alloc(idx(BUMP), 0), Err(AllocError::InvalidArgument));
    assert_eq!(sys.alloc_aligned(idx(BUMP), 8, 0), Err(AllocError::InvalidArgument));
    assert_eq!(sys.alloc_aligned(idx(BUMP), 8, 6), Err(AllocError::InvalidArgument));
    assert_eq!(
        sys.alloc_aligned(idx(BUMP), 8, BLOCK as usize * 2),
        Err(AllocError::InvalidArgument),
        "alignment above one block must be refused"
    );
    assert!(sys.alloc(idx(BUMP), usize::MAX).is_err());
    assert!(sys.alloc(idx(BUMP), OvlSize::MAX as usize).is_err());
    assert_eq!(size_current(&sys, BUMP), 0);
}

// ── Paged growth ────────────────────────────────────────────────────────────

#[test]
fn first_allocation_tags_block_without_transfer() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    let addr = sys.alloc(idx(BUMP), 16).unwrap();
    assert_eq!(addr, 0x1_0400);

    let word = sys.dmem_hw().lookup(tag(addr));
    assert!(word.is_valid(), "allocated memory must be usable without a fault");
    let stats = sys.dmem_hw().stats();
    assert_eq!(stats.maps, 1);
    assert_eq!(stats.block_reads, 0, "fresh blocks carry no data worth reading");

    sys.dmem_hw_mut().write_bytes(addr, &[1, 2, 3, 4]).unwrap();
}

#[test]
fn growth_reads_partially_live_block() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    // TABLE has 0x200 live bytes; growing to 0x300 keeps the old blocks'
    // contents and adds one fresh block.
    let addr = sys.alloc(idx(TABLE), 0x100).unwrap();
    assert_eq!(addr, 0x1_0200);

    let stats = sys.dmem_hw().stats();
    assert_eq!(stats.block_reads, 2, "live blocks are read from the image");
    assert_eq!(stats.maps, 1, "the new block is only tagged");

    let mut live = vec![0; 0x200];
    sys.dmem_hw().read_bytes(0x1_0000, &mut live).unwrap();
    assert_eq!(live, image(0x1_0000, 0x200));
}

#[test]
fn allocation_within_mapped_block_moves_nothing() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    sys.alloc(idx(BUMP), 16).unwrap();
    let before = sys.dmem_hw().stats();
    sys.alloc(idx(BUMP), 16).unwrap();
    assert_eq!(sys.dmem_hw().stats(), before);
}

#[test]
fn calloc_zeroes_exactly_the_request() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    sys.dmem_hw_mut().write_bytes(0x0, &[0xAA; 16]).unwrap();

    let addr = sys.calloc(idx(HEAP), 10).unwrap();
    assert_eq!(addr, 0);

    let mut buf = [0u8; 16];
    sys.dmem_hw().read_bytes(0, &mut buf).unwrap();
    assert_eq!(&buf[..10], &[0; 10]);
    assert_eq!(&buf[10..], &[0xAA; 6], "bytes past the request are not touched");
}

#[test]
fn calloc_on_paged_overlay_zeroes_fresh_block() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    let addr = sys.calloc_aligned(idx(BUMP), 64, 32).unwrap();
    let mut buf = [0xFFu8; 64];
    sys.dmem_hw().read_bytes(addr, &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 0));
}

#[test]
fn resident_allocations_come_from_os_heap() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    assert_eq!(sys.alloc_resident(0x20, 16), Ok(0));
    assert_eq!(sys.alloc_resident(0x4, 16), Ok(0x20));
    assert_eq!(sys.free_bytes(idx(HEAP)), 0x200 - 0x24);
    assert_eq!(sys.dmem_hw().stats().maps, 0, "resident memory is never tagged");
}

// ── Boot-time only ──────────────────────────────────────────────────────────

#[test]
#[should_panic(expected = "after boot")]
fn allocation_after_block_halts() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    sys.alloc(idx(BUMP), 8).unwrap();
    sys.block_allocations();
    assert!(sys.allocations_blocked());
    let _ = sys.alloc(idx(BUMP), 8);
}

// ── Properties ──────────────────────────────────────────────────────────────

proptest::proptest! {
    #[test]
    fn allocations_never_overlap_and_respect_alignment(
        requests in proptest::collection::vec((1usize..96, 0u32..6), 1..40)
    ) {
        let lock = DmaLock::new();
        let (mut sys, _rig) = system(&lock);
        let base = 0x1_0400u32;
        let max = 0x400u32;
        let mut taken: Vec<(u32, u32)> = Vec::new();

        for (size, align_shift) in requests {
            let align = 1usize << align_shift;
            let before = size_current(&sys, BUMP);
            match sys.alloc_aligned(idx(BUMP), size, align) {
                Ok(ptr) => {
                    proptest::prop_assert_eq!(ptr % align as u32, 0, "misaligned pointer");
                    let end = ptr + size as u32;
                    proptest::prop_assert!(end <= base + max, "allocation beyond size_max");
                    for &(s, e) in &taken {
                        proptest::prop_assert!(end <= s || ptr >= e, "overlap with {:#x}..{:#x}", s, e);
                    }
                    taken.push((ptr, end));
                }
                Err(err) => {
                    proptest::prop_assert_eq!(err, AllocError::OutOfSpace);
                    proptest::prop_assert_eq!(size_current(&sys, BUMP), before);
                }
            }
        }
    }

    #[test]
    fn wrapping_requests_always_fail(size in (OvlSize::MAX as usize - 64)..=(OvlSize::MAX as usize)) {
        let lock = DmaLock::new();
        let (mut sys, _rig) = system(&lock);
        proptest::prop_assert!(sys.alloc_aligned(idx(BUMP), size, 128).is_err());
        proptest::prop_assert_eq!(size_current(&sys, BUMP), 0);
    }
}
