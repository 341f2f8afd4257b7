//! IMEM/DMEM loaders, eviction order, secure loads, miss handlers and the
//! task-load step, on the shared simulated core.

#![allow(clippy::arithmetic_side_effects)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::panic)]

mod common;

use common::*;
use overlay::{
    AllocError, DmaLock, LoadError, MemClass, MissOutcome, OverlayDescriptor, OverlayTable,
    TaskOverlays,
};
use platform::{BlockState, DmemTagMemory, TagMemory};

fn on_demand() -> overlay::OverlayConfig {
    overlay::OverlayConfig {
        on_demand_paging: true,
        ..config()
    }
}

/// Physical IMEM block holding virtual block `vtag`, if valid.
fn imem_block(sys: &System<'_>, vtag: u32) -> Option<u16> {
    let word = sys.imem_hw().lookup(vtag);
    word.is_valid().then(|| word.index())
}

fn assert_imem_image(sys: &System<'_>, tags: core::ops::Range<u32>) {
    for vtag in tags {
        let block = imem_block(sys, vtag).unwrap_or_else(|| panic!("tag {vtag:#x} not resident"));
        assert_eq!(
            sys.imem_hw().block_bytes(block),
            image(u64::from(vtag) << 8, BLOCK as usize),
            "tag {vtag:#x}"
        );
    }
}

fn mru(sys: &System<'_>, class: MemClass) -> Vec<u8> {
    sys.mru_order(class).map(|ovl| ovl.get()).collect()
}

// ── IMEM loads ──────────────────────────────────────────────────────────────

#[test]
fn load_one_brings_in_every_block() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    assert_eq!(sys.imem_load_one(idx(A), false), Ok(4));
    assert_imem_image(&sys, 0x10..0x14);
    assert_eq!(mru(&sys, MemClass::Imem), vec![A]);

    assert_eq!(sys.imem_load_one(idx(A), false), Ok(0), "nothing left to load");
    assert_eq!(sys.imem_hw().stats().block_reads, 4);
}

#[test]
fn lru_overlay_is_evicted_from_its_last_block() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    for ovl in [A, B, C] {
        assert_eq!(sys.imem_load_list(&[Some(idx(ovl))], false), Ok(4));
    }
    let victim = imem_block(&sys, 0x13).unwrap();

    assert_eq!(sys.imem_load_list(&[Some(idx(E))], false), Ok(1));

    assert_eq!(imem_block(&sys, 0x40), Some(victim), "E took A's last block");
    assert_eq!(imem_block(&sys, 0x13), None);
    assert_imem_image(&sys, 0x10..0x13);
    assert!(!sys.is_loaded(MemClass::Imem, idx(A)));
    assert!(sys.is_loaded(MemClass::Imem, idx(B)));
    assert_eq!(mru(&sys, MemClass::Imem), vec![E, C, B]);
}

#[test]
fn listed_overlays_are_not_evicted_for_each_other() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    for ovl in [A, B, C] {
        sys.imem_load_list(&[Some(idx(ovl))], false).unwrap();
    }

    assert_eq!(sys.imem_load_list(&[Some(idx(E)), None, Some(idx(A))], false), Ok(1));

    assert!(sys.is_loaded(MemClass::Imem, idx(A)), "A was listed");
    assert!(!sys.is_loaded(MemClass::Imem, idx(B)), "B was the LRU");
    assert_eq!(imem_block(&sys, 0x23), None);
    assert_eq!(mru(&sys, MemClass::Imem), vec![A, E, C]);
}

#[test]
fn load_list_skips_loaded_overlays() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    assert_eq!(sys.imem_load_list(&[Some(idx(A)), Some(idx(E))], false), Ok(5));
    assert_eq!(sys.imem_load_list(&[Some(idx(E)), Some(idx(A))], false), Ok(0));
    assert_eq!(sys.imem_hw().stats().block_reads, 5);
}

#[test]
fn resident_overlays_are_never_loaded() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    assert_eq!(sys.imem_load_list(&[Some(idx(1))], false), Ok(0));
    assert!(mru(&sys, MemClass::Imem).is_empty());
}

#[test]
fn stale_block_is_reread_in_place() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    sys.imem_load_one(idx(A), false).unwrap();
    let block = imem_block(&sys, 0x11).unwrap();
    sys.imem_hw_mut().force_state(block, BlockState::Invalid, false);

    assert_eq!(sys.imem_load_one(idx(A), false), Ok(1));
    assert_eq!(imem_block(&sys, 0x11), Some(block));
}

#[test]
#[should_panic(expected = "being loaded")]
fn overlay_larger_than_imem_halts() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    let _ = sys.imem_load_one(idx(F), false);
}

#[test]
fn suspended_dma_aborts_before_any_transfer() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    assert!(lock.suspend(false).granted());
    assert_eq!(sys.imem_load_one(idx(A), false), Err(LoadError::Suspended));
    assert_eq!(sys.imem_hw().stats().block_reads, 0);

    assert!(lock.resume());
    assert_eq!(sys.imem_load_one(idx(A), false), Ok(4));
}

// ── HS (secure) code ────────────────────────────────────────────────────────

fn encrypted(len: usize) -> Vec<u8> {
    image(0x5000, len).into_iter().map(|b| !b).collect()
}

#[test]
fn secure_load_uses_encrypted_image_and_restores_state() {
    let lock = DmaLock::new();
    let (mut sys, rig) = system(&lock);
    let enc_base = rig.layout.imem_image_base() + u64::from(HS_ENC.enc_offset_debug);
    rig.external.write(enc_base + 0x5000, &encrypted(0x200));

    assert_eq!(sys.imem_load_list(&[Some(idx(HS))], true), Ok(2));

    let hw = sys.imem_hw();
    assert_eq!(hw.secure_arms(), &[(0x50, 0x52)]);
    assert_eq!(hw.secure_range(), None, "secure range cleared after the load");
    assert_eq!(hw.dma_base(), rig.layout.imem_image_base(), "base restored");
    for (i, vtag) in (0x50..0x52).enumerate() {
        let word = hw.lookup(vtag);
        assert!(word.is_valid() && word.is_secure());
        let expected = encrypted(0x200)[i * 256..(i + 1) * 256].to_vec();
        assert_eq!(hw.block_bytes(word.index()), expected);
    }
}

#[test]
fn production_keys_select_the_production_image() {
    let lock = DmaLock::new();
    let (mut sys, rig) = system(&lock);
    let enc_base = rig.layout.imem_image_base() + u64::from(HS_ENC.enc_offset_prod);
    rig.external.write(enc_base + 0x5000, &encrypted(0x200));
    sys.imem_hw_mut().set_debug_signed(false);

    sys.imem_load_one(idx(HS), true).unwrap();

    let block = imem_block(&sys, 0x50).unwrap();
    assert_eq!(sys.imem_hw().block_bytes(block), encrypted(0x100));
}

#[test]
fn wrong_secure_attribute_forces_reread() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    sys.imem_load_one(idx(HS), true).unwrap();
    let block = imem_block(&sys, 0x50).unwrap();

    assert_eq!(sys.imem_load_one(idx(HS), false), Ok(2));

    let word = sys.imem_hw().lookup(0x50);
    assert!(word.is_valid() && !word.is_secure());
    assert_eq!(word.index(), block, "re-read in place");
    assert_imem_image(&sys, 0x50..0x52);
}

#[test]
fn plain_list_load_is_reread_for_the_hs_list() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    assert_eq!(sys.imem_load_list(&[Some(idx(HS))], false), Ok(2));
    assert!(!sys.imem_hw().lookup(0x50).is_secure());

    assert_eq!(sys.imem_load_list(&[Some(idx(HS))], true), Ok(2));
    assert!(sys.imem_hw().lookup(0x50).is_secure());
    assert_eq!(sys.imem_load_list(&[Some(idx(HS))], true), Ok(0), "already secure");
}

#[test]
fn hs_list_load_is_reread_for_the_plain_list() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    assert_eq!(sys.imem_load_list(&[Some(idx(HS))], true), Ok(2));

    assert_eq!(sys.imem_load_list(&[Some(idx(HS))], false), Ok(2));
    let word = sys.imem_hw().lookup(0x50);
    assert!(word.is_valid() && !word.is_secure());
    assert_imem_image(&sys, 0x50..0x52);
}

#[test]
fn task_with_hs_in_both_lists_ends_secure() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    let mut task = TaskOverlays::new(1, 1, 0);
    assert!(sys.attach(&mut task, HS, MemClass::Imem, false));
    assert!(sys.attach(&mut task, HS, MemClass::Imem, true));

    assert_eq!(sys.load_task(&mut task, false), Ok(2 + 2));
    for vtag in 0x50..0x52 {
        assert!(sys.imem_hw().lookup(vtag).is_secure(), "hs list runs last");
    }
}

#[test]
fn secure_loads_can_be_disabled() {
    let lock = DmaLock::new();
    let plain = overlay::OverlayConfig {
        secure_overlays: false,
        ..config()
    };
    let (mut sys, _rig) = system_with(&lock, plain);
    sys.imem_load_one(idx(HS), true).unwrap();
    assert!(sys.imem_hw().secure_arms().is_empty());
    assert!(!sys.imem_hw().lookup(0x50).is_secure());
    assert_imem_image(&sys, 0x50..0x52);
}

// ── IMEM miss handler ───────────────────────────────────────────────────────

#[test]
fn miss_loads_one_block() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system_with(&lock, on_demand());
    assert_eq!(sys.imem_handle_miss(0x1010), MissOutcome::Loaded { block: 4 });
    assert_imem_image(&sys, 0x10..0x11);
    assert_eq!(sys.imem_hw().stats().block_reads, 1);
}

#[test]
fn straddling_instruction_loads_the_next_block() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system_with(&lock, on_demand());
    sys.imem_handle_miss(0x1010);
    assert_eq!(sys.imem_handle_miss(0x10FE), MissOutcome::Loaded { block: 5 });
    assert_imem_image(&sys, 0x11..0x12);
}

#[test]
fn miss_is_deferred_while_a_suspension_notice_is_pending() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system_with(&lock, on_demand());
    assert!(lock.suspend(false).granted());
    assert_eq!(sys.imem_handle_miss(0x1010), MissOutcome::Deferred);
    assert_eq!(sys.imem_hw().stats().block_reads, 0);
    assert!(lock.resume());
    assert!(matches!(sys.imem_handle_miss(0x1010), MissOutcome::Loaded { .. }));
}

#[test]
fn round_robin_wraps_to_the_first_pageable_block() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system_with(&lock, on_demand());
    for vtag in 0x60..0x6C {
        sys.imem_handle_miss(vtag << 8);
    }
    assert_eq!(sys.imem_handle_miss(0x6C00), MissOutcome::Loaded { block: 4 });
    assert_eq!(imem_block(&sys, 0x60), None, "oldest block stolen");
    assert_eq!(sys.imem_handle_miss(0x6D00), MissOutcome::Loaded { block: 5 });
    assert_imem_image(&sys, 0x62..0x6E);
}

#[test]
#[should_panic(expected = "outside code region")]
fn miss_in_resident_code_halts() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system_with(&lock, on_demand());
    sys.imem_handle_miss(0x0100);
}

#[test]
#[should_panic(expected = "outside code region")]
fn miss_past_the_paged_code_halts() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system_with(&lock, on_demand());
    sys.imem_handle_miss(0x7000);
}

// ── DMEM loads ──────────────────────────────────────────────────────────────

fn dmem_bytes(sys: &System<'_>, addr: u32, len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    sys.dmem_hw().read_bytes(addr, &mut buf).unwrap();
    buf
}

#[test]
fn dmem_load_reads_only_live_blocks() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    assert_eq!(sys.dmem_load_one(idx(TABLE)), Ok(2));
    assert_eq!(dmem_bytes(&sys, 0x1_0000, 0x200), image(0x1_0000, 0x200));
    assert!(!sys.dmem_hw().lookup(tag(0x1_0200)).is_valid(), "reserved tail untouched");
    assert_eq!(sys.dmem_load_one(idx(TABLE)), Ok(0));
}

#[test]
fn dirty_block_is_written_back_before_it_is_stolen() {
    let lock = DmaLock::new();
    let (mut sys, rig) = system(&lock);
    sys.dmem_load_list(&[Some(idx(TABLE))]).unwrap();
    sys.dmem_hw_mut().write_bytes(0x1_0010, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

    assert_eq!(sys.dmem_load_list(&[Some(idx(BUFFERS))]), Ok(6));
    assert_eq!(sys.dmem_load_list(&[Some(idx(BIG))]), Ok(8));

    assert_eq!(sys.dmem_hw().stats().block_writes, 1, "only the dirty block");
    assert_eq!(
        rig.external.to_vec(rig.layout.dmem_image_base() + 0x10, 4),
        vec![0xDE, 0xAD, 0xBE, 0xEF]
    );
    assert!(!sys.is_loaded(MemClass::Dmem, idx(TABLE)));

    assert_eq!(sys.dmem_load_list(&[Some(idx(TABLE))]), Ok(2));
    assert_eq!(dmem_bytes(&sys, 0x1_0010, 4), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(dmem_bytes(&sys, 0x1_1100, 0x800), image(0x1_1100, 0x800));
}

#[test]
fn dmem_load_aborts_while_suspended() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    assert!(lock.suspend(false).granted());
    assert_eq!(sys.dmem_load_one(idx(BUFFERS)), Err(LoadError::Suspended));
    assert!(lock.resume());
}

// ── Task stacks ─────────────────────────────────────────────────────────────

#[test]
fn stack_overlay_is_tagged_and_fully_used() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    let stack = sys.setup_stack(idx(STACK)).unwrap();
    assert_eq!(stack.base, 0x1_0800);
    assert_eq!(stack.depth, 128);

    let stats = sys.dmem_hw().stats();
    assert_eq!(stats.maps, 2);
    assert_eq!(stats.block_reads, 0, "a fresh stack is not read");
    assert!(sys.is_loaded(MemClass::Dmem, idx(STACK)));
    assert_eq!(sys.free_bytes(idx(STACK)), 0);
    assert_eq!(sys.alloc(idx(STACK), 4), Err(AllocError::OutOfSpace));

    sys.dmem_hw_mut().write_bytes(0x1_09FC, &[1, 2, 3, 4]).unwrap();
}

#[test]
#[cfg(not(feature = "ovl-size-16"))]
fn stack_deeper_than_the_depth_type_is_refused() {
    let lock = DmaLock::new();
    let dmem = OverlayTable::new(&[OverlayDescriptor::paged(DMEM_VA, 0, 0x4_0000)], 8).unwrap();
    let (mut sys, _rig) = system_with_tables(&lock, config(), imem_table(), dmem);
    assert_eq!(
        sys.setup_stack(idx(1)),
        Err(overlay::StackError::DepthOverflow)
    );
    assert_eq!(sys.dmem_hw().stats().maps, 0);
}

// ── DMEM miss handler ───────────────────────────────────────────────────────

#[test]
fn data_miss_loads_the_faulting_block() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    assert_eq!(sys.dmem_handle_miss(0x1_0A10), MissOutcome::Loaded { block: 4 });
    assert_eq!(dmem_bytes(&sys, 0x1_0A00, 0x100), image(0x1_0A00, 0x100));
    assert_eq!(sys.dmem_hw().stats().block_reads, 1);
}

#[test]
fn data_miss_is_deferred_while_a_suspension_notice_is_pending() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    assert!(lock.suspend(false).granted());
    assert_eq!(sys.dmem_handle_miss(0x1_0A10), MissOutcome::Deferred);
    assert!(lock.resume());
}

#[test]
#[should_panic(expected = "unpaged overlay")]
fn data_miss_in_the_heap_halts() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    sys.dmem_handle_miss(0x10);
}

#[test]
#[should_panic(expected = "unpaged overlay")]
fn data_miss_in_resident_data_halts() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    sys.dmem_handle_miss(0x250);
}

#[test]
#[should_panic(expected = "beyond live end")]
fn data_miss_past_the_live_end_halts() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    sys.dmem_handle_miss(0x1_0410);
}

#[test]
#[should_panic(expected = "outside every overlay")]
fn data_miss_outside_every_overlay_halts() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    sys.dmem_handle_miss(0x2_0000);
}

// ── Task-load step ──────────────────────────────────────────────────────────

fn worker(sys: &mut System<'_>) -> TaskOverlays {
    let mut task = TaskOverlays::new(2, 1, 2);
    assert!(sys.attach(&mut task, A, MemClass::Imem, false));
    assert!(sys.attach(&mut task, HS, MemClass::Imem, true));
    assert!(sys.attach(&mut task, TABLE, MemClass::Dmem, false));
    task
}

#[test]
fn task_load_brings_in_every_class() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    let mut task = worker(&mut sys);

    assert_eq!(sys.load_task(&mut task, false), Ok(4 + 2 + 2));
    assert!(task.reload_mask().is_empty());
    assert!(sys.imem_hw().lookup(0x50).is_secure(), "HS list loads secure");
    assert_eq!(lock.lock_count(), 0);

    let reads = sys.imem_hw().stats().block_reads;
    assert_eq!(sys.load_task(&mut task, true), Ok(0), "current task, nothing flagged");
    assert_eq!(sys.load_task(&mut task, false), Ok(0), "everything still resident");
    assert_eq!(sys.imem_hw().stats().block_reads, reads);
}

#[test]
fn suspended_task_load_keeps_the_reload_mask() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    let mut task = worker(&mut sys);
    sys.load_task(&mut task, false).unwrap();
    assert!(sys.attach(&mut task, B, MemClass::Imem, false));

    assert!(lock.suspend(false).granted());
    assert_eq!(sys.load_task(&mut task, true), Err(LoadError::Suspended));
    assert!(task.reload_mask().contains(overlay::ReloadMask::IMEM));
    assert_eq!(lock.lock_count(), 0, "lock released on the error path");

    assert!(lock.resume());
    assert_eq!(sys.load_task(&mut task, true), Ok(4));
    assert!(task.reload_mask().is_empty());
}

#[test]
fn suspension_is_refused_during_a_task_load() {
    let lock = DmaLock::new();
    let (mut sys, _rig) = system(&lock);
    let mut task = worker(&mut sys);
    let _guard = lock.guard();
    assert!(!lock.suspend(false).granted());
    assert_eq!(sys.load_task(&mut task, false), Ok(8));
    assert_eq!(lock.lock_count(), 1);
}
