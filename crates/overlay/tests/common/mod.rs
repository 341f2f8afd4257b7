//! Shared fixture: a small simulated core with a representative set of
//! code and data overlays.
//!
//! ```text
//! IMEM (16 blocks, 4 resident)        DMEM (16 blocks, 4 resident, window 0x1_0000)
//!  1  resident 0x0000  0x400           1  heap      0x0_0000  0     / 0x200  (resident)
//!  2  A        0x1000  0x400           2  scratch   0x0_0200  0x100  (resident)
//!  3  B        0x2000  0x400           3  table     0x1_0000  0x200 / 0x400
//!  4  C        0x3000  0x400           4  bump      0x1_0400  0     / 0x400
//!  5  E        0x4000  0x100           5  stack     0x1_0800  0     / 0x200
//!  6  HS       0x5000  0x200 (secure)  6  buffers   0x1_0A00  0x600
//!  7  F        0x6000  0x1000          7  small     0x1_1000  0     / 0x100
//!                                      8  big       0x1_1100  0x800
//! ```

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::cast_possible_truncation)]

use overlay::{
    ClassLayout, DmaConfig, DmaLock, OverlayConfig, OverlayDescriptor, OverlayIndex,
    OverlaySystem, OverlayTable, SecureImage,
};
use platform::sim::{SimDma, SimDmem, SimExternal, SimFalcon, SimImem, SimLayout};

pub type System<'a> = OverlaySystem<'a, SimImem, SimDmem>;

pub const BLOCK: u32 = 256;
pub const DMEM_VA: u32 = 0x1_0000;

pub const A: u8 = 2;
pub const B: u8 = 3;
pub const C: u8 = 4;
pub const E: u8 = 5;
pub const HS: u8 = 6;
pub const F: u8 = 7;

pub const HEAP: u8 = 1;
pub const SCRATCH: u8 = 2;
pub const TABLE: u8 = 3;
pub const BUMP: u8 = 4;
pub const STACK: u8 = 5;
pub const BUFFERS: u8 = 6;
pub const SMALL: u8 = 7;
pub const BIG: u8 = 8;

/// Encrypted HS image offsets from the plain image.
pub const HS_ENC: SecureImage = SecureImage {
    enc_offset_debug: 0x2_0000,
    enc_offset_prod: 0x3_0000,
};

pub fn idx(raw: u8) -> OverlayIndex {
    OverlayIndex::new(raw).unwrap()
}

pub fn layout() -> SimLayout {
    SimLayout::small()
}

pub fn config() -> OverlayConfig {
    OverlayConfig {
        block_shift: 8,
        imem: ClassLayout {
            block_count: 16,
            first_pageable: 4,
            va_base: 0,
        },
        dmem: ClassLayout {
            block_count: 16,
            first_pageable: 4,
            va_base: DMEM_VA,
        },
        dma: DmaConfig::falcon_default(),
        on_demand_paging: false,
        secure_overlays: true,
    }
}

pub fn imem_table() -> OverlayTable {
    OverlayTable::new(
        &[
            OverlayDescriptor::resident(0x0000, 0x400, 0x400),
            OverlayDescriptor::paged(0x1000, 0x400, 0x400),
            OverlayDescriptor::paged(0x2000, 0x400, 0x400),
            OverlayDescriptor::paged(0x3000, 0x400, 0x400),
            OverlayDescriptor::paged(0x4000, 0x100, 0x100),
            OverlayDescriptor::paged(0x5000, 0x200, 0x200).with_secure(HS_ENC),
            OverlayDescriptor::paged(0x6000, 0x1000, 0x1000),
        ],
        8,
    )
    .unwrap()
}

pub fn dmem_table() -> OverlayTable {
    OverlayTable::new(
        &[
            OverlayDescriptor::resident(0x0000, 0, 0x200),
            OverlayDescriptor::resident(0x0200, 0x100, 0x100),
            OverlayDescriptor::paged(0x1_0000, 0x200, 0x400),
            OverlayDescriptor::paged(0x1_0400, 0, 0x400),
            OverlayDescriptor::paged(0x1_0800, 0, 0x200),
            OverlayDescriptor::paged(0x1_0A00, 0x600, 0x600),
            OverlayDescriptor::paged(0x1_1000, 0, 0x100),
            OverlayDescriptor::paged(0x1_1100, 0x800, 0x800),
        ],
        8,
    )
    .unwrap()
    .with_heap(idx(HEAP))
    .unwrap()
}

/// Byte stored at `addr` of a test image; distinct per block.
pub fn pattern(addr: u64) -> u8 {
    (addr ^ (addr >> 8) ^ 0x5A) as u8
}

pub fn image(start: u64, len: usize) -> Vec<u8> {
    (0..len as u64).map(|i| pattern(start + i)).collect()
}

/// Fill both external images with [`pattern`], keyed by virtual address.
pub fn seed_images(external: &SimExternal, layout: &SimLayout) {
    external.write(layout.imem_image_base(), &image(0, 0x8000));
    let dmem: Vec<u8> = (0..0x2000u64).map(|i| pattern(u64::from(DMEM_VA) + i)).collect();
    external.write(layout.dmem_image_base(), &dmem);
}

/// Everything a test needs besides the system itself.
pub struct Rig {
    pub external: SimExternal,
    pub dma: SimDma,
    pub layout: SimLayout,
}

/// Build a seeded core and an overlay system over it.
pub fn system_with(lock: &DmaLock, config: OverlayConfig) -> (System<'_>, Rig) {
    system_with_tables(lock, config, imem_table(), dmem_table())
}

pub fn system_with_tables(
    lock: &DmaLock,
    config: OverlayConfig,
    imem: OverlayTable,
    dmem: OverlayTable,
) -> (System<'_>, Rig) {
    let layout = layout();
    let core = SimFalcon::new(layout);
    seed_images(&core.external, &layout);
    let sys = OverlaySystem::new(config, core.imem, core.dmem, imem, dmem, lock).unwrap();
    let rig = Rig {
        external: core.external,
        dma: core.dma,
        layout,
    };
    (sys, rig)
}

pub fn system(lock: &DmaLock) -> (System<'_>, Rig) {
    system_with(lock, config())
}

/// Virtual tag of byte address `addr`.
pub fn tag(addr: u32) -> u32 {
    addr >> 8
}
