//! Host-side simulation of a Falcon core's memory system.
//!
//! Provides tag-checked IMEM/DMEM, a DMA engine with optional NACK
//! injection, an external memory image and a scriptable scheduler, so the
//! overlay subsystem can be exercised by `cargo test` without hardware.
//!
//! The simulator favours observability over speed: every block transfer and
//! burst is counted or recorded for assertions.

// Host-only test double: panicking on out-of-range indices is the intended
// failure mode for a broken test.
#![allow(clippy::indexing_slicing)]
#![allow(clippy::arithmetic_side_effects)]
#![allow(clippy::panic)]
#![allow(clippy::cast_possible_truncation)]

mod dma;
mod memory;
mod scheduler;

use std::cell::RefCell;
use std::rc::Rc;
use std::vec;
use std::vec::Vec;

pub use dma::SimDma;
pub use memory::{SimDmem, SimImem, TagStats};
pub use scheduler::SimScheduler;

/// Shared, simulated external memory (FB/SYSMEM).
#[derive(Clone)]
pub struct SimExternal {
    base: u64,
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl SimExternal {
    /// Create `size` zeroed bytes starting at bus address `base`.
    #[must_use]
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            bytes: Rc::new(RefCell::new(vec![0; size])),
        }
    }

    /// Bus address of the first byte.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    fn offset_of(&self, addr: u64, len: usize) -> usize {
        let offset = addr
            .checked_sub(self.base)
            .unwrap_or_else(|| panic!("external access below base: 0x{addr:X}"));
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let size = self.bytes.borrow().len();
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= size),
            "external access out of range: 0x{addr:X}+{len}"
        );
        offset
    }

    /// Copy bytes out of external memory.
    pub fn read(&self, addr: u64, buf: &mut [u8]) {
        let offset = self.offset_of(addr, buf.len());
        buf.copy_from_slice(&self.bytes.borrow()[offset..offset + buf.len()]);
    }

    /// Copy bytes into external memory.
    pub fn write(&self, addr: u64, data: &[u8]) {
        let offset = self.offset_of(addr, data.len());
        self.bytes.borrow_mut()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Owned copy of `len` bytes at `addr`.
    #[must_use]
    pub fn to_vec(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        self.read(addr, &mut out);
        out
    }
}

/// Geometry of the simulated core.
#[derive(Debug, Clone, Copy)]
pub struct SimLayout {
    /// log2 of the block size.
    pub block_shift: u8,
    /// Physical IMEM blocks.
    pub imem_blocks: u16,
    /// Physical DMEM blocks.
    pub dmem_blocks: u16,
    /// DMEM blocks below the paging window, addressed physically.
    pub dmem_resident_blocks: u16,
    /// First virtual DMEM address (start of the paging window).
    pub dmem_va_base: u32,
    /// Bus address of external memory.
    pub external_base: u64,
    /// External memory size in bytes.
    pub external_size: usize,
    /// Offset of the code image inside external memory.
    pub imem_image_offset: u64,
    /// Offset of the data image inside external memory.
    pub dmem_image_offset: u64,
    /// DMA engine reports NACKs.
    pub nack_supported: bool,
}

impl SimLayout {
    /// A small core: 16 IMEM blocks, 16 DMEM blocks (4 resident), 256-byte
    /// blocks, 1 MiB of external memory.
    #[must_use]
    pub const fn small() -> Self {
        Self {
            block_shift: 8,
            imem_blocks: 16,
            dmem_blocks: 16,
            dmem_resident_blocks: 4,
            dmem_va_base: 0x1_0000,
            external_base: 0x8000_0000,
            external_size: 1 << 20,
            imem_image_offset: 0,
            dmem_image_offset: 0x8_0000,
            nack_supported: false,
        }
    }

    /// Bus address the IMEM DMA base register starts at.
    #[must_use]
    pub const fn imem_image_base(&self) -> u64 {
        self.external_base + self.imem_image_offset
    }

    /// Bus address the DMEM DMA base register starts at.
    #[must_use]
    pub const fn dmem_image_base(&self) -> u64 {
        self.external_base + self.dmem_image_offset
    }
}

/// A complete simulated core, split into independently owned parts.
pub struct SimFalcon {
    /// Instruction memory.
    pub imem: SimImem,
    /// Data memory.
    pub dmem: SimDmem,
    /// DMA engine.
    pub dma: SimDma,
    /// External memory shared by all of the above.
    pub external: SimExternal,
}

impl SimFalcon {
    /// Build a core with the given geometry.
    #[must_use]
    pub fn new(layout: SimLayout) -> Self {
        let external = SimExternal::new(layout.external_base, layout.external_size);
        let imem = SimImem::new(&layout, external.clone());
        let dmem = SimDmem::new(&layout, external.clone());
        let dma = SimDma::new(dmem.physical(), external.clone(), layout.nack_supported);
        Self {
            imem,
            dmem,
            dma,
            external,
        }
    }
}
