//! Tag-checked IMEM and DMEM models.

use std::cell::RefCell;
use std::rc::Rc;
use std::vec;
use std::vec::Vec;

use super::{SimExternal, SimLayout};
use crate::tag::{BlockState, DmemTagMemory, ImemTagMemory, MissFault, TagMemory, TagWord};

/// Transfer counters for one memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagStats {
    /// Blocks DMA'd in.
    pub block_reads: u32,
    /// Blocks written back.
    pub block_writes: u32,
    /// Tag-only mappings.
    pub maps: u32,
    /// Invalidations.
    pub invalidations: u32,
}

#[derive(Debug, Clone, Copy)]
struct SimBlock {
    tag: u32,
    state: BlockState,
    secure: bool,
}

const EMPTY: SimBlock = SimBlock {
    tag: 0,
    state: BlockState::Miss,
    secure: false,
};

/// Tag array plus backing store shared by both memory kinds.
struct TagCore {
    shift: u8,
    blocks: Vec<SimBlock>,
    data: Rc<RefCell<Vec<u8>>>,
    external: SimExternal,
    dma_base: u64,
    stats: TagStats,
}

impl TagCore {
    fn new(shift: u8, count: u16, external: SimExternal, dma_base: u64) -> Self {
        let bytes = usize::from(count) << shift;
        Self {
            shift,
            blocks: vec![EMPTY; usize::from(count)],
            data: Rc::new(RefCell::new(vec![0; bytes])),
            external,
            dma_base,
            stats: TagStats::default(),
        }
    }

    fn block_size(&self) -> usize {
        1 << self.shift
    }

    fn block_range(&self, block: u16) -> core::ops::Range<usize> {
        let start = usize::from(block) << self.shift;
        start..start + self.block_size()
    }

    fn lookup(&self, virt_tag: u32) -> TagWord {
        let mut hit: Option<(usize, SimBlock)> = None;
        let mut hits = 0;
        for (index, block) in self.blocks.iter().enumerate() {
            if block.state == BlockState::Miss || block.tag != virt_tag {
                continue;
            }
            hits += 1;
            let better = match hit {
                None => true,
                Some((_, prev)) => prev.state == BlockState::Invalid,
            };
            if better {
                hit = Some((index, *block));
            }
        }
        match hit {
            None => TagWord::miss(),
            Some((index, block)) => {
                let word = TagWord::mapped(index as u16, block.state, block.secure);
                if hits > 1 {
                    word.with_multi_hit()
                } else {
                    word
                }
            }
        }
    }

    fn block_status(&self, block: u16) -> TagWord {
        let b = self.blocks[usize::from(block)];
        TagWord::mapped(b.tag as u16, b.state, b.secure)
    }

    fn invalidate(&mut self, block: u16) {
        let b = &mut self.blocks[usize::from(block)];
        if b.state != BlockState::Miss {
            b.state = BlockState::Invalid;
        }
        self.stats.invalidations += 1;
    }

    fn map_block(&mut self, block: u16, virt_tag: u32) {
        self.blocks[usize::from(block)] = SimBlock {
            tag: virt_tag,
            state: BlockState::Clean,
            secure: false,
        };
        self.stats.maps += 1;
    }

    fn read_block(&mut self, block: u16, virt_tag: u32, ext_offset: u32, secure: bool) {
        let range = self.block_range(block);
        let addr = self.dma_base + u64::from(ext_offset);
        self.external
            .read(addr, &mut self.data.borrow_mut()[range]);
        self.blocks[usize::from(block)] = SimBlock {
            tag: virt_tag,
            state: BlockState::Clean,
            secure,
        };
        self.stats.block_reads += 1;
    }

    fn write_block(&mut self, block: u16, ext_offset: u32) {
        let range = self.block_range(block);
        let addr = self.dma_base + u64::from(ext_offset);
        self.external.write(addr, &self.data.borrow()[range]);
        let b = &mut self.blocks[usize::from(block)];
        if b.state == BlockState::Dirty {
            b.state = BlockState::Clean;
        }
        self.stats.block_writes += 1;
    }
}

macro_rules! delegate_tag_memory {
    ($ty:ty) => {
        impl TagMemory for $ty {
            fn block_count(&self) -> u16 {
                self.core.blocks.len() as u16
            }

            fn lookup(&self, virt_tag: u32) -> TagWord {
                self.core.lookup(virt_tag)
            }

            fn block_status(&self, block: u16) -> TagWord {
                self.core.block_status(block)
            }

            fn invalidate(&mut self, block: u16) {
                self.core.invalidate(block);
            }

            fn map_block(&mut self, block: u16, virt_tag: u32) {
                self.core.map_block(block, virt_tag);
            }

            fn read_block(&mut self, block: u16, virt_tag: u32, ext_offset: u32, secure: bool) {
                self.core.read_block(block, virt_tag, ext_offset, secure);
            }

            fn write_block(&mut self, block: u16, ext_offset: u32) {
                self.core.write_block(block, ext_offset);
            }

            fn dma_base(&self) -> u64 {
                self.core.dma_base
            }

            fn set_dma_base(&mut self, base: u64) {
                self.core.dma_base = base;
            }
        }
    };
}

// ─── IMEM ────────────────────────────────────────────────────────────────────

/// Simulated instruction memory.
pub struct SimImem {
    core: TagCore,
    secure_range: Option<(u32, u32)>,
    secure_arms: Vec<(u32, u32)>,
    debug_signed: bool,
}

impl SimImem {
    /// Build from a layout; the DMA base starts at the code image.
    #[must_use]
    pub fn new(layout: &SimLayout, external: SimExternal) -> Self {
        Self {
            core: TagCore::new(
                layout.block_shift,
                layout.imem_blocks,
                external,
                layout.imem_image_base(),
            ),
            secure_range: None,
            secure_arms: Vec::new(),
            debug_signed: true,
        }
    }

    /// Transfer counters.
    #[must_use]
    pub fn stats(&self) -> TagStats {
        self.core.stats
    }

    /// Contents of physical `block`.
    #[must_use]
    pub fn block_bytes(&self, block: u16) -> Vec<u8> {
        self.core.data.borrow()[self.core.block_range(block)].to_vec()
    }

    /// Currently armed secure range, if any.
    #[must_use]
    pub fn secure_range(&self) -> Option<(u32, u32)> {
        self.secure_range
    }

    /// Every range the secure register was armed with, in order.
    #[must_use]
    pub fn secure_arms(&self) -> &[(u32, u32)] {
        &self.secure_arms
    }

    /// Select debug (`true`) or production signing keys.
    pub fn set_debug_signed(&mut self, debug: bool) {
        self.debug_signed = debug;
    }

    /// Overwrite a block's tag state, e.g. to model a cleared valid bit.
    pub fn force_state(&mut self, block: u16, state: BlockState, secure: bool) {
        let b = &mut self.core.blocks[usize::from(block)];
        b.state = state;
        b.secure = secure;
    }
}

delegate_tag_memory!(SimImem);

impl ImemTagMemory for SimImem {
    fn arm_secure_range(&mut self, start_tag: u32, end_tag: u32) {
        self.secure_range = Some((start_tag, end_tag));
        self.secure_arms.push((start_tag, end_tag));
    }

    fn clear_secure_range(&mut self) {
        self.secure_range = None;
    }

    fn debug_signed(&self) -> bool {
        self.debug_signed
    }
}

// ─── DMEM ────────────────────────────────────────────────────────────────────

/// Simulated data memory.
///
/// Addresses below `resident_blocks << shift` are physical; addresses at or
/// above `va_base` are translated through the tags.
pub struct SimDmem {
    core: TagCore,
    resident_bytes: u32,
    va_base: u32,
}

impl SimDmem {
    /// Build from a layout; the DMA base starts at the data image.
    #[must_use]
    pub fn new(layout: &SimLayout, external: SimExternal) -> Self {
        Self {
            core: TagCore::new(
                layout.block_shift,
                layout.dmem_blocks,
                external,
                layout.dmem_image_base(),
            ),
            resident_bytes: u32::from(layout.dmem_resident_blocks) << layout.block_shift,
            va_base: layout.dmem_va_base,
        }
    }

    /// Handle to the physical backing store (shared with the DMA engine).
    #[must_use]
    pub fn physical(&self) -> Rc<RefCell<Vec<u8>>> {
        Rc::clone(&self.core.data)
    }

    /// Transfer counters.
    #[must_use]
    pub fn stats(&self) -> TagStats {
        self.core.stats
    }

    /// Contents of physical `block`.
    #[must_use]
    pub fn block_bytes(&self, block: u16) -> Vec<u8> {
        self.core.data.borrow()[self.core.block_range(block)].to_vec()
    }

    fn translate(&self, addr: u32) -> Result<usize, MissFault> {
        if addr < self.resident_bytes {
            return Ok(addr as usize);
        }
        if addr < self.va_base {
            return Err(MissFault { addr });
        }
        let tag = self.core.lookup(addr >> self.core.shift);
        if !tag.is_valid() {
            return Err(MissFault { addr });
        }
        let mask = (1u32 << self.core.shift) - 1;
        Ok(((u32::from(tag.index()) << self.core.shift) | (addr & mask)) as usize)
    }

    fn mark_dirty(&mut self, addr: u32) {
        if addr < self.va_base {
            return;
        }
        let tag = self.core.lookup(addr >> self.core.shift);
        if tag.is_valid() {
            self.core.blocks[usize::from(tag.index())].state = BlockState::Dirty;
        }
    }
}

delegate_tag_memory!(SimDmem);

impl DmemTagMemory for SimDmem {
    fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> Result<(), MissFault> {
        let data = self.core.data.borrow();
        for (i, slot) in buf.iter_mut().enumerate() {
            let a = addr + i as u32;
            *slot = data[self.translate(a)?];
        }
        Ok(())
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), MissFault> {
        for (i, &byte) in data.iter().enumerate() {
            let a = addr + i as u32;
            let phys = self.translate(a)?;
            self.core.data.borrow_mut()[phys] = byte;
            self.mark_dirty(a);
        }
        Ok(())
    }

    fn fill(&mut self, addr: u32, len: u32, value: u8) -> Result<(), MissFault> {
        for a in addr..addr + len {
            let phys = self.translate(a)?;
            self.core.data.borrow_mut()[phys] = value;
            self.mark_dirty(a);
        }
        Ok(())
    }
}
