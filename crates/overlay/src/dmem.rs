//! DMEM overlay loader, task stack setup and data-miss handler.
//!
//! Unlike IMEM, a DMEM block is only trusted when the hardware tag says
//! valid *and* the software tag-valid bitmap agrees: some cores keep a
//! stale valid tag on a block whose contents were just stolen.

use core::ops::Range;

use platform::{DmemTagMemory, ImemTagMemory, TagWord};

use crate::error::{LoadError, StackError};
use crate::imem::MissOutcome;
use crate::index::{OverlayIndex, OvlSize};
use crate::system::OverlaySystem;

/// Bytes per stack slot.
const STACK_WORD: OvlSize = 4;

/// Stack of a task whose stack lives in a DMEM overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskStack {
    /// Lowest virtual address of the stack.
    pub base: u32,
    /// Depth in stack words.
    pub depth: u16,
}

impl<I: ImemTagMemory, D: DmemTagMemory> OverlaySystem<'_, I, D> {
    /// Make every live block of `ovl` resident in DMEM, protecting it from
    /// eviction while it loads.
    ///
    /// Returns the number of blocks transferred.
    pub fn dmem_load_one(&mut self, ovl: OverlayIndex) -> Result<u32, LoadError> {
        let previous = self.dmem.protect(ovl);
        let result = self.dmem_load_overlay(ovl);
        self.dmem.unprotect(previous);
        result
    }

    /// Load every data overlay in `list`; see
    /// [`imem_load_list`](Self::imem_load_list).
    pub fn dmem_load_list(&mut self, list: &[Option<OverlayIndex>]) -> Result<u32, LoadError> {
        self.dmem.move_to_front_all(list);
        let mut total = 0u32;
        for ovl in list.iter().flatten().copied() {
            if self.dmem.is_loaded(ovl) || self.dmem.table.entry(ovl).resident {
                continue;
            }
            let count = self.dmem_load_overlay(ovl)?;
            total = total.saturating_add(count);
            self.dmem.set_loaded(ovl);
        }
        Ok(total)
    }

    /// Prepare `ovl` as a task stack before the task first runs.
    ///
    /// The whole overlay is marked used so the bump heap never hands out
    /// space from it, and its blocks are tagged in without any transfer:
    /// a fresh stack has no contents worth reading.
    pub fn setup_stack(&mut self, ovl: OverlayIndex) -> Result<TaskStack, StackError> {
        let desc = *self.dmem.table.entry(ovl);
        let words = desc.size_max.checked_div(STACK_WORD).unwrap_or(0);
        let depth = u16::try_from(words).map_err(|_| StackError::DepthOverflow)?;
        self.dmem.table.entry_mut(ovl).size_current = desc.size_max;
        if !desc.resident {
            let span = self.dmem.table.virtual_span(ovl, self.dmem.shift);
            let previous = self.dmem.protect(ovl);
            for vtag in span {
                self.dmem_tag_in(vtag, false);
            }
            self.dmem.unprotect(previous);
            self.dmem.set_loaded(ovl);
        }
        debug!("stack overlay {} depth {}", ovl.get(), depth);
        Ok(TaskStack {
            base: desc.virtual_start,
            depth,
        })
    }

    /// Data-access miss at `addr`: load exactly one block.
    ///
    /// Halts unless `addr` lies in the live part of a paged, non-heap
    /// overlay.
    pub fn dmem_handle_miss(&mut self, addr: u32) -> MissOutcome {
        if self.lock.notice_pending() {
            return MissOutcome::Deferred;
        }
        let Some(ovl) = self.dmem.table.find_by_address(addr) else {
            halt!("DMEM miss at {} outside every overlay", addr);
        };
        let desc = self.dmem.table.entry(ovl);
        if self.dmem.table.heap() == Some(ovl) || desc.resident {
            halt!("DMEM miss at {} in unpaged overlay {}", addr, ovl.get());
        }
        if u64::from(addr) >= desc.live_end() {
            halt!("DMEM miss at {} beyond live end of overlay {}", addr, ovl.get());
        }

        let vtag = addr >> self.dmem.shift;
        let tag = self.dmem_hw.lookup(vtag);
        let block = if tag.is_miss() {
            self.dmem.round_robin_block(&mut self.dmem_hw)
        } else {
            self.dmem_reclaim(vtag, tag)
        };
        let offset = self.dmem.ext_offset(vtag);
        self.dmem_hw.read_block(block, vtag, offset, false);
        self.dmem.tag_valid.set(vtag);
        trace!("DMEM miss {} -> block {}", addr, block);
        MissOutcome::Loaded { block }
    }

    fn dmem_load_overlay(&mut self, ovl: OverlayIndex) -> Result<u32, LoadError> {
        let span = self.dmem.table.virtual_span(ovl, self.dmem.shift);
        let result = self.dmem_load_tags(span);
        match result {
            Ok(count) => debug!("DMEM overlay {} loaded {} blocks", ovl.get(), count),
            Err(_) => debug!("DMEM overlay {} load suspended", ovl.get()),
        }
        result
    }

    fn dmem_load_tags(&mut self, span: Range<u32>) -> Result<u32, LoadError> {
        let mut count = 0u32;
        for vtag in span.rev() {
            if self.dmem_resident(vtag) {
                continue;
            }
            if self.lock.is_suspended() {
                return Err(LoadError::Suspended);
            }
            self.dmem_tag_in(vtag, true);
            count = count.saturating_add(1);
        }
        Ok(count)
    }

    /// `true` when `vtag` is backed by a block both the hardware and the
    /// tag-valid bitmap agree on.
    pub(crate) fn dmem_resident(&self, vtag: u32) -> bool {
        self.dmem_hw.lookup(vtag).is_valid() && self.dmem.tag_valid.test(vtag)
    }

    /// Back `vtag` with a block, reading the image when `read` is set and
    /// only tagging otherwise. Returns `false` when it was already resident.
    pub(crate) fn dmem_tag_in(&mut self, vtag: u32, read: bool) -> bool {
        let tag = self.dmem_hw.lookup(vtag);
        if tag.is_valid() && self.dmem.tag_valid.test(vtag) {
            return false;
        }
        let block = if tag.is_miss() {
            self.dmem.find_block(&mut self.dmem_hw)
        } else {
            self.dmem_reclaim(vtag, tag)
        };
        if read {
            let offset = self.dmem.ext_offset(vtag);
            self.dmem_hw.read_block(block, vtag, offset, false);
        } else {
            self.dmem_hw.map_block(block, vtag);
        }
        self.dmem.tag_valid.set(vtag);
        true
    }

    /// Reuse the block already tagged for `vtag`, flushing it first if the
    /// hardware holds unsaved data.
    fn dmem_reclaim(&mut self, vtag: u32, tag: TagWord) -> u16 {
        let block = tag.index();
        if tag.is_dirty() {
            trace!("writeback block {} tag {}", block, vtag);
            let offset = self.dmem.ext_offset(vtag);
            self.dmem_hw.write_block(block, offset);
        }
        block
    }
}
