//! IMEM overlay loader and instruction-miss handler.

use core::ops::Range;

use platform::{DmemTagMemory, ImemTagMemory};

use crate::error::LoadError;
use crate::index::OverlayIndex;
use crate::system::OverlaySystem;

/// Result of a miss-fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MissOutcome {
    /// A DMA suspension notice is pending; the faulting task must wait for
    /// the suspending task to resume DMA.
    Deferred,
    /// The faulting block was loaded into this physical block.
    Loaded {
        /// Physical block now holding the faulting address.
        block: u16,
    },
}

impl<I: ImemTagMemory, D: DmemTagMemory> OverlaySystem<'_, I, D> {
    /// Make every block of `ovl` resident in IMEM, protecting it from
    /// eviction while it loads.
    ///
    /// Returns the number of blocks transferred.
    pub fn imem_load_one(&mut self, ovl: OverlayIndex, secure: bool) -> Result<u32, LoadError> {
        let previous = self.imem.protect(ovl);
        let result = self.imem_load_overlay(ovl, secure);
        self.imem.unprotect(previous);
        result
    }

    /// Load every overlay in `list`.
    ///
    /// All entries move to the front of the MRU list first (the first one is
    /// protected from eviction), then each entry not already fully resident
    /// with the requested secure attribute is loaded. Stops at the first
    /// suspension.
    pub fn imem_load_list(
        &mut self,
        list: &[Option<OverlayIndex>],
        secure: bool,
    ) -> Result<u32, LoadError> {
        self.imem.move_to_front_all(list);
        let secure = secure && self.config.secure_overlays;
        let mut total = 0u32;
        for ovl in list.iter().flatten().copied() {
            if self.imem.is_loaded_as(ovl, secure) || self.imem.table.entry(ovl).resident {
                continue;
            }
            let count = self.imem_load_overlay(ovl, secure)?;
            total = total.saturating_add(count);
            self.imem.set_loaded_as(ovl, secure);
        }
        Ok(total)
    }

    /// Instruction-fetch miss at `pc`: load exactly one block.
    ///
    /// When the faulting instruction straddles a block boundary and the
    /// first block is present, the following block is the one loaded.
    /// Halts when the address lies outside the paged code region.
    pub fn imem_handle_miss(&mut self, pc: u32) -> MissOutcome {
        if self.lock.notice_pending() {
            return MissOutcome::Deferred;
        }
        let shift = self.imem.shift;
        let mut vtag = pc >> shift;
        if self.imem_hw.lookup(vtag).is_valid() {
            vtag = vtag.saturating_add(1);
        }
        let addr = u64::from(vtag) << shift;
        match self.imem.table.paged_region() {
            Some(region) if region.contains(&addr) => {}
            _ => halt!("IMEM miss at {} outside code region", pc),
        }
        let tag = self.imem_hw.lookup(vtag);
        let block = if tag.is_miss() {
            self.imem.round_robin_block(&mut self.imem_hw)
        } else {
            tag.index()
        };
        let offset = self.imem.ext_offset(vtag);
        self.imem_hw.read_block(block, vtag, offset, false);
        trace!("IMEM miss {} -> block {}", pc, block);
        MissOutcome::Loaded { block }
    }

    /// Load `ovl` with the secure range armed and the encrypted base in place
    /// when requested; both are undone on every exit.
    fn imem_load_overlay(&mut self, ovl: OverlayIndex, secure: bool) -> Result<u32, LoadError> {
        let span = self.imem.table.virtual_span(ovl, self.imem.shift);
        let secure = secure && self.config.secure_overlays;
        let saved_base = self.imem_hw.dma_base();
        if secure {
            self.imem_hw.arm_secure_range(span.start, span.end);
            if let Some(image) = self.imem.table.entry(ovl).secure {
                let offset = if self.imem_hw.debug_signed() {
                    image.enc_offset_debug
                } else {
                    image.enc_offset_prod
                };
                let Some(base) = saved_base.checked_add(u64::from(offset)) else {
                    halt!("IMEM overlay {} encrypted base overflows", ovl.get());
                };
                self.imem_hw.set_dma_base(base);
            }
        }

        let result = self.imem_load_tags(span, secure);

        if secure {
            self.imem_hw.clear_secure_range();
            self.imem_hw.set_dma_base(saved_base);
        }
        match result {
            Ok(count) => debug!("IMEM overlay {} loaded {} blocks", ovl.get(), count),
            Err(_) => debug!("IMEM overlay {} load suspended", ovl.get()),
        }
        result
    }

    fn imem_load_tags(&mut self, span: Range<u32>, secure: bool) -> Result<u32, LoadError> {
        let mut count = 0u32;
        for vtag in span.rev() {
            let tag = self.imem_hw.lookup(vtag);
            let stale = tag.is_miss() || (tag.is_invalid() && !tag.is_secure());
            let block = if stale {
                if self.lock.is_suspended() {
                    return Err(LoadError::Suspended);
                }
                if tag.is_miss() {
                    self.imem.find_block(&mut self.imem_hw)
                } else {
                    tag.index()
                }
            } else if tag.is_secure() != secure {
                // Mapped with the wrong attribute: re-read in place.
                if self.lock.is_suspended() {
                    return Err(LoadError::Suspended);
                }
                tag.index()
            } else {
                continue;
            };
            let offset = self.imem.ext_offset(vtag);
            self.imem_hw.read_block(block, vtag, offset, secure);
            count = count.saturating_add(1);
        }
        Ok(count)
    }
}
