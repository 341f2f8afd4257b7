//! Per-overlay bump allocator.
//!
//! Each DMEM overlay reserves `size_max` bytes and has `size_current` of
//! them live. Allocation rounds the live end up to the requested alignment
//! and appends; nothing is ever freed. Every step is checked in the overlay
//! size type, so a request that would wrap fails instead of corrupting
//! `size_current`.
//!
//! Allocation is a boot-time activity. Once
//! [`block_allocations`](OverlaySystem::block_allocations) has been called
//! any further request halts.

use platform::{DmemTagMemory, ImemTagMemory};

use crate::descriptor::tag_span;
use crate::error::AllocError;
use crate::index::{OverlayIndex, OvlSize};
use crate::system::OverlaySystem;

/// Alignment used by the unaligned entry points.
pub const DEFAULT_ALIGN: usize = 4;

/// Compute `(offset, new_size_current)` for an allocation of `size` bytes
/// aligned to `align` in an overlay with `size_current` of `size_max` used.
///
/// `size` is rounded up to `align`; the rounded size must be non-zero.
pub fn plan(
    size_current: OvlSize,
    size_max: OvlSize,
    size: usize,
    align: usize,
    block_size: u32,
) -> Result<(OvlSize, OvlSize), AllocError> {
    let max_align = usize::try_from(block_size).unwrap_or(usize::MAX);
    if !align.is_power_of_two() || align > max_align {
        return Err(AllocError::InvalidArgument);
    }
    let size = OvlSize::try_from(size).map_err(|_| AllocError::InvalidArgument)?;
    let align = OvlSize::try_from(align).map_err(|_| AllocError::InvalidArgument)?;
    let mask = align.wrapping_sub(1);

    let size = size.checked_add(mask).ok_or(AllocError::Overflow)? & !mask;
    if size == 0 {
        return Err(AllocError::InvalidArgument);
    }
    let offset = size_current.checked_add(mask).ok_or(AllocError::Overflow)? & !mask;
    let end = offset.checked_add(size).ok_or(AllocError::Overflow)?;
    if end > size_max {
        return Err(AllocError::OutOfSpace);
    }
    Ok((offset, end))
}

impl<I: ImemTagMemory, D: DmemTagMemory> OverlaySystem<'_, I, D> {
    /// Allocate `size` bytes from DMEM overlay `ovl`, 4-byte aligned.
    pub fn alloc(&mut self, ovl: OverlayIndex, size: usize) -> Result<u32, AllocError> {
        self.alloc_aligned(ovl, size, DEFAULT_ALIGN)
    }

    /// Allocate `size` bytes from DMEM overlay `ovl` at a multiple of
    /// `align`.
    ///
    /// For a paged overlay, blocks newly covered by the live region are
    /// tagged in right away so the memory is usable without a fault.
    pub fn alloc_aligned(
        &mut self,
        ovl: OverlayIndex,
        size: usize,
        align: usize,
    ) -> Result<u32, AllocError> {
        if self.allocations_blocked {
            halt!("allocation from DMEM overlay {} after boot", ovl.get());
        }
        let desc = *self.dmem.table.entry(ovl);
        let (offset, end) = plan(
            desc.size_current,
            desc.size_max,
            size,
            align,
            self.config.block_size(),
        )
        .inspect_err(|err| warn!("overlay {} alloc of {} failed: {}", ovl.get(), size, err))?;
        let addr = desc
            .virtual_start
            .checked_add(u32::from(offset))
            .ok_or(AllocError::Overflow)?;

        if !desc.resident && self.dmem.table.heap() != Some(ovl) {
            self.tag_in_growth(ovl, desc.virtual_start, desc.size_current, end);
        }
        self.dmem.table.entry_mut(ovl).size_current = end;
        trace!("overlay {} alloc {} at {}", ovl.get(), size, addr);
        Ok(addr)
    }

    /// [`alloc`](Self::alloc), then zero exactly `size` bytes.
    pub fn calloc(&mut self, ovl: OverlayIndex, size: usize) -> Result<u32, AllocError> {
        self.calloc_aligned(ovl, size, DEFAULT_ALIGN)
    }

    /// [`alloc_aligned`](Self::alloc_aligned), then zero exactly `size`
    /// bytes.
    pub fn calloc_aligned(
        &mut self,
        ovl: OverlayIndex,
        size: usize,
        align: usize,
    ) -> Result<u32, AllocError> {
        let addr = self.alloc_aligned(ovl, size, align)?;
        // Fits: plan() accepted it in the overlay size type.
        let len = u32::try_from(size).unwrap_or(u32::MAX);
        if let Err(fault) = self.dmem_hw.fill(addr, len, 0) {
            halt!("zeroing allocation faulted at {}", fault.addr);
        }
        Ok(addr)
    }

    /// Allocate from the resident OS heap overlay.
    pub fn alloc_resident(&mut self, size: usize, align: usize) -> Result<u32, AllocError> {
        let Some(heap) = self.dmem.table.heap() else {
            halt!("no OS heap overlay designated");
        };
        self.alloc_aligned(heap, size, align)
    }

    /// Bytes still available in DMEM overlay `ovl`.
    pub fn free_bytes(&self, ovl: OverlayIndex) -> OvlSize {
        self.dmem.table.entry(ovl).free_bytes()
    }

    /// Forbid further bump allocation. Called once boot-time setup is done.
    pub fn block_allocations(&mut self) {
        self.allocations_blocked = true;
        info!("bump allocations blocked");
    }

    /// `true` after [`block_allocations`](Self::block_allocations).
    pub fn allocations_blocked(&self) -> bool {
        self.allocations_blocked
    }

    /// Tag in the blocks the live region grows into. The block that held the
    /// old live end keeps its contents, so it is read; blocks past it are
    /// fresh and only tagged.
    fn tag_in_growth(&mut self, ovl: OverlayIndex, start: u32, old: OvlSize, new: OvlSize) {
        let start = u64::from(start);
        let shift = self.dmem.shift;
        let old_span = tag_span(start, start.saturating_add(u64::from(old)), shift);
        let new_span = tag_span(start, start.saturating_add(u64::from(new)), shift);
        let previous = self.dmem.protect(ovl);
        for vtag in new_span {
            self.dmem_tag_in(vtag, vtag < old_span.end);
        }
        self.dmem.unprotect(previous);
    }
}
