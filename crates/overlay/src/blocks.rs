//! Per-class paging state and physical block selection.
//!
//! Two replacement policies share this state:
//!
//! - **MRU** (pinned overlays): never-used blocks first, then blocks of the
//!   least recently used overlay, reclaimed from its last virtual block
//!   backwards.
//! - **Round-robin** (on-demand paging): never-used blocks first, then a
//!   cursor sweeping the pageable blocks.
//!
//! Either way a dirty DMEM block is written back before it is handed out.

use platform::TagMemory;

use crate::config::{ClassLayout, MAX_VIRT_BLOCKS};
use crate::descriptor::OverlayTable;
use crate::index::{MemClass, OverlayIndex};
use crate::mru::{MruList, RecycleTracker};

const VALID_WORDS: usize = (MAX_VIRT_BLOCKS / 32) as usize;

/// Software copy of "this virtual DMEM block is really backed".
///
/// Some cores report a stale valid tag for a block that was just stolen;
/// the loaders trust a tag only when this bitmap agrees.
#[derive(Debug, Clone)]
pub(crate) struct TagValidMap {
    base_tag: u32,
    words: [u32; VALID_WORDS],
}

impl TagValidMap {
    fn new(base_tag: u32) -> Self {
        Self {
            base_tag,
            words: [0; VALID_WORDS],
        }
    }

    fn locate(&self, vtag: u32) -> Option<(usize, u32)> {
        let rel = vtag.checked_sub(self.base_tag)?;
        if rel >= MAX_VIRT_BLOCKS {
            return None;
        }
        #[allow(clippy::arithmetic_side_effects)] // Safety: rel < MAX_VIRT_BLOCKS
        Some(((rel / 32) as usize, 1u32 << (rel % 32)))
    }

    pub(crate) fn set(&mut self, vtag: u32) {
        if let Some((word, bit)) = self.locate(vtag) {
            if let Some(w) = self.words.get_mut(word) {
                *w |= bit;
            }
        }
    }

    pub(crate) fn clear(&mut self, vtag: u32) {
        if let Some((word, bit)) = self.locate(vtag) {
            if let Some(w) = self.words.get_mut(word) {
                *w &= !bit;
            }
        }
    }

    pub(crate) fn test(&self, vtag: u32) -> bool {
        self.locate(vtag)
            .and_then(|(word, bit)| self.words.get(word).map(|w| w & bit != 0))
            .unwrap_or(false)
    }
}

/// Paging bookkeeping for one memory class.
#[derive(Debug, Clone)]
pub(crate) struct ClassState {
    pub(crate) class: MemClass,
    pub(crate) layout: ClassLayout,
    pub(crate) shift: u8,
    pub(crate) on_demand: bool,
    pub(crate) table: OverlayTable,
    pub(crate) mru: MruList,
    pub(crate) recycle: RecycleTracker,
    free_cursor: u16,
    rr_cursor: u16,
    loaded: u64,
    loaded_secure: u64,
    pub(crate) tag_valid: TagValidMap,
}

impl ClassState {
    pub(crate) fn new(
        class: MemClass,
        layout: ClassLayout,
        shift: u8,
        on_demand: bool,
        table: OverlayTable,
    ) -> Self {
        Self {
            class,
            layout,
            shift,
            on_demand,
            mru: MruList::new(table.count()),
            table,
            recycle: RecycleTracker::default(),
            free_cursor: layout.first_pageable,
            rr_cursor: layout.first_pageable,
            loaded: 0,
            loaded_secure: 0,
            tag_valid: TagValidMap::new(layout.va_base >> shift),
        }
    }

    // ── Loaded bitmap ───────────────────────────────────────────────────────

    // Plain and secure loads are tracked apart: a block loaded with one
    // attribute must be re-read before it runs with the other.

    pub(crate) fn is_loaded(&self, ovl: OverlayIndex) -> bool {
        (self.loaded | self.loaded_secure) & ovl.bit() != 0
    }

    pub(crate) fn is_loaded_as(&self, ovl: OverlayIndex, secure: bool) -> bool {
        let map = if secure { self.loaded_secure } else { self.loaded };
        map & ovl.bit() != 0
    }

    pub(crate) fn set_loaded(&mut self, ovl: OverlayIndex) {
        self.set_loaded_as(ovl, false);
    }

    pub(crate) fn set_loaded_as(&mut self, ovl: OverlayIndex, secure: bool) {
        if secure {
            self.loaded_secure |= ovl.bit();
            self.loaded &= !ovl.bit();
        } else {
            self.loaded |= ovl.bit();
            self.loaded_secure &= !ovl.bit();
        }
    }

    pub(crate) fn clear_loaded(&mut self, ovl: OverlayIndex) {
        self.loaded &= !ovl.bit();
        self.loaded_secure &= !ovl.bit();
    }

    // ── Address helpers ─────────────────────────────────────────────────────

    /// Byte offset of `vtag` inside the external image.
    pub(crate) fn ext_offset(&self, vtag: u32) -> u32 {
        let addr = vtag.checked_shl(u32::from(self.shift)).unwrap_or(0);
        match addr.checked_sub(self.layout.va_base) {
            Some(offset) => offset,
            None => halt!("virtual block {} below paged window", vtag),
        }
    }

    /// Overlay owning virtual block `vtag`.
    fn owner(&self, vtag: u32) -> Option<OverlayIndex> {
        self.table
            .find_by_address(vtag.checked_shl(u32::from(self.shift))?)
    }

    // ── MRU maintenance ─────────────────────────────────────────────────────

    /// Mark `ovl` most recently used. No-op for resident overlays and under
    /// on-demand paging.
    pub(crate) fn move_to_front(&mut self, ovl: OverlayIndex) {
        if self.on_demand || self.table.entry(ovl).resident {
            return;
        }
        if !self.mru.contains(ovl) && self.recycle.candidate == Some(ovl) {
            // About to become resident again: stop reclaiming it.
            self.recycle.cancel();
        }
        self.mru.push_front(ovl);
    }

    /// Move every listed overlay to the front and protect the first one.
    pub(crate) fn move_to_front_all(&mut self, list: &[Option<OverlayIndex>]) {
        self.recycle.do_not_recycle = None;
        for ovl in list.iter().flatten() {
            self.move_to_front(*ovl);
            if self.recycle.do_not_recycle.is_none() {
                self.recycle.do_not_recycle = Some(*ovl);
            }
        }
    }

    /// Move `ovl` to the front and protect it, returning the previous
    /// protection for [`unprotect`](Self::unprotect).
    pub(crate) fn protect(&mut self, ovl: OverlayIndex) -> Option<OverlayIndex> {
        self.move_to_front(ovl);
        self.recycle.do_not_recycle.replace(ovl)
    }

    pub(crate) fn unprotect(&mut self, previous: Option<OverlayIndex>) {
        self.recycle.do_not_recycle = previous;
    }

    // ── Block selection ─────────────────────────────────────────────────────

    /// Pick a physical block for the active policy, already detached from
    /// whatever it held.
    pub(crate) fn find_block<T: TagMemory>(&mut self, hw: &mut T) -> u16 {
        if self.on_demand {
            self.round_robin_block(hw)
        } else {
            self.find_best_block(hw)
        }
    }

    fn take_free(&mut self) -> Option<u16> {
        if self.free_cursor >= self.layout.block_count {
            return None;
        }
        let block = self.free_cursor;
        self.free_cursor = block.saturating_add(1);
        Some(block)
    }

    /// MRU policy.
    pub(crate) fn find_best_block<T: TagMemory>(&mut self, hw: &mut T) -> u16 {
        if let Some(block) = self.take_free() {
            return block;
        }
        loop {
            let Some(vtag) = self.recycle.pop_back() else {
                self.next_candidate();
                continue;
            };
            let tag = hw.lookup(vtag);
            if tag.is_miss() {
                continue;
            }
            let block = tag.index();
            self.release(hw, block, vtag, tag.is_dirty());
            return block;
        }
    }

    /// Start reclaiming the least recently used overlay.
    fn next_candidate(&mut self) {
        let Some(lru) = self.mru.lru() else {
            halt!("{} eviction: no overlay left to reclaim", self.class);
        };
        if self.recycle.do_not_recycle == Some(lru) {
            halt!("{} eviction: LRU overlay {} is being loaded", self.class, lru.get());
        }
        self.mru.remove(lru);
        self.clear_loaded(lru);
        let span = self.table.virtual_span(lru, self.shift);
        debug!("evicting overlay {} tags {}..{}", lru.get(), span.start, span.end);
        self.recycle.start(lru, span);
    }

    /// Round-robin policy.
    pub(crate) fn round_robin_block<T: TagMemory>(&mut self, hw: &mut T) -> u16 {
        if let Some(block) = self.take_free() {
            return block;
        }
        let block = self.rr_cursor;
        self.rr_cursor = match block.checked_add(1) {
            Some(next) if next < self.layout.block_count => next,
            _ => self.layout.first_pageable,
        };
        let status = hw.block_status(block);
        if !status.is_miss() {
            let vtag = u32::from(status.index());
            if let Some(owner) = self.owner(vtag) {
                self.clear_loaded(owner);
            }
            self.release(hw, block, vtag, status.is_dirty());
        }
        block
    }

    /// Detach `block` from `vtag`: write back if dirty, then invalidate.
    fn release<T: TagMemory>(&mut self, hw: &mut T, block: u16, vtag: u32, dirty: bool) {
        if dirty {
            trace!("writeback block {} tag {}", block, vtag);
            hw.write_block(block, self.ext_offset(vtag));
        }
        if self.class == MemClass::Dmem {
            self.tag_valid.clear(vtag);
        }
        hw.invalidate(block);
    }
}
