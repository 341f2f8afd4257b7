//! Per-task overlay attachment table.
//!
//! A task declares which overlays it needs by attaching them to its slot
//! array; the scheduler's task-load step hands the lists to the loaders.
//! The slot array is split into three regions sized at task creation:
//!
//! ```text
//! ┌──────────── IMEM ───────────┬──────── HS ────────┬────── DMEM ──────┐
//! │ 0 .. imem                   │ .. +hs             │ .. +dmem         │
//! └─────────────────────────────┴────────────────────┴──────────────────┘
//! ```
//!
//! Attaching sets the class's bit in the reload mask so an already-current
//! task is reloaded at its next load step.

use core::ops::Range;

use heapless::Vec;
use platform::{DmemTagMemory, ImemTagMemory, Scheduler};

use crate::index::{MemClass, OverlayIndex};
use crate::system::OverlaySystem;

/// Most overlay slots a task control block can carry.
pub const MAX_TASK_SLOTS: usize = 16;

/// Longest descriptor list [`OverlaySystem::exec_descriptor_list`] accepts.
pub const MAX_BATCH_OPS: usize = 64;

/// Memory classes a task must reload before it next runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReloadMask(u8);

impl ReloadMask {
    /// Nothing to reload.
    pub const NONE: Self = Self(0);
    /// Code overlays changed.
    pub const IMEM: Self = Self(1);
    /// Data overlays changed.
    pub const DMEM: Self = Self(2);
    /// Reload both classes.
    pub const ALL: Self = Self(3);

    /// Bit for `class`.
    pub const fn of(class: MemClass) -> Self {
        match class {
            MemClass::Imem => Self::IMEM,
            MemClass::Dmem => Self::DMEM,
        }
    }

    /// Raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// `true` when no class is flagged.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `true` when every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

/// Overlay slots of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOverlays {
    slots: Vec<Option<OverlayIndex>, MAX_TASK_SLOTS>,
    imem: usize,
    hs: usize,
    reload: ReloadMask,
}

impl TaskOverlays {
    /// Empty table with `imem` code slots, `hs` secure code slots and `dmem`
    /// data slots. Halts when the total exceeds [`MAX_TASK_SLOTS`].
    pub fn new(imem: u8, hs: u8, dmem: u8) -> Self {
        let total = usize::from(imem)
            .saturating_add(usize::from(hs))
            .saturating_add(usize::from(dmem));
        let mut slots = Vec::new();
        if slots.resize(total, None).is_err() {
            halt!("task overlay table of {} slots exceeds capacity", total);
        }
        Self {
            slots,
            imem: usize::from(imem),
            hs: usize::from(hs),
            reload: ReloadMask::NONE,
        }
    }

    /// Plain code overlay slots.
    pub fn imem_list(&self) -> &[Option<OverlayIndex>] {
        self.slots.get(self.region(MemClass::Imem, false)).unwrap_or(&[])
    }

    /// HS (secure) code overlay slots.
    pub fn hs_list(&self) -> &[Option<OverlayIndex>] {
        self.slots.get(self.region(MemClass::Imem, true)).unwrap_or(&[])
    }

    /// Data overlay slots.
    pub fn dmem_list(&self) -> &[Option<OverlayIndex>] {
        self.slots.get(self.region(MemClass::Dmem, false)).unwrap_or(&[])
    }

    /// Classes flagged for reload.
    pub fn reload_mask(&self) -> ReloadMask {
        self.reload
    }

    pub(crate) fn clear_reload(&mut self) {
        self.reload = ReloadMask::NONE;
    }

    /// `true` when `ovl` occupies a slot of the given region.
    pub fn contains(&self, class: MemClass, secure: bool, ovl: OverlayIndex) -> bool {
        self.slots
            .get(self.region(class, secure))
            .is_some_and(|slots| slots.contains(&Some(ovl)))
    }

    fn region(&self, class: MemClass, secure: bool) -> Range<usize> {
        let hs_start = self.imem;
        let dmem_start = hs_start.saturating_add(self.hs);
        match (class, secure) {
            (MemClass::Imem, false) => 0..hs_start,
            (MemClass::Imem, true) => hs_start..dmem_start,
            (MemClass::Dmem, _) => dmem_start..self.slots.len(),
        }
    }

    /// Scan the region backward: report a duplicate, otherwise fill the
    /// first free slot met.
    fn insert(&mut self, class: MemClass, secure: bool, ovl: OverlayIndex) -> Insert {
        let region = self.region(class, secure);
        let start = region.start;
        let Some(slots) = self.slots.get_mut(region) else {
            return Insert::Full;
        };
        let mut free = None;
        for (i, slot) in slots.iter().enumerate().rev() {
            match slot {
                Some(held) if *held == ovl => return Insert::Present,
                None if free.is_none() => free = Some(i),
                _ => {}
            }
        }
        match free.and_then(|i| slots.get_mut(i).map(|slot| (i, slot))) {
            Some((i, slot)) => {
                *slot = Some(ovl);
                Insert::Added(start.saturating_add(i))
            }
            None => Insert::Full,
        }
    }

    /// Clear the slot holding `ovl`, returning its position.
    fn remove(&mut self, class: MemClass, secure: bool, ovl: OverlayIndex) -> Option<usize> {
        let region = self.region(class, secure);
        let start = region.start;
        let (i, slot) = self
            .slots
            .get_mut(region)?
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| **slot == Some(ovl))?;
        *slot = None;
        Some(start.saturating_add(i))
    }

    /// Put `slot` back to `value`, provided it currently holds `expected`.
    fn restore(
        &mut self,
        slot: usize,
        expected: Option<OverlayIndex>,
        value: Option<OverlayIndex>,
    ) -> bool {
        match self.slots.get_mut(slot) {
            Some(held) if *held == expected => {
                *held = value;
                true
            }
            _ => false,
        }
    }
}

enum Insert {
    Added(usize),
    Present,
    Full,
}

/// What a single attach or detach did to the slot array.
#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotChange {
    /// This slot was filled or cleared.
    Slot(usize),
    /// Permanently resident; nothing to track.
    Resident,
    /// Already attached, or not attached: nothing changed.
    Unchanged,
}

/// Attach or detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OverlayAction {
    /// Add the overlay to the task.
    Attach,
    /// Remove the overlay from the task.
    Detach,
}

impl OverlayAction {
    fn flipped(self) -> Self {
        match self {
            Self::Attach => Self::Detach,
            Self::Detach => Self::Attach,
        }
    }
}

/// One entry of a batch descriptor list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OverlayOp {
    /// Raw overlay index in the class's table.
    pub index: u8,
    /// Memory class of the overlay.
    pub class: MemClass,
    /// What to do.
    pub action: OverlayAction,
    /// HS code overlay (IMEM only).
    pub secure: bool,
}

impl OverlayOp {
    /// Attach `index` of `class`.
    pub const fn attach(index: u8, class: MemClass) -> Self {
        Self {
            index,
            class,
            action: OverlayAction::Attach,
            secure: false,
        }
    }

    /// Detach `index` of `class`.
    pub const fn detach(index: u8, class: MemClass) -> Self {
        Self {
            index,
            class,
            action: OverlayAction::Detach,
            secure: false,
        }
    }

    /// Same operation on the HS region.
    #[must_use]
    pub const fn secure(mut self) -> Self {
        self.secure = true;
        self
    }
}

impl<I: ImemTagMemory, D: DmemTagMemory> OverlaySystem<'_, I, D> {
    /// Attach overlay `index` of `class` to `task`.
    ///
    /// Returns `false` when it was already attached (the table is left
    /// unchanged) and `true` otherwise, including for permanently resident
    /// overlays which are never tracked. Halts on an index outside the
    /// table or when the task has no free slot.
    pub fn attach(
        &mut self,
        task: &mut TaskOverlays,
        index: u8,
        class: MemClass,
        secure: bool,
    ) -> bool {
        self.attach_inner(task, index, class, secure) != SlotChange::Unchanged
    }

    /// [`attach`](Self::attach), halting when the overlay was already
    /// attached.
    pub fn attach_or_halt(
        &mut self,
        task: &mut TaskOverlays,
        index: u8,
        class: MemClass,
        secure: bool,
    ) {
        if !self.attach(task, index, class, secure) {
            halt!("{} overlay {} already attached", class, index);
        }
    }

    /// [`attach`](Self::attach) when `condition` holds; `true` otherwise.
    pub fn attach_if(
        &mut self,
        condition: bool,
        task: &mut TaskOverlays,
        index: u8,
        class: MemClass,
        secure: bool,
    ) -> bool {
        !condition || self.attach(task, index, class, secure)
    }

    /// Detach overlay `index` of `class` from `task`.
    ///
    /// Returns `true` when it was found and removed, or when it is
    /// permanently resident. Detaching a code overlay forgets that it was
    /// fully loaded.
    pub fn detach(
        &mut self,
        task: &mut TaskOverlays,
        index: u8,
        class: MemClass,
        secure: bool,
    ) -> bool {
        self.detach_inner(task, index, class, secure) != SlotChange::Unchanged
    }

    /// [`detach`](Self::detach), halting when the overlay was not attached.
    pub fn detach_or_halt(
        &mut self,
        task: &mut TaskOverlays,
        index: u8,
        class: MemClass,
        secure: bool,
    ) {
        if !self.detach(task, index, class, secure) {
            halt!("{} overlay {} not attached", class, index);
        }
    }

    /// [`detach`](Self::detach) when `condition` holds; `true` otherwise.
    pub fn detach_if(
        &mut self,
        condition: bool,
        task: &mut TaskOverlays,
        index: u8,
        class: MemClass,
        secure: bool,
    ) -> bool {
        !condition || self.detach(task, index, class, secure)
    }

    /// Apply `ops` to `task` as one batch.
    ///
    /// Operations run in order until one fails its idempotence check (an
    /// attach of an attached overlay or a detach of an absent one). On
    /// failure every operation that succeeded is undone in reverse order,
    /// slot for slot, and the reload mask is restored, leaving the task
    /// exactly as it was. When the batch succeeds and it attached anything,
    /// the scheduler is asked to reload.
    pub fn exec_descriptor_list<S: Scheduler>(
        &mut self,
        task: &mut TaskOverlays,
        ops: &[OverlayOp],
        sched: &mut S,
    ) -> bool {
        if ops.len() > MAX_BATCH_OPS {
            halt!("descriptor list of {} entries exceeds {}", ops.len(), MAX_BATCH_OPS);
        }
        let mut undo: Vec<(OverlayOp, SlotChange), MAX_BATCH_OPS> = Vec::new();
        let saved_reload = task.reload;
        let mut attached_any = false;
        let mut failed = false;
        for op in ops {
            let change = match op.action {
                OverlayAction::Attach => self.attach_inner(task, op.index, op.class, op.secure),
                OverlayAction::Detach => self.detach_inner(task, op.index, op.class, op.secure),
            };
            if change == SlotChange::Unchanged {
                failed = true;
                break;
            }
            attached_any |=
                op.action == OverlayAction::Attach && matches!(change, SlotChange::Slot(_));
            // Capacity checked above.
            let _ = undo.push((*op, change));
        }

        if failed {
            warn!("descriptor list failed at entry {}, rolling back", undo.len());
            while let Some((op, change)) = undo.pop() {
                self.undo(task, op, change);
            }
            task.reload = saved_reload;
            return false;
        }

        if attached_any {
            sched.request_reload();
        }
        true
    }

    /// Revert one applied batch entry.
    fn undo(&mut self, task: &mut TaskOverlays, op: OverlayOp, change: SlotChange) {
        let SlotChange::Slot(slot) = change else {
            return;
        };
        let ovl = self.resolve(op.index, op.class);
        let restored = match op.action.flipped() {
            OverlayAction::Attach => task.restore(slot, None, Some(ovl)),
            OverlayAction::Detach => {
                if op.class == MemClass::Imem {
                    self.imem.clear_loaded(ovl);
                }
                task.restore(slot, Some(ovl), None)
            }
        };
        if !restored {
            halt!("rollback of {} overlay {} failed", op.class, op.index);
        }
    }

    fn resolve(&self, index: u8, class: MemClass) -> OverlayIndex {
        match self.class(class).table.index(index) {
            Some(ovl) => ovl,
            None => halt!("invalid {} overlay index {}", class, index),
        }
    }

    fn attach_inner(
        &mut self,
        task: &mut TaskOverlays,
        index: u8,
        class: MemClass,
        secure: bool,
    ) -> SlotChange {
        let ovl = self.resolve(index, class);
        if self.class(class).table.entry(ovl).resident {
            return SlotChange::Resident;
        }
        match task.insert(class, secure, ovl) {
            Insert::Added(slot) => {
                task.reload.insert(ReloadMask::of(class));
                debug!("attached {} overlay {}", class, index);
                SlotChange::Slot(slot)
            }
            Insert::Present => SlotChange::Unchanged,
            Insert::Full => halt!("no free {} slot for overlay {}", class, index),
        }
    }

    /// Detaching a code overlay forgets that it was fully loaded.
    fn detach_inner(
        &mut self,
        task: &mut TaskOverlays,
        index: u8,
        class: MemClass,
        secure: bool,
    ) -> SlotChange {
        let ovl = self.resolve(index, class);
        if self.class(class).table.entry(ovl).resident {
            return SlotChange::Resident;
        }
        let removed = critical_section::with(|_| {
            let removed = task.remove(class, secure, ovl);
            if removed.is_some() && class == MemClass::Imem {
                self.imem.clear_loaded(ovl);
            }
            removed
        });
        match removed {
            Some(slot) => {
                debug!("detached {} overlay {}", class, index);
                SlotChange::Slot(slot)
            }
            None => SlotChange::Unchanged,
        }
    }
}
