//! The paging context: both memory classes, their hardware and the shared
//! DMA lock, built once at boot.

use platform::{DmemTagMemory, ImemTagMemory};

use crate::blocks::ClassState;
use crate::config::{ConfigError, OverlayConfig, MAX_VIRT_BLOCKS};
use crate::descriptor::{tag_span, OverlayTable};
use crate::dma::DmaLock;
use crate::error::LoadError;
use crate::index::{MemClass, OverlayIndex};
use crate::task::{ReloadMask, TaskOverlays};

/// Overlay manager for one core.
///
/// Owns the descriptor tables, MRU lists, recycle trackers and residency
/// bitmaps of both memory classes, and the tag memories they describe.
/// The [`DmaLock`] is borrowed because client DMA transfers share it.
pub struct OverlaySystem<'a, I: ImemTagMemory, D: DmemTagMemory> {
    pub(crate) config: OverlayConfig,
    pub(crate) imem_hw: I,
    pub(crate) dmem_hw: D,
    pub(crate) imem: ClassState,
    pub(crate) dmem: ClassState,
    pub(crate) lock: &'a DmaLock,
    pub(crate) allocations_blocked: bool,
}

impl<'a, I: ImemTagMemory, D: DmemTagMemory> OverlaySystem<'a, I, D> {
    /// Validate `config` against the hardware and the tables and build the
    /// context.
    pub fn new(
        config: OverlayConfig,
        imem_hw: I,
        dmem_hw: D,
        imem_table: OverlayTable,
        dmem_table: OverlayTable,
        lock: &'a DmaLock,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if imem_hw.block_count() != config.imem.block_count {
            return Err(ConfigError::HardwareMismatch(MemClass::Imem));
        }
        if dmem_hw.block_count() != config.dmem.block_count {
            return Err(ConfigError::HardwareMismatch(MemClass::Dmem));
        }
        check_window(&config, MemClass::Imem, &imem_table)?;
        check_window(&config, MemClass::Dmem, &dmem_table)?;

        let shift = config.block_shift;
        let on_demand = config.on_demand_paging;
        info!(
            "overlay system: {} IMEM / {} DMEM overlays, {} byte blocks",
            imem_table.count(),
            dmem_table.count(),
            config.block_size()
        );
        Ok(Self {
            imem: ClassState::new(MemClass::Imem, config.imem, shift, on_demand, imem_table),
            dmem: ClassState::new(MemClass::Dmem, config.dmem, shift, on_demand, dmem_table),
            config,
            imem_hw,
            dmem_hw,
            lock,
            allocations_blocked: false,
        })
    }

    /// Boot configuration.
    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Shared DMA suspend/lock state.
    pub fn lock(&self) -> &'a DmaLock {
        self.lock
    }

    /// Instruction memory.
    pub fn imem_hw(&self) -> &I {
        &self.imem_hw
    }

    /// Instruction memory, mutably.
    pub fn imem_hw_mut(&mut self) -> &mut I {
        &mut self.imem_hw
    }

    /// Data memory.
    pub fn dmem_hw(&self) -> &D {
        &self.dmem_hw
    }

    /// Data memory, mutably.
    pub fn dmem_hw_mut(&mut self) -> &mut D {
        &mut self.dmem_hw
    }

    /// Descriptor table of `class`.
    pub fn table(&self, class: MemClass) -> &OverlayTable {
        &self.class(class).table
    }

    /// Overlays of `class` in most-recently-used order.
    pub fn mru_order(&self, class: MemClass) -> impl Iterator<Item = OverlayIndex> + '_ {
        self.class(class).mru.iter()
    }

    /// `true` when `ovl` was fully loaded and none of its blocks has been
    /// stolen since.
    pub fn is_loaded(&self, class: MemClass, ovl: OverlayIndex) -> bool {
        self.class(class).is_loaded(ovl)
    }

    pub(crate) fn class(&self, class: MemClass) -> &ClassState {
        match class {
            MemClass::Imem => &self.imem,
            MemClass::Dmem => &self.dmem,
        }
    }

    /// Task-load step: make a task's overlays resident before it runs.
    ///
    /// A task that is already current only reloads the classes flagged in
    /// its reload mask; any other task reloads everything. IMEM goes first
    /// (plain code, then HS code armed secure), DMEM second. Returns the
    /// number of blocks transferred, or [`LoadError::Suspended`] when DMA is
    /// suspended and the scheduler should pick another task. The mask is
    /// cleared only on success.
    pub fn load_task(&mut self, task: &mut TaskOverlays, current: bool) -> Result<u32, LoadError> {
        let mask = if current { task.reload_mask() } else { ReloadMask::ALL };
        if mask.is_empty() {
            return Ok(0);
        }
        let _guard = self.lock.guard();
        let mut total = 0u32;
        if mask.contains(ReloadMask::IMEM) {
            total = total.saturating_add(self.imem_load_list(task.imem_list(), false)?);
            total = total.saturating_add(self.imem_load_list(task.hs_list(), true)?);
        }
        if mask.contains(ReloadMask::DMEM) {
            total = total.saturating_add(self.dmem_load_list(task.dmem_list())?);
        }
        task.clear_reload();
        trace!("task load moved {} blocks", total);
        Ok(total)
    }
}

/// Paged overlays must sit at or above the class's window base; paged DMEM
/// must also fit the tag-valid bitmap.
fn check_window(
    config: &OverlayConfig,
    class: MemClass,
    table: &OverlayTable,
) -> Result<(), ConfigError> {
    let layout = config.layout(class);
    let window_start = layout.va_base >> config.block_shift;
    for ovl in table.indices() {
        let Some(desc) = table.get(ovl) else {
            continue;
        };
        if desc.resident {
            continue;
        }
        if desc.virtual_start < layout.va_base {
            return Err(ConfigError::OutsideWindow(class));
        }
        let span = tag_span(
            u64::from(desc.virtual_start),
            desc.reserved_end(),
            config.block_shift,
        );
        let limit = u64::from(window_start).saturating_add(u64::from(MAX_VIRT_BLOCKS));
        if class == MemClass::Dmem && u64::from(span.end) > limit {
            return Err(ConfigError::OutsideWindow(class));
        }
    }
    Ok(())
}
