//! Boot-time configuration of the overlay subsystem.
//!
//! Layout a firmware image would bake into linker symbols and build
//! flags is carried here as plain data and checked once by
//! [`OverlayConfig::validate`] before the subsystem is constructed.

use crate::index::MemClass;

/// Largest supported block: 4 KiB (`block_shift == 12`).
pub const MAX_BLOCK_SHIFT: u8 = 12;

/// Smallest supported block: 16 bytes.
pub const MIN_BLOCK_SHIFT: u8 = 4;

/// Virtual DMEM blocks covered by the tag-valid bitmap.
pub const MAX_VIRT_BLOCKS: u32 = 1024;

/// Physical layout of one memory class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClassLayout {
    /// Physical blocks in the memory.
    pub block_count: u16,
    /// First block available for paging; lower blocks hold resident overlays.
    pub first_pageable: u16,
    /// First virtual address of the paged window.
    pub va_base: u32,
}

/// Burst limits and region policy of the DMA engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaConfig {
    /// Smallest read burst in bytes; reads must be aligned to it.
    pub read_min_burst: u32,
    /// Largest read burst in bytes.
    pub read_max_burst: u32,
    /// Smallest write burst in bytes; writes must be aligned to it.
    pub write_min_burst: u32,
    /// Largest write burst in bytes.
    pub write_max_burst: u32,
    /// Enforce `allowed_regions` on client transfers.
    pub region_check: bool,
    /// Bit `n` set: DMA region `n` may be targeted.
    pub allowed_regions: u8,
}

impl DmaConfig {
    /// Reference hardware limits.
    #[must_use]
    pub const fn falcon_default() -> Self {
        Self {
            read_min_burst: 16,
            read_max_burst: 256,
            write_min_burst: 4,
            write_max_burst: 256,
            region_check: true,
            allowed_regions: 0xFF,
        }
    }
}

/// Full subsystem configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OverlayConfig {
    /// log2 of the physical block size.
    pub block_shift: u8,
    /// Instruction memory layout.
    pub imem: ClassLayout,
    /// Data memory layout.
    pub dmem: ClassLayout,
    /// DMA engine limits.
    pub dma: DmaConfig,
    /// Page single blocks on miss faults (round-robin replacement) instead of
    /// pinning whole overlays in MRU order.
    pub on_demand_paging: bool,
    /// Honour the secure flag on IMEM loads.
    pub secure_overlays: bool,
}

/// Reasons [`OverlayConfig::validate`] rejects a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Block shift outside the supported range.
    BlockShift,
    /// A class has no pageable block, or more blocks than a tag can index.
    BlockCount(MemClass),
    /// A class's paged window does not start on a block boundary.
    VaBase(MemClass),
    /// Burst limits are not powers of two, inverted, or larger than a block.
    BurstSize,
    /// The physical memory reports a different block count.
    HardwareMismatch(MemClass),
    /// A paged overlay lies outside its class's virtual window.
    OutsideWindow(MemClass),
}

#[cfg(feature = "std")]
impl std::error::Error for ConfigError {}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BlockShift => write!(f, "unsupported block size"),
            Self::BlockCount(class) => write!(f, "{class}: no pageable blocks"),
            Self::VaBase(class) => write!(f, "{class}: virtual base not block aligned"),
            Self::BurstSize => write!(f, "invalid DMA burst limits"),
            Self::HardwareMismatch(class) => write!(f, "{class}: block count differs from hardware"),
            Self::OutsideWindow(class) => write!(f, "{class}: overlay outside the paged window"),
        }
    }
}

impl OverlayConfig {
    /// Reference core: 256-byte blocks, 64 KiB IMEM, 64 KiB DMEM with the
    /// lower 16 KiB resident, paged DMEM window at 0x1_0000.
    #[must_use]
    pub const fn falcon_default() -> Self {
        Self {
            block_shift: 8,
            imem: ClassLayout {
                block_count: 256,
                first_pageable: 32,
                va_base: 0,
            },
            dmem: ClassLayout {
                block_count: 256,
                first_pageable: 64,
                va_base: 0x1_0000,
            },
            dma: DmaConfig::falcon_default(),
            on_demand_paging: false,
            secure_overlays: true,
        }
    }

    /// Block size in bytes.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        1 << self.block_shift
    }

    /// Layout of `class`.
    #[must_use]
    pub const fn layout(&self, class: MemClass) -> &ClassLayout {
        match class {
            MemClass::Imem => &self.imem,
            MemClass::Dmem => &self.dmem,
        }
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_BLOCK_SHIFT..=MAX_BLOCK_SHIFT).contains(&self.block_shift) {
            return Err(ConfigError::BlockShift);
        }
        let mask = self.block_size().wrapping_sub(1);
        for class in [MemClass::Imem, MemClass::Dmem] {
            let layout = self.layout(class);
            // Tags carry 16-bit block indices.
            if layout.first_pageable >= layout.block_count || layout.block_count == u16::MAX {
                return Err(ConfigError::BlockCount(class));
            }
            if layout.va_base & mask != 0 {
                return Err(ConfigError::VaBase(class));
            }
        }
        let bursts = [
            (self.dma.read_min_burst, self.dma.read_max_burst),
            (self.dma.write_min_burst, self.dma.write_max_burst),
        ];
        for (min, max) in bursts {
            if !min.is_power_of_two()
                || !max.is_power_of_two()
                || min > max
                || max > self.block_size()
            {
                return Err(ConfigError::BurstSize);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_preset_is_valid() {
        assert_eq!(OverlayConfig::falcon_default().validate(), Ok(()));
        assert_eq!(OverlayConfig::falcon_default().block_size(), 256);
    }

    #[test]
    fn oversized_block_shift_rejected() {
        let cfg = OverlayConfig {
            block_shift: 13,
            ..OverlayConfig::falcon_default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::BlockShift));
    }

    #[test]
    fn no_pageable_blocks_rejected() {
        let mut cfg = OverlayConfig::falcon_default();
        cfg.dmem.first_pageable = cfg.dmem.block_count;
        assert_eq!(cfg.validate(), Err(ConfigError::BlockCount(MemClass::Dmem)));
    }

    #[test]
    fn unaligned_window_rejected() {
        let mut cfg = OverlayConfig::falcon_default();
        cfg.imem.va_base = 0x80;
        assert_eq!(cfg.validate(), Err(ConfigError::VaBase(MemClass::Imem)));
    }

    #[test]
    fn burst_limits_checked() {
        let mut cfg = OverlayConfig::falcon_default();
        cfg.dma.read_min_burst = 24;
        assert_eq!(cfg.validate(), Err(ConfigError::BurstSize), "non power of two");

        let mut cfg = OverlayConfig::falcon_default();
        cfg.dma.write_min_burst = 512;
        assert_eq!(cfg.validate(), Err(ConfigError::BurstSize), "min above max");

        let mut cfg = OverlayConfig::falcon_default();
        cfg.block_shift = 6;
        assert_eq!(cfg.validate(), Err(ConfigError::BurstSize), "burst above block size");
    }
}
