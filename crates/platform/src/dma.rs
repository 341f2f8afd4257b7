//! DMA abstraction layer
//!
//! Describes single hardware bursts between on-chip memory and an external
//! (FB/SYSMEM) surface. Chunking, alignment and the suspend protocol live in
//! the overlay crate; a [`DmaController`] only moves one burst at a time.

/// Transfer direction, named from the on-chip memory's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaDirection {
    /// External surface → on-chip memory.
    Read,
    /// On-chip memory → external surface.
    Write,
}

/// External surface descriptor: a 64-bit base split into two words plus the
/// DMA region (aperture) index the surface lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemDesc {
    /// Low 32 bits of the surface base address.
    pub address_lo: u32,
    /// High 32 bits of the surface base address.
    pub address_hi: u32,
    /// DMA region index.
    pub region: u8,
}

impl MemDesc {
    /// Build a descriptor from a 64-bit base address.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // split into lo/hi words
    pub const fn new(address: u64, region: u8) -> Self {
        Self {
            address_lo: address as u32,
            address_hi: (address >> 32) as u32,
            region,
        }
    }

    /// Recombined 64-bit base address.
    #[must_use]
    pub const fn address(&self) -> u64 {
        ((self.address_hi as u64) << 32) | self.address_lo as u64
    }
}

/// One hardware burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaBurst {
    /// Transfer direction.
    pub direction: DmaDirection,
    /// Physical on-chip byte address.
    pub mem_addr: u32,
    /// External byte address.
    pub ext_addr: u64,
    /// Burst size in bytes (power of two).
    pub size: u32,
    /// DMA region index.
    pub region: u8,
}

/// DMA engine front end.
pub trait DmaController {
    /// Queue one burst.
    fn issue(&mut self, burst: DmaBurst);

    /// Block until every queued burst has completed.
    fn wait_idle(&mut self);

    /// `true` when the engine reports NACKed bursts.
    fn nack_supported(&self) -> bool {
        false
    }

    /// Read and clear the NACK flag.
    fn take_nack(&mut self) -> bool {
        false
    }

    /// Gate the power/fabric domain behind the external surface.
    ///
    /// Called with `false` on the first suspension and `true` on the final
    /// resume.
    fn set_fabric_power(&mut self, _on: bool) {}
}
