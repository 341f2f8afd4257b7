//! Overlay identifiers and memory classes.

use core::num::NonZeroU8;

/// Upper bound on overlays per memory class (index 0 is reserved).
pub const MAX_OVERLAYS: usize = 63;

/// Byte size of an overlay.
#[cfg(not(feature = "ovl-size-16"))]
pub type OvlSize = u32;

/// Byte size of an overlay.
#[cfg(feature = "ovl-size-16")]
pub type OvlSize = u16;

/// Non-zero overlay number; `None` takes the place of the reserved index 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OverlayIndex(NonZeroU8);

impl OverlayIndex {
    /// Wrap a raw index. Returns `None` for 0 and anything above
    /// [`MAX_OVERLAYS`].
    #[must_use]
    pub const fn new(raw: u8) -> Option<Self> {
        if raw as usize > MAX_OVERLAYS {
            return None;
        }
        match NonZeroU8::new(raw) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Raw index.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0.get()
    }

    /// Zero-based table slot.
    #[allow(clippy::arithmetic_side_effects)] // Safety: index is non-zero
    pub(crate) const fn slot(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Bit in a per-class `u64` bitmap.
    #[allow(clippy::arithmetic_side_effects)] // Safety: index <= 63
    pub(crate) const fn bit(self) -> u64 {
        1u64 << self.0.get()
    }
}

/// Which on-chip memory an overlay lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MemClass {
    /// Instruction memory.
    Imem,
    /// Data memory.
    Dmem,
}

impl core::fmt::Display for MemClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Imem => "IMEM",
            Self::Dmem => "DMEM",
        })
    }
}
