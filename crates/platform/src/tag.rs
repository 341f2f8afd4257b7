//! Hardware tag words and tag-checked memories.
//!
//! IMEM and DMEM are split into fixed-size physical blocks. Each block
//! carries a hardware tag recording which virtual block it currently holds
//! and whether the contents are valid, dirty (DMEM only) or secure (IMEM
//! only). The `imtag`/`dmtag` instructions look a virtual tag up; the
//! `imblk`/`dmblk` instructions report what a physical block holds. Both
//! return a 32-bit word decoded by [`TagWord`].
//!
//! # Tag word layout
//!
//! ```text
//!  31      29 28  27  26  25   24   23        16 15                 0
//! ┌─────────┬───┬───┬───┬────┬────┬────────────┬────────────────────┐
//! │ reserved│SEC│DTY│VLD│MHIT│MISS│  reserved  │ block / virtual tag│
//! └─────────┴───┴───┴───┴────┴────┴────────────┴────────────────────┘
//! ```
//!
//! For a lookup by virtual tag the low half-word is the physical block
//! index; for a status query by physical block it is the virtual tag.

/// Decoded condition of a tag-checked block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockState {
    /// Nothing maps the queried tag / the block holds no virtual block.
    Miss,
    /// Mapped, but the contents are stale or were cleared.
    Invalid,
    /// Mapped and valid, identical to the backing image.
    Clean,
    /// Mapped and valid, modified since it was read in (DMEM only).
    Dirty,
}

/// Raw tag word as returned by the tag query instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
pub struct TagWord(u32);

impl TagWord {
    /// Block index (lookup) or virtual tag (status query).
    pub const INDEX_MASK: u32 = 0x0000_FFFF;
    /// No block maps the queried tag.
    pub const MISS: u32 = 1 << 24;
    /// More than one block maps the queried tag.
    pub const MULTI_HIT: u32 = 1 << 25;
    /// Block contents are valid.
    pub const VALID: u32 = 1 << 26;
    /// Block contents were written since the last read/writeback.
    pub const DIRTY: u32 = 1 << 27;
    /// Block was loaded with the secure attribute.
    pub const SECURE: u32 = 1 << 28;

    /// Wrap a raw hardware word.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The word reported when nothing matches.
    #[must_use]
    pub const fn miss() -> Self {
        Self(Self::MISS)
    }

    /// Build a word for a mapped block.
    ///
    /// `BlockState::Miss` yields [`TagWord::miss`] regardless of the other
    /// arguments.
    #[must_use]
    pub const fn mapped(index: u16, state: BlockState, secure: bool) -> Self {
        let flags = match state {
            BlockState::Miss => return Self::miss(),
            BlockState::Invalid => 0,
            BlockState::Clean => Self::VALID,
            BlockState::Dirty => Self::VALID | Self::DIRTY,
        };
        let secure = if secure { Self::SECURE } else { 0 };
        Self(index as u32 | flags | secure)
    }

    /// Return the same word with the multi-hit flag raised.
    #[must_use]
    pub const fn with_multi_hit(self) -> Self {
        Self(self.0 | Self::MULTI_HIT)
    }

    /// Raw 32-bit value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// `true` when no physical block backs the tag.
    #[must_use]
    pub const fn is_miss(self) -> bool {
        self.0 & Self::MISS != 0
    }

    /// `true` when several blocks claim the same tag.
    #[must_use]
    pub const fn is_multi_hit(self) -> bool {
        self.0 & Self::MULTI_HIT != 0
    }

    /// `true` for a mapped block whose contents are usable.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        !self.is_miss() && self.0 & Self::VALID != 0
    }

    /// `true` for a mapped block whose contents are stale.
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        !self.is_miss() && self.0 & Self::VALID == 0
    }

    /// `true` for a valid block that must be written back before reuse.
    #[must_use]
    pub const fn is_dirty(self) -> bool {
        self.is_valid() && self.0 & Self::DIRTY != 0
    }

    /// `true` when the block carries the secure attribute.
    #[must_use]
    pub const fn is_secure(self) -> bool {
        !self.is_miss() && self.0 & Self::SECURE != 0
    }

    /// Physical block (lookup) or virtual tag (status query).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // masked to 16 bits
    pub const fn index(self) -> u16 {
        (self.0 & Self::INDEX_MASK) as u16
    }

    /// Collapse the flags into a [`BlockState`].
    #[must_use]
    pub const fn state(self) -> BlockState {
        if self.is_miss() {
            BlockState::Miss
        } else if self.is_dirty() {
            BlockState::Dirty
        } else if self.is_valid() {
            BlockState::Clean
        } else {
            BlockState::Invalid
        }
    }
}

/// A tag-checked on-chip memory (IMEM or DMEM).
///
/// Block reads are DMA transfers from the memory's current DMA base plus a
/// byte offset; on completion the hardware tags the block with the given
/// virtual tag.
pub trait TagMemory {
    /// Number of physical blocks.
    fn block_count(&self) -> u16;

    /// Look up which block holds `virt_tag`.
    fn lookup(&self, virt_tag: u32) -> TagWord;

    /// Report what physical `block` currently holds.
    fn block_status(&self, block: u16) -> TagWord;

    /// Clear the valid bit of `block`.
    fn invalidate(&mut self, block: u16);

    /// Tag `block` as holding `virt_tag` without transferring any data.
    fn map_block(&mut self, block: u16, virt_tag: u32);

    /// DMA `block` in from `dma_base() + ext_offset` and tag it.
    fn read_block(&mut self, block: u16, virt_tag: u32, ext_offset: u32, secure: bool);

    /// DMA `block` out to `dma_base() + ext_offset` and mark it clean.
    ///
    /// Only data memories report dirty blocks; instruction memories keep
    /// the default, which does nothing.
    fn write_block(&mut self, _block: u16, _ext_offset: u32) {}

    /// Current external base address used by block transfers.
    fn dma_base(&self) -> u64;

    /// Replace the external base address used by block transfers.
    fn set_dma_base(&mut self, base: u64);
}

/// Instruction memory with a secure-region register.
pub trait ImemTagMemory: TagMemory {
    /// Arm the secure-region register over `[start_tag, end_tag)`.
    fn arm_secure_range(&mut self, start_tag: u32, end_tag: u32);

    /// Disarm the secure-region register.
    fn clear_secure_range(&mut self);

    /// `true` when the core runs with debug signing keys.
    fn debug_signed(&self) -> bool;
}

/// Access to a DMEM address that no valid block backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MissFault {
    /// Faulting byte address.
    pub addr: u32,
}

#[cfg(feature = "std")]
impl std::error::Error for MissFault {}

impl core::fmt::Display for MissFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "DMEM miss at 0x{:08X}", self.addr)
    }
}

/// Data memory with byte access.
///
/// Addresses below the paging window are physical; addresses inside it go
/// through the tags and fault with [`MissFault`] when unmapped.
pub trait DmemTagMemory: TagMemory {
    /// Copy bytes out of DMEM.
    fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> Result<(), MissFault>;

    /// Copy bytes into DMEM, marking touched paged blocks dirty.
    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), MissFault>;

    /// Fill `len` bytes at `addr` with `value`.
    fn fill(&mut self, addr: u32, len: u32, value: u8) -> Result<(), MissFault>;
}
