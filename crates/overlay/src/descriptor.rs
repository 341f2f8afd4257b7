//! Overlay descriptor tables.
//!
//! One table per memory class, built at boot from a descriptor array and
//! validated once. Entry `i` describes overlay index `i + 1`; index 0 stays
//! the invalid sentinel and has no entry.

use core::ops::Range;

use heapless::Vec;

use crate::index::{OverlayIndex, OvlSize, MAX_OVERLAYS};

/// Encrypted-image placement of a secure (HS) overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SecureImage {
    /// Offset added to the DMA base when the core runs debug-signed.
    pub enc_offset_debug: u32,
    /// Offset added to the DMA base when the core runs production-signed.
    pub enc_offset_prod: u32,
}

/// Static metadata for one overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OverlayDescriptor {
    /// First virtual byte address.
    pub virtual_start: u32,
    /// Live bytes: the code size, or how far the bump heap has grown.
    pub size_current: OvlSize,
    /// Reserved bytes; nothing is allocated or loaded past this.
    pub size_max: OvlSize,
    /// Permanently resident: never paged, never evicted.
    pub resident: bool,
    /// Encrypted image offsets for secure loads.
    pub secure: Option<SecureImage>,
}

impl OverlayDescriptor {
    /// Paged overlay.
    #[must_use]
    pub const fn paged(virtual_start: u32, size_current: OvlSize, size_max: OvlSize) -> Self {
        Self {
            virtual_start,
            size_current,
            size_max,
            resident: false,
            secure: None,
        }
    }

    /// Permanently resident overlay. Code and static data are fully used
    /// (`size_current == size_max`); the OS heap starts at 0 and grows by
    /// bump allocation.
    #[must_use]
    pub const fn resident(virtual_start: u32, size_current: OvlSize, size_max: OvlSize) -> Self {
        Self {
            virtual_start,
            size_current,
            size_max,
            resident: true,
            secure: None,
        }
    }

    /// Attach encrypted image offsets.
    #[must_use]
    pub const fn with_secure(mut self, image: SecureImage) -> Self {
        self.secure = Some(image);
        self
    }

    /// One past the last reserved byte.
    pub fn reserved_end(&self) -> u64 {
        u64::from(self.virtual_start).saturating_add(u64::from(self.size_max))
    }

    /// One past the last live byte.
    pub fn live_end(&self) -> u64 {
        u64::from(self.virtual_start).saturating_add(u64::from(self.size_current))
    }

    /// Bytes left for bump allocation.
    pub fn free_bytes(&self) -> OvlSize {
        self.size_max.saturating_sub(self.size_current)
    }
}

/// Reasons an [`OverlayTable`] is rejected. Carries the offending raw index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TableError {
    /// More descriptors than overlay indices.
    TooMany,
    /// `size_current > size_max`.
    SizeExceedsMax(u8),
    /// Reserved range wraps the 32-bit address space.
    AddressWrap(u8),
    /// Start address lower than the previous overlay's.
    Unsorted(u8),
    /// Reserved range overlaps the previous overlay's.
    Overlap(u8),
    /// Paged overlay does not start on a block boundary.
    Unaligned(u8),
    /// The designated heap overlay does not exist.
    NoSuchHeap(u8),
    /// The designated heap overlay is paged; it must be resident.
    PagedHeap(u8),
}

#[cfg(feature = "std")]
impl std::error::Error for TableError {}

impl core::fmt::Display for TableError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooMany => write!(f, "too many overlays"),
            Self::SizeExceedsMax(i) => write!(f, "overlay {i}: current size above maximum"),
            Self::AddressWrap(i) => write!(f, "overlay {i}: range wraps the address space"),
            Self::Unsorted(i) => write!(f, "overlay {i}: start addresses not ascending"),
            Self::Overlap(i) => write!(f, "overlay {i}: overlaps the previous overlay"),
            Self::Unaligned(i) => write!(f, "overlay {i}: start not block aligned"),
            Self::NoSuchHeap(i) => write!(f, "heap overlay {i} does not exist"),
            Self::PagedHeap(i) => write!(f, "heap overlay {i} is not resident"),
        }
    }
}

/// Validated descriptor table for one memory class.
#[derive(Debug, Clone)]
pub struct OverlayTable {
    entries: Vec<OverlayDescriptor, MAX_OVERLAYS>,
    heap: Option<OverlayIndex>,
}

impl OverlayTable {
    /// Build and validate a table. `block_shift` is the physical block size
    /// paged overlays must align to.
    pub fn new(descriptors: &[OverlayDescriptor], block_shift: u8) -> Result<Self, TableError> {
        let mut entries = Vec::new();
        let mut prev_end = 0u64;
        let mask = (1u32 << block_shift.min(31)).wrapping_sub(1);
        for (slot, desc) in descriptors.iter().enumerate() {
            let raw = u8::try_from(slot.saturating_add(1)).map_err(|_| TableError::TooMany)?;
            if desc.size_current > desc.size_max {
                return Err(TableError::SizeExceedsMax(raw));
            }
            if desc.reserved_end() > u64::from(u32::MAX) {
                return Err(TableError::AddressWrap(raw));
            }
            if !desc.resident && desc.virtual_start & mask != 0 {
                return Err(TableError::Unaligned(raw));
            }
            if slot > 0 {
                let start = u64::from(desc.virtual_start);
                if start < prev_end {
                    let prev_start = entries
                        .last()
                        .map_or(0, |p: &OverlayDescriptor| u64::from(p.virtual_start));
                    return Err(if start < prev_start {
                        TableError::Unsorted(raw)
                    } else {
                        TableError::Overlap(raw)
                    });
                }
            }
            prev_end = desc.reserved_end();
            entries.push(*desc).map_err(|_| TableError::TooMany)?;
        }
        Ok(Self {
            entries,
            heap: None,
        })
    }

    /// Designate the OS heap overlay. It must be resident: heap memory is
    /// never tagged in or demand-paged.
    pub fn with_heap(mut self, heap: OverlayIndex) -> Result<Self, TableError> {
        match self.get(heap) {
            None => return Err(TableError::NoSuchHeap(heap.get())),
            Some(desc) if !desc.resident => return Err(TableError::PagedHeap(heap.get())),
            Some(_) => {}
        }
        self.heap = Some(heap);
        Ok(self)
    }

    /// Number of overlays (the highest valid index).
    #[allow(clippy::cast_possible_truncation)] // capacity is MAX_OVERLAYS
    pub fn count(&self) -> u8 {
        self.entries.len() as u8
    }

    /// The general heap overlay, if designated.
    pub fn heap(&self) -> Option<OverlayIndex> {
        self.heap
    }

    /// Resolve a raw index against this table.
    pub fn index(&self, raw: u8) -> Option<OverlayIndex> {
        OverlayIndex::new(raw).filter(|idx| idx.slot() < self.entries.len())
    }

    /// Descriptor of `ovl`.
    pub fn get(&self, ovl: OverlayIndex) -> Option<&OverlayDescriptor> {
        self.entries.get(ovl.slot())
    }

    /// Descriptor of `ovl`, halting on an index outside the table.
    pub(crate) fn entry(&self, ovl: OverlayIndex) -> &OverlayDescriptor {
        match self.entries.get(ovl.slot()) {
            Some(desc) => desc,
            None => halt!("overlay {} not in table", ovl.get()),
        }
    }

    pub(crate) fn entry_mut(&mut self, ovl: OverlayIndex) -> &mut OverlayDescriptor {
        match self.entries.get_mut(ovl.slot()) {
            Some(desc) => desc,
            None => halt!("overlay {} not in table", ovl.get()),
        }
    }

    /// All valid indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = OverlayIndex> + '_ {
        (1..=self.count()).filter_map(OverlayIndex::new)
    }

    /// Virtual block tags `[first, end)` covering the live bytes of `ovl`.
    pub fn virtual_span(&self, ovl: OverlayIndex, block_shift: u8) -> Range<u32> {
        let desc = self.entry(ovl);
        tag_span(u64::from(desc.virtual_start), desc.live_end(), block_shift)
    }

    /// Overlay whose reserved range contains `addr` (binary search over the
    /// ascending start addresses).
    pub fn find_by_address(&self, addr: u32) -> Option<OverlayIndex> {
        let pos = self
            .entries
            .partition_point(|desc| desc.virtual_start <= addr)
            .checked_sub(1)?;
        let desc = self.entries.get(pos)?;
        if u64::from(addr) >= desc.reserved_end() {
            return None;
        }
        OverlayIndex::new(u8::try_from(pos.saturating_add(1)).ok()?)
    }

    /// Live byte range `[start, end)` spanned by all paged overlays.
    pub fn paged_region(&self) -> Option<Range<u64>> {
        let mut paged = self.entries.iter().filter(|d| !d.resident);
        let first = paged.next()?;
        let mut region = u64::from(first.virtual_start)..first.live_end();
        for desc in paged {
            region.end = region.end.max(desc.live_end());
        }
        Some(region)
    }
}

/// Block tags covering `[start, end)` bytes.
#[allow(clippy::cast_possible_truncation)] // end <= 2^32, shifted right
#[allow(clippy::arithmetic_side_effects)] // Safety: operands bounded by 2^32 + block size
pub(crate) fn tag_span(start: u64, end: u64, block_shift: u8) -> Range<u32> {
    let round = (1u64 << block_shift) - 1;
    let first = (start >> block_shift) as u32;
    let last = ((end + round) >> block_shift) as u32;
    first..last.max(first)
}
