//! Recoverable error types.
//!
//! Only conditions a caller can act on live here. Broken invariants halt
//! through `halt!` instead of being returned.

/// DMA transfer failures. No bytes are accounted as moved on any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaError {
    /// External address computation overflowed the 64-bit address space.
    InvalidArgument,
    /// The surface's DMA region is not permitted for this caller.
    UnexpectedChannel,
    /// Offset, buffer or length is not a multiple of the minimum burst.
    AlignmentError,
    /// The engine NACKed a burst.
    Nack,
}

#[cfg(feature = "std")]
impl std::error::Error for DmaError {}

impl core::fmt::Display for DmaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "DMA address out of range"),
            Self::UnexpectedChannel => write!(f, "DMA region not permitted"),
            Self::AlignmentError => write!(f, "DMA request misaligned for minimum burst"),
            Self::Nack => write!(f, "DMA burst NACKed"),
        }
    }
}

/// Bump allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AllocError {
    /// Zero size, bad alignment, or a size the overlay size type cannot hold.
    InvalidArgument,
    /// The request does not fit below the overlay's maximum size.
    OutOfSpace,
    /// Rounding or summing the request wrapped the size type.
    Overflow,
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

impl core::fmt::Display for AllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid allocation size or alignment"),
            Self::OutOfSpace => write!(f, "overlay is full"),
            Self::Overflow => write!(f, "allocation size overflow"),
        }
    }
}

/// Overlay load failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoadError {
    /// DMA is suspended; abandon this load and retry on a later schedule.
    Suspended,
}

#[cfg(feature = "std")]
impl std::error::Error for LoadError {}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Suspended => write!(f, "overlay load deferred: DMA suspended"),
        }
    }
}

/// Task stack setup failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackError {
    /// The stack depth in words does not fit the 16-bit depth field.
    DepthOverflow,
}

#[cfg(feature = "std")]
impl std::error::Error for StackError {}

impl core::fmt::Display for StackError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DepthOverflow => write!(f, "stack overlay too large for a 16-bit depth"),
        }
    }
}
