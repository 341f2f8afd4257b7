//! DMEM heaps.
//!
//! - [`bump`]: append-only allocation inside one DMEM overlay, used during
//!   boot to carve out long-lived buffers.
//! - [`general`]: a first-fit free-list heap for the one general-purpose
//!   heap overlay.

pub mod bump;
pub mod general;
