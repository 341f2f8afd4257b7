//! Hardware Abstraction Layer for the Falcon microcontroller memory system
//!
//! This crate provides trait-based abstractions for the pieces of hardware the
//! overlay subsystem talks to, enabling development and testing without a
//! physical core.
//!
//! # Architecture Layers
//!
//! ```text
//! RTOS kernel (task load step, exception vectors)
//!         ↓
//! Overlay subsystem (overlay crate)
//!         ↓
//! Platform HAL (this crate - trait abstractions)
//!         ↓
//! Falcon registers / tag instructions
//! ```
//!
//! # Abstractions
//!
//! - [`TagMemory`], [`ImemTagMemory`], [`DmemTagMemory`] - tag-checked
//!   on-chip memories
//! - [`DmaController`] - single-burst DMA engine front end
//! - [`Scheduler`] - the RTOS hooks the memory subsystem calls back into
//!
//! # Features
//!
//! - `std`: Enable standard library support (for testing)
//! - `simulator`: Host-side simulated core ([`sim`])
//! - `defmt`: Enable defmt logging derives

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)] // no .unwrap() in production code
#![deny(clippy::expect_used)] // no .expect() in production code
#![deny(clippy::panic)] // no panic!() in production code
#![deny(clippy::unreachable)] // no unreachable!() that isn't documented
#![deny(unused_must_use)]
// all Results must be handled
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::print_stdout)] // prefer tracing/defmt over println! in lib code
// Pedantic lints suppressed for this hardware HAL crate:
#![allow(clippy::doc_markdown)] // register and instruction names in doc comments
#![allow(clippy::must_use_candidate)] // hardware accessors, callers decide
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

#[cfg(all(feature = "std", not(test)))]
extern crate std;

pub mod dma;
pub mod scheduler;
#[cfg(feature = "simulator")]
pub mod sim;
pub mod tag;

pub use dma::{DmaBurst, DmaController, DmaDirection, MemDesc};
pub use scheduler::Scheduler;
pub use tag::{BlockState, DmemTagMemory, ImemTagMemory, MissFault, TagMemory, TagWord};
