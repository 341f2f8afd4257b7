//! IMEM/DMEM overlay management and on-demand paging for Falcon-class cores
//!
//! Code and data regions far larger than on-chip memory are time-multiplexed
//! into small physical IMEM/DMEM windows. Overlays are pulled in block by
//! block over DMA, evicted least-recently-used first, and tracked through the
//! hardware tag-check registers.
//!
//! # Layers
//!
//! ```text
//! Scheduler task-load step / miss exception vectors
//!         ↓
//! OverlaySystem (task attach table, IMEM/DMEM loaders)
//!         ↓
//! MRU tracker + block selection      bump heap      general heap
//!         ↓
//! platform::TagMemory / DmaEngine (suspend/lock protocol)
//! ```
//!
//! # Error model
//!
//! Broken caller contracts and exhausted static capacities halt the core
//! (`panic` under `panic = "abort"`). Transient hardware conditions (DMA
//! suspended, NACK) and bad caller-supplied buffers are returned as typed
//! errors: [`DmaError`], [`AllocError`], [`LoadError`], [`StackError`].
//!
//! # Features
//!
//! - `ovl-size-16`: 16-bit overlay sizes
//! - `defmt`: log through defmt
//! - `tracing`: log through tracing
//! - `std`: `std::error::Error` impls

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)] // no .unwrap() in production code
#![deny(clippy::expect_used)] // no .expect() in production code
#![deny(clippy::panic)] // fatal paths go through halt!
#![deny(clippy::unreachable)]
#![deny(unused_must_use)]
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_code)]
#![allow(clippy::doc_markdown)] // IMEM/DMEM/HS and register names in doc comments
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)] // panics are documented halts

#[cfg(all(feature = "std", not(test)))]
extern crate std;

#[macro_use]
mod fmt;

pub mod config;
pub mod descriptor;
pub mod dma;
pub mod error;
pub mod heap;
pub mod index;
pub mod mru;
pub mod task;

mod blocks;
mod dmem;
mod imem;
mod system;

pub use config::{ClassLayout, ConfigError, DmaConfig, OverlayConfig};
pub use descriptor::{OverlayDescriptor, OverlayTable, SecureImage, TableError};
pub use dma::{DmaEngine, DmaLock, LockGuard, SuspendOutcome};
pub use dmem::TaskStack;
pub use error::{AllocError, DmaError, LoadError, StackError};
pub use heap::general::GeneralHeap;
pub use imem::MissOutcome;
pub use index::{MemClass, OverlayIndex, OvlSize, MAX_OVERLAYS};
pub use task::{OverlayAction, OverlayOp, ReloadMask, TaskOverlays, MAX_TASK_SLOTS};
pub use system::OverlaySystem;
