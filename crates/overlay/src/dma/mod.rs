//! DMA transfer engine.
//!
//! Splits a byte range into the largest power-of-two bursts the hardware
//! accepts and issues them one at a time, each inside the DMA lock's
//! critical section so an application suspension is never raced.
//!
//! # Suspension wait
//!
//! ```text
//! ┌─ critical section ─┐            ┌─ critical section ─┐
//! │ suspended?  yes ───┼─► notify ─►│ suspended?  no     │
//! └────────────────────┘   yield    │ issue burst        │
//!          ▲                 │      │ (wait + NACK check)│
//!          └─────────────────┘      └────────────────────┘
//! ```

mod lock;

pub use lock::{DmaLock, DmaLockState, LockGuard, SuspendOutcome};

use platform::{DmaBurst, DmaController, DmaDirection, MemDesc, Scheduler};

use crate::config::DmaConfig;
use crate::error::DmaError;

/// Burst issued, or DMA suspended and nothing issued.
enum BurstAttempt {
    Issued { nack: bool },
    Suspended,
}

/// Chunking DMA front end sharing a [`DmaLock`] with the loaders.
pub struct DmaEngine<'l, C: DmaController> {
    ctrl: C,
    lock: &'l DmaLock,
    config: DmaConfig,
}

impl<'l, C: DmaController> DmaEngine<'l, C> {
    /// Wrap a controller.
    pub fn new(ctrl: C, lock: &'l DmaLock, config: DmaConfig) -> Self {
        Self { ctrl, lock, config }
    }

    /// The wrapped controller.
    pub fn controller(&self) -> &C {
        &self.ctrl
    }

    /// The wrapped controller, mutably.
    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.ctrl
    }

    /// Shared suspend/lock state.
    pub fn lock(&self) -> &'l DmaLock {
        self.lock
    }

    /// Copy `len` bytes from `desc + offset` into on-chip memory at `buffer`.
    pub fn read<S: Scheduler>(
        &mut self,
        sched: &mut S,
        buffer: u32,
        desc: &MemDesc,
        offset: u32,
        len: u32,
    ) -> Result<(), DmaError> {
        self.transfer(sched, buffer, desc, offset, len, DmaDirection::Read)
    }

    /// Copy `len` bytes from on-chip memory at `buffer` out to `desc + offset`.
    pub fn write<S: Scheduler>(
        &mut self,
        sched: &mut S,
        buffer: u32,
        desc: &MemDesc,
        offset: u32,
        len: u32,
    ) -> Result<(), DmaError> {
        self.transfer(sched, buffer, desc, offset, len, DmaDirection::Write)
    }

    /// Move `len` bytes between `buffer` and `desc + offset`.
    ///
    /// Either the whole range moves and `Ok` is returned, or an error is
    /// returned; a failed transfer cannot be resumed. Validation errors are
    /// reported before any burst is issued.
    pub fn transfer<S: Scheduler>(
        &mut self,
        sched: &mut S,
        buffer: u32,
        desc: &MemDesc,
        offset: u32,
        len: u32,
        direction: DmaDirection,
    ) -> Result<(), DmaError> {
        let ext = desc
            .address()
            .checked_add(u64::from(offset))
            .filter(|ext| ext.checked_add(u64::from(len)).is_some())
            .ok_or(DmaError::InvalidArgument)?;

        if self.config.region_check && !self.region_allowed(desc.region) {
            warn!("DMA region {} rejected", desc.region);
            return Err(DmaError::UnexpectedChannel);
        }

        let (min, max) = match direction {
            DmaDirection::Read => (self.config.read_min_burst, self.config.read_max_burst),
            DmaDirection::Write => (self.config.write_min_burst, self.config.write_max_burst),
        };
        #[allow(clippy::cast_possible_truncation)] // only the low bits matter
        let ext_low = ext as u32;
        if (ext_low | buffer | len) & min.wrapping_sub(1) != 0 {
            debug!("DMA misaligned: ext {} buf {} len {}", ext_low, buffer, len);
            return Err(DmaError::AlignmentError);
        }

        let mut mem_addr = buffer;
        let mut ext_addr = ext;
        let mut remaining = len;
        while remaining > 0 {
            let size = burst_size(mem_addr, ext_addr, remaining, min, max);
            let burst = DmaBurst {
                direction,
                mem_addr,
                ext_addr,
                size,
                region: desc.region,
            };
            self.issue(sched, burst)?;
            mem_addr = mem_addr.wrapping_add(size);
            ext_addr = ext_addr.wrapping_add(u64::from(size));
            remaining = remaining.saturating_sub(size);
        }

        if !self.ctrl.nack_supported() {
            self.ctrl.wait_idle();
        }
        trace!("DMA moved {} bytes", len);
        Ok(())
    }

    /// Request suspension; the first granted suspension powers the external
    /// fabric down.
    pub fn suspend(&mut self, override_lock: bool) -> bool {
        let outcome = self.lock.suspend(override_lock);
        if outcome == SuspendOutcome::GrantedFirst {
            self.ctrl.set_fabric_power(false);
        }
        outcome.granted()
    }

    /// Release a suspension; the final release powers the fabric back up.
    pub fn resume(&mut self) -> bool {
        let last = self.lock.resume();
        if last {
            self.ctrl.set_fabric_power(true);
        }
        last
    }

    fn region_allowed(&self, region: u8) -> bool {
        region < 8 && self.config.allowed_regions & (1u8 << region) != 0
    }

    /// Issue one burst, waiting out any suspension.
    fn issue<S: Scheduler>(&mut self, sched: &mut S, burst: DmaBurst) -> Result<(), DmaError> {
        let mut notified = false;
        loop {
            let ctrl = &mut self.ctrl;
            let attempt = self.lock.critical(|state| {
                if state.suspend_count > 0 {
                    return BurstAttempt::Suspended;
                }
                ctrl.issue(burst);
                let nack = ctrl.nack_supported() && {
                    ctrl.wait_idle();
                    ctrl.take_nack()
                };
                BurstAttempt::Issued { nack }
            });
            match attempt {
                BurstAttempt::Issued { nack: false } => return Ok(()),
                BurstAttempt::Issued { nack: true } => {
                    warn!("DMA NACK at {}", burst.mem_addr);
                    return Err(DmaError::Nack);
                }
                BurstAttempt::Suspended => {
                    if !notified {
                        debug!("DMA blocked by suspension");
                        sched.notify_dma_suspended();
                        notified = true;
                    }
                    sched.yield_now();
                }
            }
        }
    }
}

/// Largest power-of-two burst in `[min, max]` that both addresses are aligned
/// to and that does not overrun `remaining`.
fn burst_size(mem_addr: u32, ext_addr: u64, remaining: u32, min: u32, max: u32) -> u32 {
    let mut size = max;
    while size > min
        && (size > remaining
            || mem_addr & size.wrapping_sub(1) != 0
            || ext_addr & u64::from(size.wrapping_sub(1)) != 0)
    {
        size >>= 1;
    }
    size
}
