//! DMA engine model moving bytes between physical DMEM and external memory.

use std::cell::RefCell;
use std::rc::Rc;
use std::vec::Vec;

use super::SimExternal;
use crate::dma::{DmaBurst, DmaController, DmaDirection};

/// Simulated DMA engine.
pub struct SimDma {
    dmem: Rc<RefCell<Vec<u8>>>,
    external: SimExternal,
    nack_supported: bool,
    nack_next: u32,
    nack_flag: bool,
    bursts: Vec<DmaBurst>,
    fabric_on: bool,
    fabric_toggles: Vec<bool>,
    idle_waits: u32,
}

impl SimDma {
    /// Engine over the given DMEM backing store and external memory.
    #[must_use]
    pub fn new(dmem: Rc<RefCell<Vec<u8>>>, external: SimExternal, nack_supported: bool) -> Self {
        Self {
            dmem,
            external,
            nack_supported,
            nack_next: 0,
            nack_flag: false,
            bursts: Vec::new(),
            fabric_on: true,
            fabric_toggles: Vec::new(),
            idle_waits: 0,
        }
    }

    /// NACK the next `count` bursts (they move no data).
    pub fn inject_nacks(&mut self, count: u32) {
        self.nack_next = count;
    }

    /// Every burst issued so far, in order.
    #[must_use]
    pub fn bursts(&self) -> &[DmaBurst] {
        &self.bursts
    }

    /// Forget recorded bursts.
    pub fn clear_bursts(&mut self) {
        self.bursts.clear();
    }

    /// `true` while the external fabric is powered.
    #[must_use]
    pub fn fabric_on(&self) -> bool {
        self.fabric_on
    }

    /// Every fabric power change, in order.
    #[must_use]
    pub fn fabric_toggles(&self) -> &[bool] {
        &self.fabric_toggles
    }

    /// Number of `wait_idle` calls.
    #[must_use]
    pub fn idle_waits(&self) -> u32 {
        self.idle_waits
    }

    /// Bytes of physical DMEM at `addr`.
    #[must_use]
    pub fn dmem_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        let start = addr as usize;
        self.dmem.borrow()[start..start + len].to_vec()
    }

    /// Overwrite physical DMEM at `addr`.
    pub fn set_dmem_bytes(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        self.dmem.borrow_mut()[start..start + data.len()].copy_from_slice(data);
    }
}

impl DmaController for SimDma {
    fn issue(&mut self, burst: DmaBurst) {
        self.bursts.push(burst);
        if self.nack_next > 0 {
            self.nack_next -= 1;
            self.nack_flag = true;
            return;
        }
        let start = burst.mem_addr as usize;
        let range = start..start + burst.size as usize;
        match burst.direction {
            DmaDirection::Read => {
                self.external
                    .read(burst.ext_addr, &mut self.dmem.borrow_mut()[range]);
            }
            DmaDirection::Write => {
                self.external.write(burst.ext_addr, &self.dmem.borrow()[range]);
            }
        }
    }

    fn wait_idle(&mut self) {
        self.idle_waits += 1;
    }

    fn nack_supported(&self) -> bool {
        self.nack_supported
    }

    fn take_nack(&mut self) -> bool {
        core::mem::take(&mut self.nack_flag)
    }

    fn set_fabric_power(&mut self, on: bool) {
        self.fabric_on = on;
        self.fabric_toggles.push(on);
    }
}
