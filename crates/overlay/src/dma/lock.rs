//! DMA suspend/lock counters.
//!
//! Applications *suspend* DMA when they need external memory left alone
//! (e.g. around a power transition); the OS *locks* DMA while a paging load
//! is in flight so a suspension cannot land halfway through it. Both are
//! reference counts and must be balanced per caller.
//!
//! All state lives behind one critical-section mutex; halts happen only
//! after the section is left. The transfer engine reuses the same section
//! per burst so a suspension is observed atomically with issuing the burst.

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

/// Snapshot of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaLockState {
    /// Outstanding OS locks.
    pub lock_count: u16,
    /// Outstanding application suspensions.
    pub suspend_count: u16,
    /// Set from the first suspension until the final resume.
    pub notice_pending: bool,
}

/// Result of a suspension request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SuspendOutcome {
    /// A lock is held and no override was requested.
    Denied,
    /// Granted; DMA was already suspended.
    Granted,
    /// Granted; this request suspended DMA.
    GrantedFirst,
}

impl SuspendOutcome {
    /// `true` unless denied.
    pub fn granted(self) -> bool {
        !matches!(self, Self::Denied)
    }
}

/// Process-wide suspend/lock state.
pub struct DmaLock {
    state: Mutex<CriticalSectionRawMutex, Cell<DmaLockState>>,
}

impl Default for DmaLock {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaLock {
    /// Unlocked, not suspended.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(Cell::new(DmaLockState {
                lock_count: 0,
                suspend_count: 0,
                notice_pending: false,
            })),
        }
    }

    /// Run `f` on the counters inside the critical section.
    pub(crate) fn critical<R>(&self, f: impl FnOnce(&mut DmaLockState) -> R) -> R {
        self.state.lock(|cell| {
            let mut state = cell.get();
            let out = f(&mut state);
            cell.set(state);
            out
        })
    }

    /// Current counters.
    pub fn snapshot(&self) -> DmaLockState {
        self.state.lock(Cell::get)
    }

    /// Forbid suspension until the matching [`unlock`](Self::unlock).
    pub fn lock(&self) {
        let ok = self.critical(|s| match s.lock_count.checked_add(1) {
            Some(n) => {
                s.lock_count = n;
                true
            }
            None => false,
        });
        if !ok {
            halt!("DMA lock count overflow");
        }
    }

    /// Release one lock. Halts when no lock is held.
    pub fn unlock(&self) {
        let ok = self.critical(|s| match s.lock_count.checked_sub(1) {
            Some(n) => {
                s.lock_count = n;
                true
            }
            None => false,
        });
        if !ok {
            halt!("DMA unlock without lock");
        }
    }

    /// Lock for the lifetime of the returned guard.
    pub fn guard(&self) -> LockGuard<'_> {
        self.lock();
        LockGuard { lock: self }
    }

    /// Request suspension. Denied while a lock is held unless
    /// `override_lock` is set.
    pub fn suspend(&self, override_lock: bool) -> SuspendOutcome {
        let outcome = self.critical(|s| {
            if s.lock_count > 0 && !override_lock {
                return Some(SuspendOutcome::Denied);
            }
            let n = s.suspend_count.checked_add(1)?;
            s.suspend_count = n;
            if n == 1 {
                s.notice_pending = true;
                Some(SuspendOutcome::GrantedFirst)
            } else {
                Some(SuspendOutcome::Granted)
            }
        });
        let Some(outcome) = outcome else {
            halt!("DMA suspend count overflow");
        };
        match outcome {
            SuspendOutcome::Denied => debug!("DMA suspend denied: lock held"),
            SuspendOutcome::GrantedFirst => info!("DMA suspended"),
            SuspendOutcome::Granted => {}
        }
        outcome
    }

    /// Release one suspension. Returns `true` when this was the last one.
    /// Halts when DMA is not suspended.
    pub fn resume(&self) -> bool {
        let last = self.critical(|s| {
            let n = s.suspend_count.checked_sub(1)?;
            s.suspend_count = n;
            if n == 0 {
                s.notice_pending = false;
            }
            Some(n == 0)
        });
        let Some(last) = last else {
            halt!("DMA resume without suspend");
        };
        if last {
            info!("DMA resumed");
        }
        last
    }

    /// `true` while any suspension is outstanding.
    pub fn is_suspended(&self) -> bool {
        self.snapshot().suspend_count > 0
    }

    /// `true` from the first suspension until the final resume.
    pub fn notice_pending(&self) -> bool {
        self.snapshot().notice_pending
    }

    /// Outstanding locks.
    pub fn lock_count(&self) -> u16 {
        self.snapshot().lock_count
    }

    /// Outstanding suspensions.
    pub fn suspend_count(&self) -> u16 {
        self.snapshot().suspend_count
    }
}

/// Holds one DMA lock; releases it on drop.
pub struct LockGuard<'l> {
    lock: &'l DmaLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_denied_while_locked() {
        let lock = DmaLock::new();
        lock.lock();
        assert_eq!(lock.suspend(false), SuspendOutcome::Denied);
        assert!(!lock.is_suspended(), "denied request must not count");
        assert_eq!(lock.suspend(true), SuspendOutcome::GrantedFirst, "override bypasses lock");
        assert!(lock.resume());
        lock.unlock();
    }

    #[test]
    fn notice_spans_first_suspend_to_last_resume() {
        let lock = DmaLock::new();
        assert_eq!(lock.suspend(false), SuspendOutcome::GrantedFirst);
        assert_eq!(lock.suspend(false), SuspendOutcome::Granted);
        assert!(lock.notice_pending());
        assert!(!lock.resume(), "one suspension still outstanding");
        assert!(lock.notice_pending());
        assert!(lock.resume());
        assert!(!lock.notice_pending());
        assert!(!lock.is_suspended());
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = DmaLock::new();
        {
            let _guard = lock.guard();
            assert_eq!(lock.lock_count(), 1);
            assert!(!lock.suspend(false).granted());
        }
        assert_eq!(lock.lock_count(), 0);
        assert!(lock.suspend(false).granted());
    }

    #[test]
    #[should_panic(expected = "unlock without lock")]
    fn unbalanced_unlock_halts() {
        DmaLock::new().unlock();
    }

    #[test]
    #[should_panic(expected = "resume without suspend")]
    fn unbalanced_resume_halts() {
        DmaLock::new().resume();
    }
}
