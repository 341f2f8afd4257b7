//! Scriptable scheduler double.

use std::boxed::Box;

use crate::scheduler::Scheduler;

/// Yields after which a spinning test is assumed to be stuck.
const YIELD_LIMIT: u32 = 10_000;

/// Scheduler that counts calls and runs an optional hook on every yield.
///
/// The hook receives the running yield count; tests use it to resume a
/// suspended DMA engine after a few scheduling points.
#[derive(Default)]
pub struct SimScheduler<'a> {
    yields: u32,
    notifications: u32,
    reloads: u32,
    suspend_depth: u32,
    suspend_scopes: u32,
    on_yield: Option<Box<dyn FnMut(u32) + 'a>>,
}

impl<'a> SimScheduler<'a> {
    /// Scheduler without a yield hook.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduler running `hook` on every yield.
    #[must_use]
    pub fn with_yield_hook(hook: impl FnMut(u32) + 'a) -> Self {
        Self {
            on_yield: Some(Box::new(hook)),
            ..Self::default()
        }
    }

    /// Number of yields.
    #[must_use]
    pub fn yields(&self) -> u32 {
        self.yields
    }

    /// Number of "DMA suspended" notifications raised.
    #[must_use]
    pub fn notifications(&self) -> u32 {
        self.notifications
    }

    /// Number of forced reloads requested.
    #[must_use]
    pub fn reloads(&self) -> u32 {
        self.reloads
    }

    /// Current "suspend all" nesting depth.
    #[must_use]
    pub fn suspend_depth(&self) -> u32 {
        self.suspend_depth
    }

    /// Number of "suspend all" scopes entered.
    #[must_use]
    pub fn suspend_scopes(&self) -> u32 {
        self.suspend_scopes
    }
}

impl Scheduler for SimScheduler<'_> {
    fn yield_now(&mut self) {
        self.yields += 1;
        assert!(self.yields < YIELD_LIMIT, "scheduler spun {YIELD_LIMIT} times");
        if let Some(hook) = self.on_yield.as_mut() {
            hook(self.yields);
        }
    }

    fn notify_dma_suspended(&mut self) {
        self.notifications += 1;
    }

    fn suspend_all(&mut self) {
        self.suspend_depth += 1;
        self.suspend_scopes += 1;
    }

    fn resume_all(&mut self) {
        assert!(self.suspend_depth > 0, "resume_all without suspend_all");
        self.suspend_depth -= 1;
    }

    fn request_reload(&mut self) {
        self.reloads += 1;
    }
}
