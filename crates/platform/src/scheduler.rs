//! RTOS scheduler hooks used by the memory subsystem.
//!
//! The kernel itself (task creation, context switch, priority queues) lives
//! elsewhere; the overlay code only needs the handful of primitives below.

/// Scheduler collaborator.
pub trait Scheduler {
    /// Give up the CPU until the next scheduling point.
    fn yield_now(&mut self);

    /// Raise the "DMA suspended" notification to the application.
    fn notify_dma_suspended(&mut self);

    /// Enter a "suspend all tasks" scope.
    fn suspend_all(&mut self);

    /// Leave a "suspend all tasks" scope.
    fn resume_all(&mut self);

    /// Force the current task to be reloaded (and yield) so a changed
    /// overlay list takes effect.
    fn request_reload(&mut self);
}
