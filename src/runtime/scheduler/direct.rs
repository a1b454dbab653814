//! Scheduler with direct buffer I/O.
//!
//! When the selector can perform the read or write itself, going through
//! [`DirectScheduler::io_read`]/[`DirectScheduler::io_write`] saves the
//! readiness round trip of `io_wait` followed by a manual syscall, and the
//! spurious-wakeup retry that comes with it.

use std::ops::Deref;
use std::time::Duration;

use super::{Blocking, Result, Scheduler, SchedulerConfig};
use crate::runtime::selector::{Descriptor, EventSelector, Selector};

/// A [`Scheduler`] with buffer-level read and write operations.
///
/// Dereferences to the base scheduler for everything else.
#[derive(Debug)]
pub struct DirectScheduler<S: Selector = EventSelector> {
    base: Scheduler<S>,
}

impl DirectScheduler<EventSelector> {
    /// Create a direct scheduler with a default selector bound to the caller.
    #[inline]
    pub fn new() -> Self {
        Self {
            base: Scheduler::new(),
        }
    }

    /// Create a direct scheduler with a default selector and custom configuration.
    #[inline]
    pub fn from_config(config: SchedulerConfig) -> Self {
        Self {
            base: Scheduler::from_config(config),
        }
    }
}

impl Default for DirectScheduler<EventSelector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Selector> DirectScheduler<S> {
    /// Create a direct scheduler around a supplied selector.
    #[inline]
    pub fn with_selector(selector: S) -> Self {
        Self {
            base: Scheduler::with_selector(selector),
        }
    }

    /// Create a direct scheduler around a supplied selector with custom configuration.
    #[inline]
    pub fn with_config(
        selector: S,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            base: Scheduler::with_config(selector, config),
        }
    }

    /// Read at least `length` bytes into `buffer` (whatever is available
    /// when `length` is zero), suspending the current task as needed.
    ///
    /// Returns the number of bytes read; `0` means end of stream.
    pub fn io_read(
        &self,
        descriptor: Descriptor,
        buffer: &mut [u8],
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let (task, _registration) = self.base.register("io_read", descriptor)?;
        self.base
            .selector
            .wait_for_read(task, descriptor, buffer, length, timeout)
    }

    /// Write at least `length` bytes of `buffer` (whatever fits when
    /// `length` is zero), suspending the current task as needed.
    ///
    /// Returns the number of bytes written.
    pub fn io_write(
        &self,
        descriptor: Descriptor,
        buffer: &[u8],
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let (task, _registration) = self.base.register("io_write", descriptor)?;
        self.base
            .selector
            .wait_for_write(task, descriptor, buffer, length, timeout)
    }

    /// Unwrap the base scheduler.
    #[inline]
    pub fn into_inner(self) -> Scheduler<S> {
        self.base
    }
}

impl<S: Selector> Deref for DirectScheduler<S> {
    type Target = Scheduler<S>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl<S: Selector> Blocking for DirectScheduler<S> {}
