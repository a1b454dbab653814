//! Event selectors
//!
//! A selector performs the actual non-blocking I/O polling and timer
//! bookkeeping, and resumes tasks when what they wait for happens. The
//! scheduler only talks to it through the [`Selector`] trait.
//!
//! - [`Selector`] - the operations every selector provides
//! - [`IoClose`] - optional capability for cancelling waits on a descriptor
//! - [`Notify`] - wakes a selector blocked in a poll from another thread
//! - [`EventSelector`](event::EventSelector) - the default `poll(2)` selector
//!
//! Wait operations (`wait_for_io`, `wait_for_read`, `wait_for_write`,
//! `defer`) are called by the waiting task itself and suspend it before
//! returning. A selector must never hold one of its own locks across a
//! suspension or a resume.

pub mod event;

pub use event::EventSelector;

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::runtime::scheduler::error::{Result, SchedulerError};
use crate::runtime::scheduler::task::{Resumption, Task, TaskId};

bitflags::bitflags! {
    /// Readiness events, using the `poll(2)` event bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: i16 {
        const READABLE = libc::POLLIN;
        const PRIORITY = libc::POLLPRI;
        const WRITABLE = libc::POLLOUT;
    }
}

/// An OS-level I/O handle a task can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor(pub RawFd);

impl Descriptor {
    /// Descriptor of anything exposing a raw fd.
    #[inline]
    pub fn of(io: &impl AsRawFd) -> Self {
        Self(io.as_raw_fd())
    }

    /// Get the raw fd.
    #[inline]
    pub fn raw(&self) -> RawFd {
        self.0
    }
}

impl From<RawFd> for Descriptor {
    fn from(fd: RawFd) -> Self {
        Self(fd)
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// The execution context that owns a scheduler and its selector.
///
/// Captured at construction: the constructing thread, plus the task running
/// on it if the scheduler was built from inside a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controller {
    thread: ThreadId,
    task: Option<TaskId>,
}

impl Controller {
    /// The calling context.
    pub fn current() -> Self {
        Self {
            thread: thread::current().id(),
            task: Task::current().map(|task| task.id()),
        }
    }

    /// Whether the calling context is this controller.
    #[inline]
    pub fn is_current(&self) -> bool {
        *self == Self::current()
    }

    #[inline]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    #[inline]
    pub fn task(&self) -> Option<TaskId> {
        self.task
    }
}

/// Operations the scheduler consumes from an event selector.
pub trait Selector: Send + Sync {
    /// Suspend `task` until `descriptor` reports any of `interest`.
    ///
    /// Returns the events that fired. Expiry of `timeout` is reported as
    /// [`SchedulerError::Timeout`].
    fn wait_for_io(
        &self,
        task: Task,
        descriptor: Descriptor,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<Interest>;

    /// Read at least `length` bytes into `buffer` (any amount when `length`
    /// is zero), suspending `task` whenever the descriptor is not readable.
    /// Returns the number of bytes read; `0` means end of stream.
    fn wait_for_read(
        &self,
        task: Task,
        descriptor: Descriptor,
        buffer: &mut [u8],
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<usize>;

    /// Write at least `length` bytes of `buffer` (any amount when `length`
    /// is zero), suspending `task` whenever the descriptor is not writable.
    fn wait_for_write(
        &self,
        task: Task,
        descriptor: Descriptor,
        buffer: &[u8],
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<usize>;

    /// Suspend `task` and resume it on a later poll, no earlier than
    /// `duration` from now when one is given.
    fn defer(
        &self,
        task: Task,
        duration: Option<Duration>,
    ) -> Result<()>;

    /// Start or continue `task`.
    fn resume(
        &self,
        task: Task,
    ) -> Result<()>;

    /// Whether the selector holds tasks it will resume without any I/O
    /// readiness (deferred tasks and timers).
    fn has_pending_work(&self) -> bool;

    /// Wait up to `timeout` (forever when `None`) for events and resume the
    /// affected tasks. Returns how many tasks were resumed.
    fn poll(
        &self,
        timeout: Option<Duration>,
    ) -> Result<usize>;

    /// Resume every task the selector still holds with
    /// [`Resumption::Cancelled`]. Returns how many were resumed.
    fn cancel_all(&self) -> Result<usize>;

    /// The close capability, when the selector has one.
    fn io_closer(&self) -> Option<&dyn IoClose> {
        None
    }

    /// A handle that makes a blocked [`poll`](Self::poll) return early.
    ///
    /// Selectors whose polls never block may keep the default.
    fn notifier(&self) -> Option<Arc<dyn Notify>> {
        None
    }
}

/// Wakes a selector out of a blocking poll from any thread.
pub trait Notify: Send + Sync {
    fn notify(&self) -> io::Result<()>;
}

/// Selectors that can cancel every wait on a descriptor being closed.
pub trait IoClose: Send + Sync {
    /// Wake every task waiting on `descriptor` with [`SchedulerError::Closed`].
    fn cancel_io(
        &self,
        descriptor: Descriptor,
    ) -> Result<()>;
}

/// Turn the value a waiting task was resumed with into the result of its
/// readiness wait.
///
/// A plain `Resumed` is a spurious wake-up and reports no events.
pub fn readiness(
    resumption: Resumption,
    descriptor: Descriptor,
    timeout: Option<Duration>,
) -> Result<Interest> {
    match resumption {
        Resumption::Ready(events) => Ok(events),
        Resumption::Start | Resumption::Resumed => Ok(Interest::empty()),
        Resumption::TimedOut => Err(SchedulerError::Timeout {
            descriptor,
            timeout: timeout.unwrap_or_default(),
        }),
        Resumption::Closed => Err(SchedulerError::Closed { descriptor }),
        Resumption::Failed(source) => Err(SchedulerError::Selector { descriptor, source }),
        Resumption::Cancelled => Err(SchedulerError::Cancelled),
    }
}

/// Result of a deferred task's wake-up; only cancellation is an error.
pub fn wake(resumption: Resumption) -> Result<()> {
    match resumption {
        Resumption::Cancelled => Err(SchedulerError::Cancelled),
        Resumption::Failed(source) => Err(SchedulerError::Poll(source)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests;
