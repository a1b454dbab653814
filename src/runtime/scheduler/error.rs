//! Scheduler errors

use std::io;
use std::time::Duration;

use crate::runtime::scheduler::task::{TaskError, TaskId};
use crate::runtime::selector::Descriptor;

/// Errors surfaced by scheduler operations and selectors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Extension hook the scheduler does not provide.
    #[error("`{operation}` is not implemented by this scheduler")]
    Unimplemented { operation: &'static str },

    /// The selector failed while waiting on a descriptor.
    #[error("selector failed on {descriptor}: {source}")]
    Selector {
        descriptor: Descriptor,
        #[source]
        source: io::Error,
    },

    /// The descriptor was closed under a waiting task.
    #[error("{descriptor} was closed while a task waited on it")]
    Closed { descriptor: Descriptor },

    /// The wait gave up before the descriptor became ready.
    #[error("timed out after {timeout:?} waiting on {descriptor}")]
    Timeout {
        descriptor: Descriptor,
        timeout: Duration,
    },

    /// The poll itself failed.
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    /// The poll was interrupted by a signal; retrying is safe.
    #[error("poll interrupted by a signal")]
    Interrupted,

    /// The task or the drain was cancelled from outside.
    #[error("cancelled")]
    Cancelled,

    /// A blocking operation was called where no task can be suspended.
    #[error("`{operation}` called outside of a scheduled task")]
    NotInTask { operation: &'static str },

    /// The task already has a registered blocker.
    #[error("{task} is already waiting on {descriptor}")]
    AlreadyWaiting {
        task: TaskId,
        descriptor: Descriptor,
    },

    /// The selector was polled from a context that does not own it.
    #[error("selector polled outside of its controlling context")]
    ForeignPoll,

    #[error(transparent)]
    Task(#[from] TaskError),
}

impl SchedulerError {
    /// The wait expired rather than failed.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, SchedulerError::Timeout { .. })
    }

    /// Retrying the same call is expected to succeed.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Interrupted)
    }

    /// Someone gave up on the task, as opposed to the task failing.
    #[inline]
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            SchedulerError::Cancelled | SchedulerError::Task(TaskError::Abandoned(_))
        )
    }
}

/// Scheduler result type.
pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;
