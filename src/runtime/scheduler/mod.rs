//! Cooperative task scheduler
//!
//! The [`Scheduler`] intercepts the operations that would block a task
//! (waiting on a descriptor, sleeping, cross-task blocking), hands them to
//! its [`Selector`] and lets the selector suspend the task until it can
//! continue. [`DirectScheduler`] adds buffer-level read and write.
//!
//! Exactly one task runs at a time. The controlling context (the one that
//! built the scheduler) drives everything through [`Scheduler::close`],
//! which polls the selector until no task is left waiting.
//!
//! While a task is suspended inside an intercepted call it is recorded in
//! the scheduler's waiting set together with the descriptor it blocks on.
//! The entry is owned by a guard, so it disappears on every way out of the
//! call: success, error, timeout, cancellation or unwinding.

pub mod direct;
pub mod error;
pub mod task;

pub use direct::DirectScheduler;
pub use error::{Result, SchedulerError};
pub use task::{Resumption, Task, TaskBuilder, TaskError, TaskId, TaskOutcome, TaskState};

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::runtime::selector::{
    Controller, Descriptor, EventSelector, Interest, IoClose, Notify, Selector,
};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Stack size of task carrier threads.
    #[serde(default = "default_stack_size")]
    pub task_stack_size: usize,
    /// Spawned tasks are named `<prefix>-<id>`.
    #[serde(default = "default_task_prefix")]
    pub task_name_prefix: String,
}

fn default_stack_size() -> usize {
    task::DEFAULT_STACK_SIZE
}

fn default_task_prefix() -> String {
    "fibra-task".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_stack_size: default_stack_size(),
            task_name_prefix: default_task_prefix(),
        }
    }
}

/// Cross-task blocking hooks (mutex/condition-style waits).
///
/// The base scheduler has no blocking primitive of its own: both hooks
/// fail with [`SchedulerError::Unimplemented`] unless a scheduler overrides
/// them.
pub trait Blocking {
    /// Suspend the current task until `blocker` releases it.
    fn block(
        &self,
        blocker: &dyn Any,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let _ = (blocker, timeout);
        Err(SchedulerError::Unimplemented { operation: "block" })
    }

    /// Release `task` from `blocker`.
    fn unblock(
        &self,
        blocker: &dyn Any,
        task: &Task,
    ) -> Result<()> {
        let _ = (blocker, task);
        Err(SchedulerError::Unimplemented { operation: "unblock" })
    }
}

/// Raising it makes [`Scheduler::close`] stop draining, as a clean
/// shutdown. A drain blocked in a poll is woken through the selector's
/// [`Notify`] handle when it has one.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    raised: Arc<AtomicBool>,
    notify: Option<Arc<dyn Notify>>,
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("raised", &self.is_raised())
            .field("notify", &self.notify.is_some())
            .finish()
    }
}

impl InterruptHandle {
    /// Create a lowered handle that wakes nothing.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a lowered handle that wakes `notify` when raised.
    pub fn with_notify(notify: Option<Arc<dyn Notify>>) -> Self {
        Self {
            raised: Arc::new(AtomicBool::new(false)),
            notify,
        }
    }

    /// Request the drain to stop. Safe to call from any thread.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        if let Some(notify) = &self.notify {
            if let Err(err) = notify.notify() {
                warn!("failed to wake the selector: {}", err);
            }
        }
    }

    /// Check if a stop was requested.
    #[inline]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Lower the handle again.
    #[inline]
    pub fn reset(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }
}

/// Bookkeeping shared by every task calling into the scheduler.
#[derive(Debug, Default)]
struct Bookkeeping {
    /// Task → descriptor it is suspended on.
    waiting: HashMap<TaskId, Descriptor>,
    /// Deferred work items. Nothing enqueues here yet.
    pending: VecDeque<Task>,
}

/// A task's entry in the waiting set. Dropping it removes the entry.
pub(crate) struct Registration<'a> {
    state: &'a Mutex<Bookkeeping>,
    task: TaskId,
}

impl<'a> Registration<'a> {
    fn acquire(
        state: &'a Mutex<Bookkeeping>,
        task: TaskId,
        descriptor: Descriptor,
    ) -> Result<Self> {
        let mut guard = state.lock();
        match guard.waiting.entry(task) {
            Entry::Occupied(entry) => Err(SchedulerError::AlreadyWaiting {
                task,
                descriptor: *entry.get(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(descriptor);
                Ok(Self { state, task })
            }
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.state.lock().waiting.remove(&self.task);
    }
}

/// Handle to the close capability of a scheduler's selector.
///
/// Only handed out when the selector supports closing; see
/// [`Scheduler::io_closer`].
pub struct IoCloser<'a> {
    closer: &'a dyn IoClose,
}

impl IoCloser<'_> {
    /// Cancel every wait on `descriptor`; the waiters fail with
    /// [`SchedulerError::Closed`].
    pub fn close(
        &self,
        descriptor: Descriptor,
    ) -> Result<()> {
        debug!(%descriptor, "io_close");
        self.closer.cancel_io(descriptor)
    }
}

/// Cooperative scheduler over a pluggable selector.
pub struct Scheduler<S: Selector = EventSelector> {
    controller: Controller,
    selector: S,
    state: Mutex<Bookkeeping>,
    /// Checked once at construction.
    io_close: bool,
    interrupt: InterruptHandle,
    config: SchedulerConfig,
}

impl<S: Selector> std::fmt::Debug for Scheduler<S> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Scheduler")
            .field("controller", &self.controller)
            .field("waiting", &state.waiting)
            .field("pending", &state.pending.len())
            .field("io_close", &self.io_close)
            .field("config", &self.config)
            .finish()
    }
}

impl Scheduler<EventSelector> {
    /// Create a scheduler with a default selector bound to the caller.
    #[inline]
    pub fn new() -> Self {
        Self::from_config(SchedulerConfig::default())
    }

    /// Create a scheduler with a default selector and custom configuration.
    pub fn from_config(config: SchedulerConfig) -> Self {
        let controller = Controller::current();
        let selector = EventSelector::new(controller.clone());
        Self::build(controller, selector, config)
    }
}

impl Default for Scheduler<EventSelector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Selector> Scheduler<S> {
    /// Create a scheduler around a supplied selector.
    #[inline]
    pub fn with_selector(selector: S) -> Self {
        Self::with_config(selector, SchedulerConfig::default())
    }

    /// Create a scheduler around a supplied selector with custom configuration.
    pub fn with_config(
        selector: S,
        config: SchedulerConfig,
    ) -> Self {
        Self::build(Controller::current(), selector, config)
    }

    fn build(
        controller: Controller,
        selector: S,
        config: SchedulerConfig,
    ) -> Self {
        let io_close = selector.io_closer().is_some();
        let interrupt = InterruptHandle::with_notify(selector.notifier());
        debug!(?controller, io_close, ?interrupt, "scheduler created");

        Self {
            controller,
            selector,
            state: Mutex::new(Bookkeeping::default()),
            io_close,
            interrupt,
            config,
        }
    }

    /// Record the current task as blocked on `descriptor`.
    pub(crate) fn register(
        &self,
        operation: &'static str,
        descriptor: Descriptor,
    ) -> Result<(Task, Registration<'_>)> {
        let task = Task::current().ok_or(SchedulerError::NotInTask { operation })?;
        let registration = Registration::acquire(&self.state, task.id(), descriptor)?;
        trace!(task = %task.id(), %descriptor, operation, "registered");
        Ok((task, registration))
    }

    /// Suspend the current task until `descriptor` reports any of
    /// `interest`, or `timeout` expires.
    ///
    /// Returns the events reported by the selector.
    pub fn io_wait(
        &self,
        descriptor: Descriptor,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<Interest> {
        let (task, _registration) = self.register("io_wait", descriptor)?;
        self.selector.wait_for_io(task, descriptor, interest, timeout)
    }

    /// The close-handle operation, or `None` when the selector cannot
    /// close descriptors.
    pub fn io_closer(&self) -> Option<IoCloser<'_>> {
        if !self.io_close {
            return None;
        }
        self.selector.io_closer().map(|closer| IoCloser { closer })
    }

    /// Yield the current task to the selector and return once it is
    /// resumed. The selector decides how precisely `duration` is honoured.
    pub fn kernel_sleep(
        &self,
        duration: Option<Duration>,
    ) -> Result<()> {
        let task = Task::current().ok_or(SchedulerError::NotInTask {
            operation: "kernel_sleep",
        })?;
        trace!(task = %task.id(), ?duration, "kernel_sleep");
        self.selector.defer(task, duration)
    }

    /// Drain: poll the selector until it has no pending work and no task is
    /// waiting.
    ///
    /// Signal-interrupted polls are retried. Raising the
    /// [`InterruptHandle`], or a poll reporting cancellation, ends the
    /// drain early without error. Tasks still parked at that point stay
    /// parked; call [`shutdown`](Self::shutdown) to cancel them.
    pub fn close(&self) -> Result<()> {
        let mut polls = 0usize;

        while self.selector.has_pending_work() || self.waiting_len() > 0 {
            if self.interrupt.is_raised() {
                info!(waiting = self.waiting_len(), "drain interrupted");
                return Ok(());
            }

            polls += 1;
            match self.selector.poll(None) {
                Ok(resumed) => trace!(polls, resumed, "drain poll"),
                Err(SchedulerError::Interrupted) => {
                    trace!(polls, "poll interrupted, retrying");
                }
                Err(err) if err.is_cancellation() => {
                    info!(waiting = self.waiting_len(), "drain cancelled");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }

        debug!(polls, "scheduler drained");
        Ok(())
    }

    /// Resume every task the selector still holds with a cancellation, so
    /// each blocked call fails with [`SchedulerError::Cancelled`] and the
    /// task can unwind.
    ///
    /// Returns how many tasks were cancelled. Tasks keep the scheduler
    /// alive while they are parked, so this is the way to release an
    /// interrupted scheduler.
    pub fn shutdown(&self) -> Result<usize> {
        let cancelled = self.selector.cancel_all()?;
        info!(cancelled, waiting = self.waiting_len(), "scheduler shut down");
        Ok(cancelled)
    }

    /// Start `body` as a new task and return its handle without waiting for
    /// it to finish.
    pub fn spawn<F>(
        &self,
        body: F,
    ) -> Result<Task>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let task = TaskBuilder::new()
            .prefix(self.config.task_name_prefix.as_str())
            .stack_size(self.config.task_stack_size)
            .build(body)?;
        debug!(task = %task.id(), name = task.name(), "spawn");

        self.selector.resume(task.clone())?;
        Ok(task)
    }

    /// Check if `task` is suspended in an intercepted call.
    pub fn is_waiting(
        &self,
        task: TaskId,
    ) -> bool {
        self.state.lock().waiting.contains_key(&task)
    }

    /// The descriptor `task` is suspended on.
    pub fn waiting_on(
        &self,
        task: TaskId,
    ) -> Option<Descriptor> {
        self.state.lock().waiting.get(&task).copied()
    }

    /// Number of tasks suspended in intercepted calls.
    pub fn waiting_len(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Number of deferred work items.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Get the selector.
    #[inline]
    pub fn selector(&self) -> &S {
        &self.selector
    }

    /// Get the controlling context.
    #[inline]
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Get a handle that stops [`close`](Self::close).
    #[inline]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Get the configuration.
    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

impl<S: Selector> Blocking for Scheduler<S> {}

impl<S: Selector> Drop for Scheduler<S> {
    fn drop(&mut self) {
        let waiting = self.state.get_mut().waiting.len();
        if waiting > 0 {
            warn!(waiting, "scheduler dropped with waiting tasks");
        }
    }
}

#[cfg(test)]
mod tests;
