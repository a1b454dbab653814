//! Task definitions for the scheduler.
//!
//! A task is an asymmetric coroutine. Its body runs on a dedicated carrier
//! thread, but control is handed back and forth over channels so the
//! resumer and the task never run at the same time:
//!
//! ```text
//! resumer                        carrier thread
//!   resume(value) ───Resume───▶  body runs
//!   (parked)                     Task::suspend()
//!   ◀──Yield::Suspended───────   (parked)
//! ```
//!
//! The carrier thread only exists to give the body its own stack. Nothing
//! here is preemptive: a task gives up control exclusively by calling
//! [`Task::suspend`] or by returning.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::runtime::selector::Interest;

/// Default stack size for task carrier threads (256 KiB).
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

static NEXT_TASK_ID: AtomicUsize = AtomicUsize::new(1);

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

impl TaskId {
    /// Allocate a fresh, process-wide unique ID.
    #[inline]
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> usize {
        self.0
    }
}

impl From<TaskId> for usize {
    fn from(val: TaskId) -> Self {
        val.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, body not started yet.
    Created,
    /// Task currently holds control.
    Running,
    /// Parked inside [`Task::suspend`].
    Suspended,
    /// Body returned or panicked.
    Finished,
}

impl TaskState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => TaskState::Created,
            1 => TaskState::Running,
            2 => TaskState::Suspended,
            _ => TaskState::Finished,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            TaskState::Created => 0,
            TaskState::Running => 1,
            TaskState::Suspended => 2,
            TaskState::Finished => 3,
        }
    }
}

/// Value handed to a task when it is resumed.
///
/// Selectors pick the variant; the blocking call that suspended the task
/// turns it into a result for its caller.
#[derive(Debug)]
pub enum Resumption {
    /// First resume of a freshly created task.
    Start,
    /// Plain wake-up (deferred task, expired sleep, explicit resume).
    Resumed,
    /// The descriptor became ready with the given events.
    Ready(Interest),
    /// The wait deadline passed first.
    TimedOut,
    /// The descriptor was closed while the task waited on it.
    Closed,
    /// The selector failed on the task's behalf.
    Failed(io::Error),
    /// The owner gave up on the task.
    Cancelled,
}

/// How a task body ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The body returned `Ok`.
    Completed,
    /// The body returned an error, rendered with its causes.
    Failed(String),
    /// The body panicked with the given message.
    Panicked(String),
}

/// Errors raised by the suspend/resume primitive itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Resume attempted on a task that is not parked.
    #[error("{task} cannot be resumed while {state:?}")]
    NotSuspended { task: TaskId, state: TaskState },

    /// `suspend` called from code that is not running inside a task.
    #[error("suspend called outside of a task")]
    NotInTask,

    /// Every handle was dropped while the task was parked.
    #[error("{0} was abandoned while suspended")]
    Abandoned(TaskId),

    /// The carrier thread went away without reporting back.
    #[error("{0} carrier thread is gone")]
    Dead(TaskId),

    /// The carrier thread could not be started.
    #[error("failed to spawn carrier thread: {0}")]
    Spawn(String),
}

type Body = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Resumer → task.
struct Resume {
    task: Task,
    value: Resumption,
    reply: Sender<Yield>,
}

/// Task → resumer.
enum Yield {
    Suspended,
    Finished,
}

struct TaskInner {
    id: TaskId,
    name: String,
    state: AtomicU8,
    resume_tx: Sender<Resume>,
    outcome: Mutex<Option<TaskOutcome>>,
}

/// Handle to a cooperatively scheduled task.
///
/// Cloning is cheap; all clones refer to the same task. Once every handle is
/// gone a parked task is abandoned and its pending `suspend` fails.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl std::fmt::Debug for Task {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Task {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Task {}

/// State of the task currently running on this carrier thread.
struct Context {
    task: Task,
    inbox: Receiver<Resume>,
    reply: Sender<Yield>,
}

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

impl Task {
    /// Create a task with default options. The body does not run until the
    /// first [`resume`](Self::resume).
    pub fn spawn<F>(body: F) -> Result<Self, TaskError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        TaskBuilder::new().build(body)
    }

    /// The task whose body is running on the calling thread, if any.
    pub fn current() -> Option<Task> {
        CONTEXT.with(|cx| cx.borrow().as_ref().map(|cx| cx.task.clone()))
    }

    /// Park the calling task and hand control back to its resumer.
    ///
    /// Returns the value passed to the next [`resume`](Self::resume).
    pub fn suspend() -> Result<Resumption, TaskError> {
        let Context { task, inbox, reply } = CONTEXT
            .with(|cx| cx.borrow_mut().take())
            .ok_or(TaskError::NotInTask)?;

        let id = task.id();
        task.set_state(TaskState::Suspended);
        // A parked task must not keep itself alive.
        drop(task);

        if reply.send(Yield::Suspended).is_err() {
            trace!(task = %id, "resumer left before the handoff");
        }
        drop(reply);

        match inbox.recv() {
            Ok(Resume { task, value, reply }) => {
                CONTEXT.with(|cx| *cx.borrow_mut() = Some(Context { task, inbox, reply }));
                Ok(value)
            }
            Err(_) => Err(TaskError::Abandoned(id)),
        }
    }

    /// Run the task until it suspends again or finishes.
    ///
    /// Only a `Created` or `Suspended` task can be resumed, so every
    /// suspension is matched by at most one resume.
    pub fn resume(
        &self,
        value: Resumption,
    ) -> Result<TaskState, TaskError> {
        self.inner
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                match TaskState::from_u8(current) {
                    TaskState::Created | TaskState::Suspended => Some(TaskState::Running.as_u8()),
                    _ => None,
                }
            })
            .map_err(|current| TaskError::NotSuspended {
                task: self.id(),
                state: TaskState::from_u8(current),
            })?;

        let (reply, handoff) = channel::bounded(1);
        let message = Resume {
            task: self.clone(),
            value,
            reply,
        };
        if self.inner.resume_tx.send(message).is_err() {
            self.set_state(TaskState::Finished);
            return Err(TaskError::Dead(self.id()));
        }

        match handoff.recv() {
            Ok(Yield::Suspended) => Ok(TaskState::Suspended),
            Ok(Yield::Finished) => Ok(TaskState::Finished),
            Err(_) => {
                self.set_state(TaskState::Finished);
                Err(TaskError::Dead(self.id()))
            }
        }
    }

    /// Get the task ID.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Get the task name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    #[inline]
    fn set_state(
        &self,
        state: TaskState,
    ) {
        self.inner.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Check if the task is parked.
    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.state() == TaskState::Suspended
    }

    /// Check if the task is finished.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// How the body ended, once it has.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.inner.outcome.lock().clone()
    }
}

/// Task builder for constructing tasks with various options.
#[derive(Debug, Default)]
pub struct TaskBuilder {
    name: Option<String>,
    prefix: Option<String>,
    stack_size: Option<usize>,
}

impl TaskBuilder {
    /// Create a new task builder.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task name (also used for the carrier thread).
    #[inline]
    pub fn name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name the task `<prefix>-<id>` unless an explicit name is set.
    #[inline]
    pub fn prefix(
        mut self,
        prefix: impl Into<String>,
    ) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the carrier stack size.
    #[inline]
    pub fn stack_size(
        mut self,
        size: usize,
    ) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Build the task and start its (parked) carrier thread.
    pub fn build<F>(
        self,
        body: F,
    ) -> Result<Task, TaskError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let id = TaskId::next();
        let name = self.name.unwrap_or_else(|| {
            let prefix = self.prefix.as_deref().unwrap_or("task");
            format!("{}-{}", prefix, id.inner())
        });
        let stack_size = self.stack_size.unwrap_or(DEFAULT_STACK_SIZE);
        let (resume_tx, inbox) = channel::bounded::<Resume>(1);

        let task = Task {
            inner: Arc::new(TaskInner {
                id,
                name: name.clone(),
                state: AtomicU8::new(TaskState::Created.as_u8()),
                resume_tx,
                outcome: Mutex::new(None),
            }),
        };

        let body: Body = Box::new(body);
        thread::Builder::new()
            .name(name)
            .stack_size(stack_size)
            .spawn(move || carrier_main(id, inbox, body))
            .map_err(|err| TaskError::Spawn(err.to_string()))?;

        Ok(task)
    }
}

fn carrier_main(
    id: TaskId,
    inbox: Receiver<Resume>,
    body: Body,
) {
    let Ok(Resume { task, reply, .. }) = inbox.recv() else {
        trace!(task = %id, "dropped before first resume");
        return;
    };
    CONTEXT.with(|cx| *cx.borrow_mut() = Some(Context { task, inbox, reply }));

    let outcome = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => TaskOutcome::Completed,
        Ok(Err(err)) => {
            warn!(task = %id, "task failed: {:#}", err);
            TaskOutcome::Failed(format!("{:#}", err))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(task = %id, "task panicked: {}", message);
            TaskOutcome::Panicked(message)
        }
    };

    // No context means the task was abandoned mid-suspend; nobody listens.
    let Some(Context { task, reply, .. }) = CONTEXT.with(|cx| cx.borrow_mut().take()) else {
        return;
    };
    *task.inner.outcome.lock() = Some(outcome);
    task.set_state(TaskState::Finished);
    drop(task);
    let _ = reply.send(Yield::Finished);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
