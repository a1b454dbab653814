//! Default event selector backed by `poll(2)`.
//!
//! Keeps three kinds of parked tasks:
//!
//! - a ready queue of tasks to resume on the next poll,
//! - sleepers with a wake-up deadline,
//! - waiters blocked on a descriptor, optionally with a deadline.
//!
//! Every poll resumes, in that order, the ready queue, expired sleepers,
//! waiters whose descriptor fired and waiters whose deadline passed.
//!
//! A socket pair is always part of the polled set so that
//! [`Notify::notify`] can cut a blocking poll short from another thread.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{readiness, wake, Controller, Descriptor, Interest, IoClose, Notify, Selector};
use crate::runtime::scheduler::error::{Result, SchedulerError};
use crate::runtime::scheduler::task::{Resumption, Task, TaskId, TaskState};

struct Sleeper {
    task: Task,
    deadline: Instant,
}

struct Waiter {
    task: Task,
    descriptor: Descriptor,
    interest: Interest,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct SelectorState {
    ready: VecDeque<Task>,
    sleepers: Vec<Sleeper>,
    waiters: HashMap<TaskId, Waiter>,
}

impl SelectorState {
    fn next_deadline(&self) -> Option<Instant> {
        let sleepers = self.sleepers.iter().map(|sleeper| sleeper.deadline);
        let waiters = self.waiters.values().filter_map(|waiter| waiter.deadline);
        sleepers.chain(waiters).min()
    }

    fn forget(
        &mut self,
        id: TaskId,
    ) {
        self.ready.retain(|task| task.id() != id);
        self.sleepers.retain(|sleeper| sleeper.task.id() != id);
        self.waiters.remove(&id);
    }
}

/// Self-pipe that wakes a blocked poll.
struct WakePipe {
    reader: UnixStream,
    writer: UnixStream,
}

impl WakePipe {
    fn open() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor::of(&self.reader)
    }

    /// Discard every pending wake-up byte.
    fn drain(&self) {
        let mut sink = [0u8; 64];
        loop {
            match (&self.reader).read(&mut sink) {
                Ok(0) => return,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return,
            }
        }
    }
}

impl Notify for WakePipe {
    fn notify(&self) -> io::Result<()> {
        match (&self.writer).write(&[1]) {
            Ok(_) => Ok(()),
            // A full pipe already guarantees a wake-up.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// The default selector, bound to one controlling context.
pub struct EventSelector {
    owner: Controller,
    state: Mutex<SelectorState>,
    wake: Option<Arc<WakePipe>>,
}

impl std::fmt::Debug for EventSelector {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventSelector")
            .field("owner", &self.owner)
            .field("ready", &state.ready.len())
            .field("sleepers", &state.sleepers.len())
            .field("waiters", &state.waiters.len())
            .field("notify", &self.wake.is_some())
            .finish()
    }
}

impl EventSelector {
    /// Create a selector owned by `owner`. Only the owner may poll it.
    ///
    /// If the wake-up pipe cannot be opened the selector still works, but
    /// offers no [`notifier`](Selector::notifier).
    pub fn new(owner: Controller) -> Self {
        let wake = match WakePipe::open() {
            Ok(pipe) => Some(Arc::new(pipe)),
            Err(err) => {
                warn!("no wake-up pipe, polls cannot be interrupted: {}", err);
                None
            }
        };

        Self {
            owner,
            state: Mutex::new(SelectorState::default()),
            wake,
        }
    }

    /// Get the owning context.
    #[inline]
    pub fn owner(&self) -> &Controller {
        &self.owner
    }

    /// Number of tasks parked on descriptors.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Park the current task. Bookkeeping for `id` is dropped whatever the
    /// outcome, so a poll never resumes it a second time.
    fn park(
        &self,
        id: TaskId,
    ) -> Result<Resumption> {
        let resumption = Task::suspend();
        self.state.lock().forget(id);
        Ok(resumption?)
    }

    /// Empty every queue and hand back the tasks that were parked.
    fn take_parked(&self) -> Vec<Task> {
        let state = std::mem::take(&mut *self.state.lock());
        state
            .ready
            .into_iter()
            .chain(state.sleepers.into_iter().map(|sleeper| sleeper.task))
            .chain(state.waiters.into_values().map(|waiter| waiter.task))
            .collect()
    }

    fn wake_all(
        &self,
        wakeups: Vec<(Task, Resumption)>,
    ) {
        for (task, value) in wakeups {
            let id = task.id();
            trace!(task = %id, ?value, "resume");
            if let Err(err) = task.resume(value) {
                warn!(task = %id, "failed to resume: {}", err);
            }
        }
    }

    /// Wait on the descriptor only if it is not ready right now.
    fn ensure_ready(
        &self,
        task: &Task,
        descriptor: Descriptor,
        interest: Interest,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut fds = [sys::pollfd(descriptor, interest)];
        match sys::poll(&mut fds, Some(Duration::ZERO)) {
            Ok(1) => return Ok(()),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(source) => return Err(SchedulerError::Selector { descriptor, source }),
        }

        let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        self.wait_for_io(task.clone(), descriptor, interest, remaining)
            .map_err(|err| match err {
                // Report the caller's timeout, not what was left of it.
                SchedulerError::Timeout { descriptor, .. } => SchedulerError::Timeout {
                    descriptor,
                    timeout: timeout.unwrap_or_default(),
                },
                other => other,
            })?;
        Ok(())
    }
}

impl Selector for EventSelector {
    fn wait_for_io(
        &self,
        task: Task,
        descriptor: Descriptor,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<Interest> {
        let id = task.id();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        self.state.lock().waiters.insert(
            id,
            Waiter {
                task,
                descriptor,
                interest,
                deadline,
            },
        );
        trace!(task = %id, %descriptor, ?interest, "waiting for io");

        let resumption = self.park(id)?;
        readiness(resumption, descriptor, timeout)
    }

    fn wait_for_read(
        &self,
        task: Task,
        descriptor: Descriptor,
        buffer: &mut [u8],
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let wanted = length.clamp(1, buffer.len().max(1));
        let mut total = 0;

        while total < wanted && total < buffer.len() {
            match self.ensure_ready(&task, descriptor, Interest::READABLE, deadline, timeout) {
                Ok(()) => {}
                Err(err) if err.is_timeout() && total > 0 => break,
                Err(err) => return Err(err),
            }
            match sys::read(descriptor, &mut buffer[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(source) => return Err(SchedulerError::Selector { descriptor, source }),
            }
        }

        Ok(total)
    }

    fn wait_for_write(
        &self,
        task: Task,
        descriptor: Descriptor,
        buffer: &[u8],
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let wanted = length.clamp(1, buffer.len().max(1));
        let mut total = 0;

        while total < wanted && total < buffer.len() {
            match self.ensure_ready(&task, descriptor, Interest::WRITABLE, deadline, timeout) {
                Ok(()) => {}
                Err(err) if err.is_timeout() && total > 0 => break,
                Err(err) => return Err(err),
            }
            match sys::write(descriptor, &buffer[total..]) {
                Ok(n) => total += n,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(source) => return Err(SchedulerError::Selector { descriptor, source }),
            }
        }

        Ok(total)
    }

    fn defer(
        &self,
        task: Task,
        duration: Option<Duration>,
    ) -> Result<()> {
        let id = task.id();
        {
            let mut state = self.state.lock();
            match duration {
                Some(duration) => state.sleepers.push(Sleeper {
                    task,
                    deadline: Instant::now() + duration,
                }),
                None => state.ready.push_back(task),
            }
        }
        trace!(task = %id, ?duration, "deferred");

        wake(self.park(id)?)
    }

    fn resume(
        &self,
        task: Task,
    ) -> Result<()> {
        let value = match task.state() {
            TaskState::Created => Resumption::Start,
            _ => Resumption::Resumed,
        };
        task.resume(value)?;
        Ok(())
    }

    fn has_pending_work(&self) -> bool {
        let state = self.state.lock();
        !state.ready.is_empty() || !state.sleepers.is_empty()
    }

    fn poll(
        &self,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        if !self.owner.is_current() {
            return Err(SchedulerError::ForeignPoll);
        }

        let (mut fds, ids, wait) = {
            let state = self.state.lock();
            let now = Instant::now();
            let mut wait = if state.ready.is_empty() {
                timeout
            } else {
                Some(Duration::ZERO)
            };
            if let Some(deadline) = state.next_deadline() {
                let until = deadline.saturating_duration_since(now);
                wait = Some(wait.map_or(until, |wait| wait.min(until)));
            }

            let mut fds = Vec::with_capacity(state.waiters.len());
            let mut ids = Vec::with_capacity(state.waiters.len());
            for (id, waiter) in state.waiters.iter() {
                fds.push(sys::pollfd(waiter.descriptor, waiter.interest));
                ids.push(*id);
            }
            (fds, ids, wait)
        };

        // Nothing registered and no deadline: polling would never return.
        if fds.is_empty() && wait.is_none() {
            return Ok(0);
        }
        if let Some(pipe) = &self.wake {
            fds.push(sys::pollfd(pipe.descriptor(), Interest::READABLE));
        }

        match sys::poll(&mut fds, wait) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                return Err(SchedulerError::Interrupted);
            }
            Err(err) => return Err(SchedulerError::Poll(err)),
        }

        if let Some(pipe) = &self.wake {
            if fds.last().is_some_and(|pollfd| pollfd.revents != 0) {
                trace!("poll notified");
                pipe.drain();
            }
        }

        let mut wakeups = Vec::new();
        {
            let mut state = self.state.lock();
            let now = Instant::now();

            wakeups.extend(state.ready.drain(..).map(|task| (task, Resumption::Resumed)));

            let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut state.sleepers)
                .into_iter()
                .partition(|sleeper| sleeper.deadline <= now);
            state.sleepers = later;
            wakeups.extend(due.into_iter().map(|sleeper| (sleeper.task, Resumption::Resumed)));

            for (pollfd, id) in fds.iter().zip(ids) {
                if pollfd.revents == 0 {
                    continue;
                }
                let Some(waiter) = state.waiters.remove(&id) else {
                    continue;
                };
                let value = sys::resumption(pollfd.revents, waiter.interest);
                wakeups.push((waiter.task, value));
            }

            let expired: Vec<TaskId> = state
                .waiters
                .iter()
                .filter(|(_, waiter)| waiter.deadline.is_some_and(|deadline| deadline <= now))
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                if let Some(waiter) = state.waiters.remove(&id) {
                    wakeups.push((waiter.task, Resumption::TimedOut));
                }
            }
        }

        let resumed = wakeups.len();
        self.wake_all(wakeups);
        Ok(resumed)
    }

    fn cancel_all(&self) -> Result<usize> {
        let parked = self.take_parked();
        let cancelled = parked.len();
        if cancelled > 0 {
            debug!(tasks = cancelled, "cancelling parked tasks");
        }
        self.wake_all(parked.into_iter().map(|task| (task, Resumption::Cancelled)).collect());
        Ok(cancelled)
    }

    fn io_closer(&self) -> Option<&dyn IoClose> {
        Some(self)
    }

    fn notifier(&self) -> Option<Arc<dyn Notify>> {
        self.wake.clone().map(|pipe| pipe as Arc<dyn Notify>)
    }
}

impl IoClose for EventSelector {
    fn cancel_io(
        &self,
        descriptor: Descriptor,
    ) -> Result<()> {
        let wakeups: Vec<_> = {
            let mut state = self.state.lock();
            let ids: Vec<TaskId> = state
                .waiters
                .iter()
                .filter(|(_, waiter)| waiter.descriptor == descriptor)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.waiters.remove(&id))
                .map(|waiter| (waiter.task, Resumption::Closed))
                .collect()
        };
        debug!(%descriptor, waiters = wakeups.len(), "cancel io");
        self.wake_all(wakeups);
        Ok(())
    }
}

impl Drop for EventSelector {
    fn drop(&mut self) {
        let parked = self.take_parked();
        if parked.is_empty() {
            return;
        }

        warn!(tasks = parked.len(), "selector dropped with parked tasks, cancelling");
        self.wake_all(parked.into_iter().map(|task| (task, Resumption::Cancelled)).collect());
    }
}

mod sys {
    use std::io;
    use std::time::Duration;

    use crate::runtime::scheduler::task::Resumption;
    use crate::runtime::selector::{Descriptor, Interest};

    pub fn pollfd(
        descriptor: Descriptor,
        interest: Interest,
    ) -> libc::pollfd {
        libc::pollfd {
            fd: descriptor.raw(),
            events: interest.bits(),
            revents: 0,
        }
    }

    /// Milliseconds for `poll(2)`, rounded up so short timers never spin.
    fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
        match timeout {
            None => -1,
            Some(timeout) => {
                let mut ms = timeout.as_millis();
                if Duration::from_millis(ms as u64) < timeout {
                    ms += 1;
                }
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        }
    }

    pub fn poll(
        fds: &mut [libc::pollfd],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd.
        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    pub fn read(
        descriptor: Descriptor,
        buffer: &mut [u8],
    ) -> io::Result<usize> {
        // SAFETY: the pointer and length come from a live mutable slice.
        let rc = unsafe { libc::read(descriptor.raw(), buffer.as_mut_ptr().cast(), buffer.len()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    pub fn write(
        descriptor: Descriptor,
        buffer: &[u8],
    ) -> io::Result<usize> {
        // SAFETY: the pointer and length come from a live slice.
        let rc = unsafe { libc::write(descriptor.raw(), buffer.as_ptr().cast(), buffer.len()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    /// Map `revents` to what the waiting task is resumed with.
    ///
    /// Hang-ups and errors count as ready so the caller's next read or
    /// write observes them directly.
    pub fn resumption(
        revents: libc::c_short,
        interest: Interest,
    ) -> Resumption {
        if revents & libc::POLLNVAL != 0 {
            return Resumption::Failed(io::Error::from_raw_os_error(libc::EBADF));
        }
        let events = Interest::from_bits_truncate(revents) & interest;
        if events.is_empty() && revents & (libc::POLLHUP | libc::POLLERR) != 0 {
            Resumption::Ready(interest)
        } else {
            Resumption::Ready(events)
        }
    }
}
