//! Selector 单元测试
//!
//! 测试事件位、恢复值到结果的映射以及默认 selector 的基本约束

use std::io;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::runtime::scheduler::{Resumption, SchedulerError, Task};
use crate::runtime::selector::{
    readiness, wake, Controller, Descriptor, EventSelector, Interest, Selector,
};

#[cfg(test)]
mod interest_tests {
    use super::*;

    #[test]
    fn test_interest_matches_poll_bits() {
        assert_eq!(Interest::READABLE.bits(), libc::POLLIN);
        assert_eq!(Interest::PRIORITY.bits(), libc::POLLPRI);
        assert_eq!(Interest::WRITABLE.bits(), libc::POLLOUT);
        assert_eq!(
            (Interest::READABLE.bits(), Interest::PRIORITY.bits(), Interest::WRITABLE.bits()),
            (1, 2, 4)
        );
    }

    #[test]
    fn test_interest_combination() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.contains(Interest::READABLE));
        assert!(both.contains(Interest::WRITABLE));
        assert!(!both.contains(Interest::PRIORITY));
    }
}

#[cfg(test)]
mod descriptor_tests {
    use super::*;

    #[test]
    fn test_descriptor_display() {
        assert_eq!(Descriptor(7).to_string(), "fd 7");
        assert_eq!(Descriptor::from(7), Descriptor(7));
        assert_eq!(Descriptor(7).raw(), 7);
    }

    #[test]
    fn test_descriptor_of_stream() {
        use std::os::fd::AsRawFd;

        let (a, _b) = UnixStream::pair().unwrap();
        assert_eq!(Descriptor::of(&a).raw(), a.as_raw_fd());
    }
}

#[cfg(test)]
mod readiness_tests {
    use super::*;

    const FD: Descriptor = Descriptor(9);

    #[test]
    fn test_ready_reports_events() {
        let events = readiness(Resumption::Ready(Interest::WRITABLE), FD, None).unwrap();
        assert_eq!(events, Interest::WRITABLE);
    }

    #[test]
    fn test_spurious_wakeup_reports_nothing() {
        assert!(readiness(Resumption::Resumed, FD, None).unwrap().is_empty());
    }

    #[test]
    fn test_timeout_carries_requested_timeout() {
        let timeout = Some(Duration::from_millis(250));
        match readiness(Resumption::TimedOut, FD, timeout) {
            Err(SchedulerError::Timeout { descriptor, timeout }) => {
                assert_eq!(descriptor, FD);
                assert_eq!(timeout, Duration::from_millis(250));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_failures_map_to_errors() {
        assert!(matches!(
            readiness(Resumption::Closed, FD, None),
            Err(SchedulerError::Closed { descriptor: FD })
        ));
        assert!(matches!(
            readiness(Resumption::Failed(io::Error::from(io::ErrorKind::Other)), FD, None),
            Err(SchedulerError::Selector { descriptor: FD, .. })
        ));
        assert!(matches!(
            readiness(Resumption::Cancelled, FD, None),
            Err(SchedulerError::Cancelled)
        ));
    }

    #[test]
    fn test_wake_only_fails_on_cancel_or_poll_error() {
        assert!(wake(Resumption::Resumed).is_ok());
        assert!(wake(Resumption::TimedOut).is_ok());
        assert!(matches!(wake(Resumption::Cancelled), Err(SchedulerError::Cancelled)));
        assert!(matches!(
            wake(Resumption::Failed(io::Error::from(io::ErrorKind::Other))),
            Err(SchedulerError::Poll(_))
        ));
    }
}

#[cfg(test)]
mod controller_tests {
    use super::*;

    #[test]
    fn test_controller_outside_task() {
        let controller = Controller::current();
        assert!(controller.is_current());
        assert!(controller.task().is_none());
        assert_eq!(controller.thread(), std::thread::current().id());
    }

    #[test]
    fn test_controller_differs_inside_task() {
        let outer = Controller::current();
        let (tx, rx) = crossbeam::channel::bounded(1);
        let task = Task::spawn(move || {
            let inner = Controller::current();
            let _ = tx.send((inner.task(), outer.is_current()));
            Ok(())
        })
        .unwrap();
        task.resume(Resumption::Start).unwrap();

        let (inner_task, outer_current) = rx.recv().unwrap();
        assert_eq!(inner_task, Some(task.id()));
        assert!(!outer_current);
    }
}

#[cfg(test)]
mod event_selector_tests {
    use super::*;

    #[test]
    fn test_idle_poll_returns_immediately() {
        let selector = EventSelector::new(Controller::current());
        assert!(!selector.has_pending_work());
        assert_eq!(selector.poll(None).unwrap(), 0);
        assert_eq!(selector.waiter_count(), 0);
    }

    #[test]
    fn test_supports_close() {
        let selector = EventSelector::new(Controller::current());
        assert!(selector.io_closer().is_some());
        assert!(selector.owner().is_current());
    }

    #[test]
    fn test_notify_cuts_poll_short() {
        let selector = EventSelector::new(Controller::current());
        let notify = selector.notifier().unwrap();

        notify.notify().unwrap();
        let started = std::time::Instant::now();
        assert_eq!(selector.poll(Some(Duration::from_secs(10))).unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cancel_all_on_empty_selector() {
        let selector = EventSelector::new(Controller::current());
        assert_eq!(selector.cancel_all().unwrap(), 0);
    }

    #[test]
    fn test_poll_from_other_thread_refused() {
        let selector = EventSelector::new(Controller::current());
        let refused = std::thread::spawn(move || {
            matches!(selector.poll(Some(Duration::ZERO)), Err(SchedulerError::ForeignPoll))
        })
        .join()
        .unwrap();
        assert!(refused);
    }

    #[test]
    fn test_wait_outside_task_fails() {
        let selector = EventSelector::new(Controller::current());
        let (a, _b) = UnixStream::pair().unwrap();
        let task = Task::spawn(|| Ok(())).unwrap();

        // The caller is not the task being parked.
        let err = selector
            .wait_for_io(task, Descriptor::of(&a), Interest::READABLE, None)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Task(_)));
        assert_eq!(selector.waiter_count(), 0);
    }
}
