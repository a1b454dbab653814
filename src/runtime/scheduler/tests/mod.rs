//! Scheduler 单元测试
//!
//! 测试任务原语、调度器的等待集合与排空逻辑


use std::sync::Arc;

use parking_lot::Mutex;

use crate::runtime::scheduler::{
    Resumption, SchedulerConfig, Task, TaskBuilder, TaskError, TaskId, TaskOutcome, TaskState,
};

#[cfg(test)]
mod task_id_tests {
    use super::*;

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId(7).to_string(), "Task(7)");
        assert_eq!(usize::from(TaskId(7)), 7);
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = Task::spawn(|| Ok(())).unwrap();
        let b = Task::spawn(|| Ok(())).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}

#[cfg(test)]
mod task_state_tests {
    use super::*;

    #[test]
    fn test_task_state_u8_conversion() {
        for state in [
            TaskState::Created,
            TaskState::Running,
            TaskState::Suspended,
            TaskState::Finished,
        ] {
            assert_eq!(TaskState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_unknown_u8_is_finished() {
        assert_eq!(TaskState::from_u8(200), TaskState::Finished);
    }
}

#[cfg(test)]
mod task_tests {
    use super::*;

    #[test]
    fn test_task_runs_only_when_resumed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = log.clone();
        let task = Task::spawn(move || {
            inner.lock().push("start");
            Task::suspend()?;
            inner.lock().push("resumed");
            Ok(())
        })
        .unwrap();

        assert_eq!(task.state(), TaskState::Created);
        assert!(log.lock().is_empty());

        assert_eq!(task.resume(Resumption::Start).unwrap(), TaskState::Suspended);
        assert!(task.is_suspended());
        assert_eq!(*log.lock(), vec!["start"]);

        assert_eq!(task.resume(Resumption::Resumed).unwrap(), TaskState::Finished);
        assert!(task.is_finished());
        assert_eq!(*log.lock(), vec!["start", "resumed"]);
        assert_eq!(task.outcome(), Some(TaskOutcome::Completed));
    }

    #[test]
    fn test_resume_value_reaches_task() {
        let seen = Arc::new(Mutex::new(None));
        let inner = seen.clone();
        let task = Task::spawn(move || {
            let value = Task::suspend()?;
            *inner.lock() = Some(format!("{:?}", value));
            Ok(())
        })
        .unwrap();

        task.resume(Resumption::Start).unwrap();
        task.resume(Resumption::TimedOut).unwrap();
        assert_eq!(seen.lock().as_deref(), Some("TimedOut"));
    }

    #[test]
    fn test_current_inside_and_outside() {
        assert!(Task::current().is_none());

        let seen = Arc::new(Mutex::new(None));
        let inner = seen.clone();
        let task = Task::spawn(move || {
            *inner.lock() = Task::current().map(|task| task.id());
            Ok(())
        })
        .unwrap();
        task.resume(Resumption::Start).unwrap();

        assert_eq!(*seen.lock(), Some(task.id()));
    }

    #[test]
    fn test_suspend_outside_task() {
        assert!(matches!(Task::suspend(), Err(TaskError::NotInTask)));
    }

    #[test]
    fn test_finished_task_cannot_resume() {
        let task = Task::spawn(|| Ok(())).unwrap();
        task.resume(Resumption::Start).unwrap();

        let err = task.resume(Resumption::Resumed).unwrap_err();
        assert_eq!(
            err,
            TaskError::NotSuspended {
                task: task.id(),
                state: TaskState::Finished,
            }
        );
    }

    #[test]
    fn test_failed_body_outcome() {
        let task = Task::spawn(|| anyhow::bail!("no luck")).unwrap();
        assert_eq!(task.resume(Resumption::Start).unwrap(), TaskState::Finished);
        assert_eq!(task.outcome(), Some(TaskOutcome::Failed("no luck".to_string())));
    }

    #[test]
    fn test_panicking_body_outcome() {
        let task = Task::spawn(|| panic!("boom")).unwrap();
        assert_eq!(task.resume(Resumption::Start).unwrap(), TaskState::Finished);
        assert_eq!(task.outcome(), Some(TaskOutcome::Panicked("boom".to_string())));
    }

    #[test]
    fn test_dropping_every_handle_abandons_parked_task() {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let task = Task::spawn(move || {
            let result = Task::suspend();
            let _ = tx.send(result.map(|_| ()));
            Ok(())
        })
        .unwrap();
        let id = task.id();

        task.resume(Resumption::Start).unwrap();
        drop(task);

        assert_eq!(rx.recv().unwrap(), Err(TaskError::Abandoned(id)));
    }
}

#[cfg(test)]
mod task_builder_tests {
    use super::*;

    #[test]
    fn test_builder_default_name() {
        let task = TaskBuilder::new().build(|| Ok(())).unwrap();
        assert_eq!(task.name(), format!("task-{}", task.id().inner()));
    }

    #[test]
    fn test_builder_prefix_and_name() {
        let task = TaskBuilder::new().prefix("worker").build(|| Ok(())).unwrap();
        assert_eq!(task.name(), format!("worker-{}", task.id().inner()));

        let task = TaskBuilder::new()
            .prefix("worker")
            .name("reader")
            .build(|| Ok(()))
            .unwrap();
        assert_eq!(task.name(), "reader");
    }

    #[test]
    fn test_builder_thread_name_and_stack() {
        let seen = Arc::new(Mutex::new(None));
        let inner = seen.clone();
        let task = TaskBuilder::new()
            .name("named")
            .stack_size(64 * 1024)
            .build(move || {
                *inner.lock() = std::thread::current().name().map(str::to_string);
                Ok(())
            })
            .unwrap();
        task.resume(Resumption::Start).unwrap();
        assert_eq!(seen.lock().as_deref(), Some("named"));
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.task_stack_size, crate::runtime::scheduler::task::DEFAULT_STACK_SIZE);
        assert_eq!(config.task_name_prefix, "fibra-task");
    }
}

#[cfg(test)]
mod error_tests {
    use std::time::Duration;

    use crate::runtime::scheduler::SchedulerError;
    use crate::runtime::selector::Descriptor;

    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = SchedulerError::Timeout {
            descriptor: Descriptor(3),
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_transient());
        assert!(!timeout.is_cancellation());

        assert!(SchedulerError::Interrupted.is_transient());
        assert!(SchedulerError::Cancelled.is_cancellation());
        assert!(SchedulerError::from(TaskError::Abandoned(TaskId(4))).is_cancellation());
        assert!(!SchedulerError::from(TaskError::NotInTask).is_cancellation());
    }

    #[test]
    fn test_error_messages_name_the_descriptor() {
        let err = SchedulerError::Closed {
            descriptor: Descriptor(12),
        };
        assert_eq!(err.to_string(), "fd 12 was closed while a task waited on it");

        let err = SchedulerError::AlreadyWaiting {
            task: TaskId(2),
            descriptor: Descriptor(5),
        };
        assert_eq!(err.to_string(), "Task(2) is already waiting on fd 5");
    }
}
