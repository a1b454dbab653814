//! Runtime system
//!
//! This module contains the cooperative scheduler and the event selectors
//! it delegates to.

pub mod scheduler;
pub mod selector;

pub use scheduler::{
    Blocking, DirectScheduler, InterruptHandle, IoCloser, Scheduler, SchedulerConfig, SchedulerError, Task,
    TaskId,
};
pub use selector::{Controller, Descriptor, EventSelector, Interest, IoClose, Notify, Selector};
