//! fibra - cooperative fibers over a pluggable event selector
//!
//! Tasks are lightweight, cooperatively scheduled units of execution. When
//! a task calls one of the scheduler's blocking-looking operations (waiting
//! on a descriptor, reading, writing, sleeping) the scheduler hands the
//! operation to an event selector and suspends the task; the selector
//! resumes it once the operation can complete. The controlling thread never
//! blocks on behalf of a single task.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use fibra::runtime::Scheduler;
//!
//! fn main() -> fibra::Result<()> {
//!     let scheduler = Arc::new(Scheduler::new());
//!
//!     for i in 0..3 {
//!         let sched = scheduler.clone();
//!         scheduler.spawn(move || {
//!             sched.kernel_sleep(Some(Duration::from_millis(10 * i)))?;
//!             println!("task {} woke up", i);
//!             Ok(())
//!         })?;
//!     }
//!
//!     scheduler.close()?;
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod runtime;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use runtime::scheduler::SchedulerError;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "fibra";
