//! lsf-scheduler: bounded worker pool for build and deploy work.
//!
//! A fixed set of workers drains a bounded queue. Submitting never blocks
//! the caller: the returned [`TaskHandle`] resolves exactly once, either
//! with the task's own outcome or with [`TaskError::ShuttingDown`] if the
//! pool closed before the task ran.
//!
//! # Components
//!
//! - **`pool`**: `TaskPool`: workers, queue, retries, shutdown
//! - **`handle`**: `TaskHandle`: single-assignment, many-reader result

pub mod error;
pub mod handle;
pub mod pool;

pub use error::{TaskError, TaskResult};
pub use handle::{Completer, TaskHandle, promise};
pub use pool::{PoolConfig, TaskPool};
