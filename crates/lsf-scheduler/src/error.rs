//! Task error types.

use std::sync::Arc;

use thiserror::Error;

/// Outcome of a task that did not produce a value.
///
/// `Clone` so one result can be observed by any number of waiters.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The pool closed before the task ran. Safe to resubmit elsewhere.
    #[error("pool shutting down")]
    ShuttingDown,

    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, TaskError::ShuttingDown)
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Failed(Arc::new(err))
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
