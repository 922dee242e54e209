//! Single-assignment task results.
//!
//! A [`Completer`] and its [`TaskHandle`]s share one slot. The completer
//! fills it at most once; handles can wait on it, clone it and read it any
//! number of times. A completer dropped without a value fills the slot
//! with [`TaskError::ShuttingDown`], so an abandoned task never leaves its
//! waiters hanging.

use tokio::sync::watch;

use crate::error::{TaskError, TaskResult};

type Slot<T> = Option<TaskResult<T>>;

/// Read side of a task's result.
#[derive(Debug, Clone)]
pub struct TaskHandle<T> {
    rx: watch::Receiver<Slot<T>>,
}

impl<T: Clone> TaskHandle<T> {
    /// Wait for the task's outcome.
    pub async fn wait(&self) -> TaskResult<T> {
        let mut rx = self.rx.clone();
        let result = match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => slot.clone().unwrap_or(Err(TaskError::ShuttingDown)),
            Err(_) => Err(TaskError::ShuttingDown),
        };
        result
    }

    /// The outcome, if the task already finished.
    pub fn try_result(&self) -> Option<TaskResult<T>> {
        self.rx.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// A handle that is already resolved.
    pub(crate) fn resolved(result: TaskResult<T>) -> Self {
        let (tx, rx) = watch::channel(Some(result));
        drop(tx);
        Self { rx }
    }
}

/// Write side of a task's result.
#[derive(Debug)]
pub struct Completer<T> {
    tx: Option<watch::Sender<Slot<T>>>,
}

impl<T> Completer<T> {
    pub fn complete(mut self, result: TaskResult<T>) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result));
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(Err(TaskError::ShuttingDown)));
        }
    }
}

/// A fresh, unresolved result slot.
pub fn promise<T>() -> (Completer<T>, TaskHandle<T>) {
    let (tx, rx) = watch::channel(None);
    (Completer { tx: Some(tx) }, TaskHandle { rx })
}
