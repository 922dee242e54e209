//! Task pool: fixed workers over a bounded queue.
//!
//! ```text
//! add_task ──try_send──▶ [ bounded queue ] ──▶ worker 1..N ──▶ Completer
//!     │ full                                      │
//!     └─ enqueuer: send  ◀─race─▶  shutdown       └─ each attempt in its own task
//! ```
//!
//! Once [`TaskPool::close`] is called no new work is accepted, workers
//! finish the task they are running and exit, and every task still queued
//! resolves to [`TaskError::ShuttingDown`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lsf_core::SchedulerConfig;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::handle::{self, Completer, TaskHandle};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Job = Box<dyn FnOnce() -> BoxFuture + Send>;

/// Pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_size: usize,
    /// Retry budget for tasks submitted with [`TaskPool::add_task`].
    pub max_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 100,
            queue_size: 200,
            max_retries: 0,
        }
    }
}

impl From<&SchedulerConfig> for PoolConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            workers: config.workers,
            queue_size: config.queue_size,
            max_retries: config.max_retries,
        }
    }
}

pub struct TaskPool {
    sender: mpsc::Sender<Job>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_retries: u32,
    next_task_id: AtomicU64,
}

impl TaskPool {
    /// Start the workers. Must be called from within a Tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        let workers = config.workers.max(1);
        let (sender, receiver) = mpsc::channel(config.queue_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let (shutdown, _) = watch::channel(false);

        let handles = (0..workers)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&receiver),
                    shutdown.subscribe(),
                ))
            })
            .collect();

        info!(
            workers,
            queue_size = config.queue_size,
            max_retries = config.max_retries,
            "task pool started"
        );

        Self {
            sender,
            receiver,
            shutdown,
            workers: Mutex::new(handles),
            max_retries: config.max_retries,
            next_task_id: AtomicU64::new(0),
        }
    }

    /// Submit a task with the pool's default retry budget.
    ///
    /// `task` is called once per attempt. Never blocks: if the queue is
    /// full the task is handed to a background enqueuer.
    pub fn add_task<T, F, Fut>(&self, task: F) -> TaskHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.add_task_with_retries(self.max_retries, task)
    }

    /// Submit a task that is re-run up to `retries` times after a failure.
    pub fn add_task_with_retries<T, F, Fut>(&self, retries: u32, task: F) -> TaskHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if self.is_closing() {
            return TaskHandle::resolved(Err(TaskError::ShuttingDown));
        }

        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (completer, handle) = handle::promise();
        let job = make_job(task_id, retries, task, completer);

        match self.sender.try_send(job) {
            Ok(()) => {
                debug!(task_id, "task queued");
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                debug!(task_id, "queue full, deferring task");
                let sender = self.sender.clone();
                let mut shutdown = self.shutdown.subscribe();
                tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        _ = shutdown.wait_for(|closing| *closing) => {
                            debug!(task_id, "pool shutting down, task dropped before queueing");
                        }
                        sent = sender.send(job) => {
                            if sent.is_err() {
                                debug!(task_id, "queue closed, task dropped");
                            }
                        }
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_job)) => {
                debug!(task_id, "queue closed, task dropped");
            }
        }
        handle
    }

    pub fn is_closing(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop accepting work and wait for in-flight tasks. Idempotent.
    pub async fn close(&self) {
        let first = !self.shutdown.send_replace(true);
        if first {
            info!("task pool shutting down");
        }

        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "task pool worker ended abnormally");
            }
        }

        // Dropping a queued job resolves its handle with `ShuttingDown`.
        let mut rx = self.receiver.lock().await;
        rx.close();
        let mut abandoned = 0usize;
        while rx.try_recv().is_ok() {
            abandoned += 1;
        }
        if first || abandoned > 0 {
            info!(abandoned, "task pool closed");
        }
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|closing| *closing) => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };
        job().await;
    }
    debug!(worker, "task pool worker exited");
}

fn make_job<T, F, Fut>(task_id: u64, retries: u32, mut task: F, completer: Completer<T>) -> Job
where
    T: Send + Sync + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Box::new(move || {
        Box::pin(async move {
            let mut attempt = 0u32;
            let outcome = loop {
                let result = match tokio::spawn(task()).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(TaskError::from(e)),
                    Err(join) if join.is_panic() => {
                        let message = panic_message(join.into_panic());
                        warn!(task_id, %message, "task panicked");
                        break Err(TaskError::Panicked(message));
                    }
                    Err(_) => break Err(TaskError::ShuttingDown),
                };
                match result {
                    Err(e) if attempt < retries => {
                        attempt += 1;
                        warn!(task_id, attempt, retries, error = %e, "task failed, retrying");
                    }
                    other => break other,
                }
            };
            debug!(task_id, ok = outcome.is_ok(), "task finished");
            completer.complete(outcome);
        }) as BoxFuture
    })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
