//! Bounded worker pool for callback dispatch
//!
//! A fixed number of workers consume boxed tasks from a bounded queue.
//! `add_task` applies backpressure by awaiting queue capacity instead of
//! dropping tasks or growing unbounded. A worker that runs a panicking task
//! logs the failure and keeps consuming.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{Result, WeftError};

tokio::task_local! {
    static IN_CALLBACK_POOL: ();
}

/// True when the current task is one of the pool's workers. Used to reject
/// blocking calls that could only complete by running on this same pool.
pub(crate) fn current_task_in_pool() -> bool {
    IN_CALLBACK_POOL.try_with(|_| ()).is_ok()
}

enum Task {
    Run(BoxFuture<'static, ()>),
    Done,
}

/// Fixed-size worker pool over a bounded task queue.
pub(crate) struct WorkerPool {
    tx: parking_lot::Mutex<Option<mpsc::Sender<Task>>>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl WorkerPool {
    pub(crate) fn new(queue_size: usize, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        debug!(workers, queue_size, "creating callback worker pool");

        // tokio mpsc is single-consumer, so the workers share the receiver
        // behind an async mutex and take turns popping tasks.
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers)
            .map(|worker_id| {
                let rx = rx.clone();
                tokio::spawn(worker_run(worker_id, rx))
            })
            .collect();

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            handles: parking_lot::Mutex::new(handles),
            workers,
        }
    }

    /// Queue a task, waiting for capacity if the queue is full. Fails fast
    /// with [`WeftError::Shutdown`] once the pool has been destroyed.
    pub(crate) async fn add_task<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.tx.lock().clone().ok_or(WeftError::Shutdown)?;
        tx.send(Task::Run(Box::pin(task)))
            .await
            .map_err(|_| WeftError::Shutdown)
    }

    /// Stop accepting tasks, let queued tasks finish, then join all workers.
    pub(crate) async fn destroy(&self) {
        let tx = self.tx.lock().take();
        if let Some(tx) = tx {
            for _ in 0..self.workers {
                let _ = tx.send(Task::Done).await;
            }
        }
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_run(worker_id: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>) {
    debug!(worker_id, "callback pool worker started");
    loop {
        let task = rx.lock().await.recv().await;
        match task {
            Some(Task::Run(task)) => {
                let result = AssertUnwindSafe(IN_CALLBACK_POOL.scope((), task))
                    .catch_unwind()
                    .await;
                if result.is_err() {
                    error!(worker_id, "callback task panicked");
                }
            }
            Some(Task::Done) | None => break,
        }
    }
    debug!(worker_id, "callback pool worker stopped");
}
