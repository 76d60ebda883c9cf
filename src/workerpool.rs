//! Bounded worker pool: fixed concurrency, graceful drain (§4.3).
//!
//! A fixed number of worker tasks (`W`) drain a bounded MPMC queue of
//! boxed unit-of-work closures. `submit` blocks only on queue capacity,
//! never on task completion — the same bound-concurrency-without-
//! blocking-submitters posture the grounding repo's `ProcessPool` takes
//! toward process slots, adapted here to `tokio::task`s draining an
//! `mpsc` channel instead of a `VecDeque` of PIDs.

use crate::error::Error;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// A unit of work submitted to the pool.
pub type Task = Box<dyn FnOnce() -> futures_util::future::BoxFuture<'static, ()> + Send>;

struct Inner {
    closed: AtomicBool,
    // `None` once `close` has taken and dropped the sole sender, which is
    // what makes every worker's `recv()` observe closure.
    tx: std::sync::Mutex<Option<mpsc::Sender<Task>>>,
}

/// A fixed-size pool of worker tasks draining a bounded queue.
pub struct WorkerPool {
    inner: Arc<Inner>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool of `workers` tasks with a queue of `queue_capacity`
    /// (default `2 * workers` per §4.3, use [`WorkerPool::new`]'s
    /// companion default via `with_default_queue`).
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = mpsc::channel::<Task>(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(task) = task else {
                        debug!(worker = id, "queue closed, worker exiting");
                        break;
                    };
                    let fut = task();
                    // Catching a panic out of an arbitrary boxed future
                    // requires it to be unwind-safe in practice; a
                    // panicking task must not take its worker down with
                    // it (§4.3 "Worker loop").
                    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                        let msg = panic_message(&panic);
                        error!(worker = id, %msg, "task panicked, discarding");
                    }
                }
            }));
        }

        Self {
            inner: Arc::new(Inner {
                closed: AtomicBool::new(false),
                tx: std::sync::Mutex::new(Some(tx)),
            }),
            workers: std::sync::Mutex::new(handles),
        }
    }

    /// Default queue capacity of `2 * workers` (§4.3 "Shape").
    pub fn with_default_queue(workers: usize) -> Self {
        let workers = workers.max(1);
        Self::new(workers, workers * 2)
    }

    /// Enqueue a task. Blocks (awaits) while the queue is full; fails
    /// immediately with [`Error::PoolClosed`] once the pool has been
    /// closed.
    pub async fn submit<F>(&self, task: F) -> Result<(), Error>
    where
        F: FnOnce() -> futures_util::future::BoxFuture<'static, ()> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }
        let tx = {
            let guard = self.inner.tx.lock().unwrap();
            guard.clone()
        };
        match tx {
            Some(tx) => tx.send(Box::new(task)).await.map_err(|_| Error::PoolClosed),
            None => Err(Error::PoolClosed),
        }
    }

    /// One-shot graceful close: no more submissions are accepted, each
    /// worker finishes its current task, then `close` joins every worker
    /// before returning (§4.3 "Close").
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Taking and dropping the sender makes every worker's `recv()`
        // observe channel closure once the queue drains, ending their
        // loops — `submit` only ever holds a short-lived clone.
        let sender = self.inner.tx.lock().unwrap().take();
        drop(sender);
        let handles = {
            let mut guard = self.workers.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.await;
        }
        debug!("worker pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn boxed<F>(fut: F) -> futures_util::future::BoxFuture<'static, ()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Box::pin(fut)
    }

    #[tokio::test]
    async fn submit_runs_task() {
        let pool = WorkerPool::with_default_queue(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(move || boxed(async move {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn submit_after_close_fails() {
        let pool = WorkerPool::with_default_queue(1);
        pool.close().await;
        let err = pool
            .submit(|| boxed(async {}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolClosed));
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::with_default_queue(1);
        pool.submit(|| boxed(async { panic!("boom") })).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(move || boxed(async move {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1, "worker survived the panic");
        pool.close().await;
    }

    #[tokio::test]
    async fn close_joins_in_flight_task_before_returning() {
        let pool = WorkerPool::with_default_queue(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(move || boxed(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();
        pool.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let pool = WorkerPool::with_default_queue(1);
        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
    }
}
