use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Work run for each submitted task id.
pub type JobHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The id is already waiting in the queue or running.
    #[error("task {0} is already queued or running")]
    Duplicate(String),

    #[error("submission queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// A fixed set of workers pulling task ids from a bounded queue.
///
/// Submission never waits: it either enqueues or fails. Every id is tracked
/// from submission until its handler returns, so the same id can never be
/// queued twice or run on two workers at once. A handler that panics is
/// logged and its worker moves on to the next id.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let pool = WorkerPool::start(2, 64, handler);
/// pool.submit("task-1".into())?;
/// pool.drain().await; // finish queued and running work, then stop
/// ```
pub struct WorkerPool {
    sender: Mutex<Option<flume::Sender<String>>>,
    active: Arc<Mutex<HashSet<String>>>,
    in_flight: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
    queue_capacity: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("queue_capacity", &self.queue_capacity)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerPool {
    /// Spawn `capacity` workers (at least one) on the current Tokio runtime.
    ///
    /// * `queue_capacity` – pending ids accepted before [`SubmitError::QueueFull`].
    pub fn start(capacity: usize, queue_capacity: usize, handler: JobHandler) -> Self {
        let capacity = capacity.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = flume::bounded::<String>(queue_capacity);
        let active = Arc::new(Mutex::new(HashSet::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let workers = (0..capacity)
            .map(|worker| {
                let rx = rx.clone();
                let handler = Arc::clone(&handler);
                let active = Arc::clone(&active);
                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    Self::run_worker(worker, rx, handler, active, in_flight).await;
                })
            })
            .collect();
        info!(capacity, queue_capacity, "worker pool started");

        Self {
            sender: Mutex::new(Some(tx)),
            active,
            in_flight,
            workers: Mutex::new(workers),
            capacity,
            queue_capacity,
        }
    }

    async fn run_worker(
        worker: usize,
        rx: flume::Receiver<String>,
        handler: JobHandler,
        active: Arc<Mutex<HashSet<String>>>,
        in_flight: Arc<AtomicUsize>,
    ) {
        while let Ok(task_id) = rx.recv_async().await {
            in_flight.fetch_add(1, Ordering::SeqCst);
            debug!(worker, task_id = %task_id, "worker picked up task");

            if let Err(panic) = AssertUnwindSafe(handler(task_id.clone())).catch_unwind().await {
                error!(
                    worker,
                    task_id = %task_id,
                    panic = %panic_message(panic.as_ref()),
                    "task handler panicked"
                );
            }

            in_flight.fetch_sub(1, Ordering::SeqCst);
            lock(&active).remove(&task_id);
        }
        debug!(worker, "worker stopped");
    }

    /// Enqueue `task_id` without waiting.
    pub fn submit(&self, task_id: String) -> Result<(), SubmitError> {
        let sender = lock(&self.sender);
        let Some(tx) = sender.as_ref() else {
            return Err(SubmitError::ShuttingDown);
        };
        if !lock(&self.active).insert(task_id.clone()) {
            return Err(SubmitError::Duplicate(task_id));
        }

        match tx.try_send(task_id) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(id)) => {
                lock(&self.active).remove(&id);
                Err(SubmitError::QueueFull {
                    capacity: self.queue_capacity,
                })
            }
            Err(flume::TrySendError::Disconnected(id)) => {
                lock(&self.active).remove(&id);
                Err(SubmitError::ShuttingDown)
            }
        }
    }

    /// Whether `task_id` is queued or running.
    pub fn is_active(&self, task_id: &str) -> bool {
        lock(&self.active).contains(task_id)
    }

    /// Handlers currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Ids waiting for a worker.
    pub fn queued(&self) -> usize {
        lock(&self.sender).as_ref().map_or(0, |tx| tx.len())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Whether a submission made now would be rejected as
    /// [`SubmitError::QueueFull`].
    pub fn is_full(&self) -> bool {
        self.queued() >= self.queue_capacity
    }

    /// Stop accepting work, let workers finish everything already queued or
    /// running, then wait for them to exit.
    pub async fn drain(&self) {
        lock(&self.sender).take();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "worker exited abnormally");
                }
            }
        }
        info!("worker pool drained");
    }

    /// Stop accepting work and abort all workers immediately. Queued ids are
    /// dropped; running handlers are cancelled at their next await point.
    pub fn stop(&self) {
        lock(&self.sender).take();
        for handle in lock(&self.workers).drain(..) {
            handle.abort();
        }
        lock(&self.active).clear();
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in lock(&self.workers).drain(..) {
            handle.abort();
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;

    fn counting_handler(done: Arc<AtomicUsize>) -> JobHandler {
        Arc::new(move |_id| {
            let done = Arc::clone(&done);
            async move {
                done.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn drain_runs_everything_queued() {
        let done = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::start(2, 16, counting_handler(Arc::clone(&done)));
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.queue_capacity(), 16);
        for i in 0..10 {
            pool.submit(format!("t{i}")).unwrap();
        }
        pool.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(pool.submit("late".into()), Err(SubmitError::ShuttingDown));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_until_finished() {
        let gate = Arc::new(Notify::new());
        let handler: JobHandler = {
            let gate = Arc::clone(&gate);
            Arc::new(move |_id| {
                let gate = Arc::clone(&gate);
                async move { gate.notified().await }.boxed()
            })
        };
        let pool = WorkerPool::start(1, 4, handler);

        pool.submit("a".into()).unwrap();
        assert_eq!(pool.submit("a".into()), Err(SubmitError::Duplicate("a".into())));
        assert!(pool.is_active("a"));

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.is_active("a") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler should finish");
        pool.submit("a".into()).unwrap();
        gate.notify_one();
        pool.drain().await;
    }

    #[tokio::test]
    async fn full_queue_rejects_without_waiting() {
        let gate = Arc::new(Notify::new());
        let handler: JobHandler = {
            let gate = Arc::clone(&gate);
            Arc::new(move |_id| {
                let gate = Arc::clone(&gate);
                async move { gate.notified().await }.boxed()
            })
        };
        let pool = WorkerPool::start(1, 1, handler);

        pool.submit("running".into()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.in_flight() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker should pick up the first id");

        assert!(!pool.is_full());
        pool.submit("waiting".into()).unwrap();
        assert_eq!(pool.queued(), 1);
        assert!(pool.is_full());
        assert_eq!(
            pool.submit("overflow".into()),
            Err(SubmitError::QueueFull { capacity: 1 })
        );
        assert!(!pool.is_active("overflow"));
        pool.stop();
    }

    #[tokio::test]
    async fn zero_sizes_are_clamped_to_one() {
        let pool = WorkerPool::start(0, 0, counting_handler(Arc::new(AtomicUsize::new(0))));
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.queue_capacity(), 1);
        pool.drain().await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_the_worker() {
        let done = Arc::new(AtomicUsize::new(0));
        let handler: JobHandler = {
            let done = Arc::clone(&done);
            Arc::new(move |id| {
                let done = Arc::clone(&done);
                async move {
                    if id == "boom" {
                        panic!("handler exploded");
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            })
        };
        let pool = WorkerPool::start(1, 8, handler);
        pool.submit("boom".into()).unwrap();
        pool.submit("fine".into()).unwrap();
        pool.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(pool.queued(), 0);
        assert!(!pool.is_active("boom"));
    }
}
