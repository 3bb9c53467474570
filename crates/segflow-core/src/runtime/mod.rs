//! Job scheduling and execution.
//!
//! [`Scheduler`] owns a [`WorkerPool`] whose handler runs each submitted id
//! through a [`TaskPipeline`](pipeline::TaskPipeline). Callers only ever
//! enqueue ids; status is observed through the task store.

pub(crate) mod pipeline;
pub mod pool;

use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;

use crate::runner::Segmenter;
use crate::store::TaskStore;
use pipeline::TaskPipeline;
use pool::{JobHandler, SubmitError, WorkerPool};

pub struct Scheduler {
    pool: WorkerPool,
}

impl Scheduler {
    /// Start `workers` workers executing tasks from `store` with `segmenter`.
    ///
    /// `workers` must not exceed the number of accelerators the segmenter
    /// can use exclusively.
    pub fn start<S: TaskStore>(
        store: Arc<S>,
        segmenter: Arc<dyn Segmenter>,
        data_dir: PathBuf,
        workers: usize,
        queue_capacity: usize,
    ) -> Self {
        let pipeline = Arc::new(TaskPipeline::new(store, segmenter, data_dir));
        let handler: JobHandler = Arc::new(move |task_id| {
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.execute(task_id).await }.boxed()
        });
        Self {
            pool: WorkerPool::start(workers, queue_capacity, handler),
        }
    }

    /// Enqueue a task; its existence is checked when a worker picks it up.
    pub fn submit(&self, task_id: &str) -> Result<(), SubmitError> {
        self.pool.submit(task_id.to_owned())
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.pool.is_active(task_id)
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Whether the submission queue has no room left.
    pub fn is_full(&self) -> bool {
        self.pool.is_full()
    }

    pub fn queue_capacity(&self) -> usize {
        self.pool.queue_capacity()
    }

    pub async fn drain(&self) {
        self.pool.drain().await;
    }

    pub fn stop(&self) {
        self.pool.stop();
    }
}
