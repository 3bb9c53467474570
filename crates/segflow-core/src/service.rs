//! The service object outer layers talk to.
//!
//! [`SegmentationService`] is constructed once with its collaborators and
//! shared by reference; it validates caller input, keeps the task directory
//! and the store consistent, and hands accepted work to the [`Scheduler`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ServiceError;
use crate::layout::{ArtifactKind, TaskLayout, VolumeExt};
use crate::preview::{PreviewCache, PreviewError, ServedArtifact};
use crate::runner::Segmenter;
use crate::runtime::Scheduler;
use crate::runtime::pool::SubmitError;
use crate::store::TaskStore;
use crate::task::{Task, TaskStats, TaskStatus};

/// Message recorded on tasks found `PROCESSING` at start-up.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

pub const MAX_PAGE_SIZE: u32 = 100;

/// Artifacts and statistics of a completed task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub original: String,
    pub segmentation: String,
    pub stats: Option<TaskStats>,
}

/// Progress view polled by clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProgress {
    pub status: TaskStatus,
    pub progress: u8,
    pub message: Option<String>,
}

pub struct SegmentationService<S> {
    store: Arc<S>,
    scheduler: Scheduler,
    previews: PreviewCache,
    data_dir: PathBuf,
    temp_dir: PathBuf,
    max_upload_bytes: u64,
}

impl<S: TaskStore> SegmentationService<S> {
    pub fn new(
        store: Arc<S>,
        scheduler: Scheduler,
        previews: PreviewCache,
        data_dir: PathBuf,
        temp_dir: PathBuf,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            store,
            scheduler,
            previews,
            data_dir,
            temp_dir,
            max_upload_bytes,
        }
    }

    /// Wire the service from configuration. Starts the worker pool, so this
    /// must be called inside a Tokio runtime.
    pub fn from_config<R: Segmenter>(config: &Config, store: Arc<S>, segmenter: Arc<R>) -> Self {
        let scheduler = Scheduler::start(
            Arc::clone(&store),
            segmenter,
            config.data_dir.clone(),
            config.worker_count,
            config.queue_capacity,
        );
        let previews = PreviewCache::new(&config.cache_dir, config.preview_factors.clone());
        Self::new(
            store,
            scheduler,
            previews,
            config.data_dir.clone(),
            config.temp_dir.clone(),
            config.max_upload_bytes,
        )
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn previews(&self) -> &PreviewCache {
        &self.previews
    }

    /// Fail every task a previous process left `PROCESSING`.
    pub async fn recover_interrupted(&self) -> Result<u64, ServiceError> {
        let count = self.store.fail_interrupted(INTERRUPTED_MESSAGE).await?;
        if count > 0 {
            warn!(count, "marked interrupted tasks as failed");
        }
        Ok(count)
    }

    // ── Submission ──────────────────────────────────────────────────────────

    /// Copy `source` into a new task directory and record a `QUEUED` task.
    /// The task does not run until [`start`](Self::start) is called.
    pub async fn create_task(&self, filename: &str, source: &Path) -> Result<String, ServiceError> {
        let ext = VolumeExt::of(filename).ok_or_else(|| {
            ServiceError::Validation(format!(
                "unsupported file '{filename}': expected a .nii or .nii.gz volume"
            ))
        })?;
        let size = match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Err(ServiceError::Validation(format!("{} is not a file", source.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServiceError::Validation(format!("{} does not exist", source.display())));
            }
            Err(e) => return Err(e.into()),
        };
        if size > self.max_upload_bytes {
            return Err(ServiceError::Validation(format!(
                "file is {size} bytes; the limit is {} bytes",
                self.max_upload_bytes
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let layout = TaskLayout::new(&self.data_dir, &id);
        let original = layout.original(ext);
        {
            let (source, staging, dir, original) = (
                source.to_path_buf(),
                self.temp_dir.join(format!("{id}.{}", ext.as_str())),
                layout.dir().to_path_buf(),
                original.clone(),
            );
            tokio::task::spawn_blocking(move || stage_original(&source, &staging, &dir, &original))
                .await
                .map_err(std::io::Error::other)??;
        }

        if let Err(e) = self.store.create(Task::new(&id, filename, original)).await {
            let _ = tokio::fs::remove_dir_all(layout.dir()).await;
            return Err(e.into());
        }
        info!(task_id = %id, filename, bytes = size, "task created");
        Ok(id)
    }

    /// Queue `id` for execution, resetting any previous outcome.
    ///
    /// A full queue is rejected before the record is touched, so a completed
    /// task keeps its result. Only a submission that races another caller
    /// for the last queue slot can still fail after the reset; the task is
    /// then left `QUEUED` and may be started again.
    pub async fn start(&self, id: &str) -> Result<(), ServiceError> {
        if self.scheduler.is_active(id) {
            return Err(ServiceError::Conflict(id.to_owned()));
        }
        if self.scheduler.is_full() {
            return Err(ServiceError::QueueFull {
                capacity: self.scheduler.queue_capacity(),
            });
        }
        self.store.update(id, |t| Ok(t.requeue()?)).await?;
        self.previews.evict(id, ArtifactKind::Segmentation).await;

        self.scheduler.submit(id)?;
        info!(task_id = %id, "task queued");
        Ok(())
    }

    /// [`create_task`](Self::create_task) followed by [`start`](Self::start).
    pub async fn submit_upload(&self, filename: &str, source: &Path) -> Result<String, ServiceError> {
        let id = self.create_task(filename, source).await?;
        self.start(&id).await?;
        Ok(id)
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub async fn get(&self, id: &str) -> Result<Task, ServiceError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))
    }

    pub async fn status(&self, id: &str) -> Result<TaskProgress, ServiceError> {
        let task = self.get(id).await?;
        Ok(TaskProgress {
            status: task.status,
            progress: task.progress,
            message: task.message,
        })
    }

    pub async fn result(&self, id: &str) -> Result<TaskResult, ServiceError> {
        let task = self.get(id).await?;
        let segmentation = match (&task.status, &task.segmentation_path) {
            (TaskStatus::Completed, Some(path)) => file_name(path),
            _ => {
                return Err(ServiceError::NotCompleted {
                    id: task.id,
                    status: task.status,
                });
            }
        };
        Ok(TaskResult {
            original: file_name(&task.original_path),
            segmentation,
            stats: task.stats(),
            task_id: task.id,
        })
    }

    /// One page of tasks, newest first, and the total count.
    pub async fn list(&self, page: u32, page_size: u32) -> Result<(Vec<Task>, u64), ServiceError> {
        if page == 0 {
            return Err(ServiceError::Validation("page must be at least 1".into()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(ServiceError::Validation(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(self.store.list(page, page_size).await?)
    }

    // ── Deletion ────────────────────────────────────────────────────────────

    /// Remove the record, its directory and its cached previews.
    ///
    /// A running task is deleted too: its worker notices the missing record
    /// at its next progress update and discards its own output.
    pub async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        if !self.store.delete(id).await? {
            return Err(ServiceError::NotFound(format!("task {id}")));
        }
        let dir = TaskLayout::new(&self.data_dir, id).dir().to_path_buf();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(task_id = %id, error = %e, "failed to remove task directory"),
        }
        for kind in [ArtifactKind::Original, ArtifactKind::Segmentation] {
            self.previews.evict(id, kind).await;
        }
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Delete every id that exists; returns how many were deleted.
    pub async fn batch_delete<I>(&self, ids: I) -> Result<usize, ServiceError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut deleted = 0;
        for id in ids {
            match self.delete(id.as_ref()).await {
                Ok(()) => deleted += 1,
                Err(ServiceError::NotFound(_)) => debug!(task_id = id.as_ref(), "skipping unknown task"),
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    // ── Artifacts ───────────────────────────────────────────────────────────

    /// Resolve an artifact file, optionally as a downsampled preview.
    ///
    /// `factor` defaults to the smallest configured preview factor.
    pub async fn artifact(
        &self,
        id: &str,
        name: &str,
        preview: bool,
        factor: Option<&str>,
    ) -> Result<ServedArtifact, ServiceError> {
        let kind: ArtifactKind = name.parse().map_err(ServiceError::Validation)?;
        let factor = match factor {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map_err(|_| ServiceError::Validation(format!("factor must be an integer, got '{raw}'")))?,
            None => *self.previews.factors().start(),
        };

        let task = self.get(id).await?;
        let path = match kind {
            ArtifactKind::Original => task.original_path.clone(),
            ArtifactKind::Segmentation => match (&task.status, &task.segmentation_path) {
                (TaskStatus::Completed, Some(path)) => path.clone(),
                _ => {
                    return Err(ServiceError::NotFound(format!(
                        "segmentation of task {id} (task is {})",
                        task.status
                    )));
                }
            },
        };

        if !preview {
            return match tokio::fs::try_exists(&path).await {
                Ok(true) => Ok(ServedArtifact {
                    path,
                    is_preview: false,
                    factor: None,
                }),
                Ok(false) => Err(ServiceError::NotFound(format!("{kind} of task {id}"))),
                Err(e) => Err(e.into()),
            };
        }

        self.previews
            .serve(id, kind, &path, factor)
            .await
            .map_err(|e| match e {
                PreviewError::NotFound { .. } => ServiceError::NotFound(format!("{kind} of task {id}")),
                PreviewError::Io(e) => ServiceError::Io(e),
            })
    }

    /// Stop accepting work and wait for queued and running tasks to finish.
    pub async fn shutdown(&self) {
        self.scheduler.drain().await;
    }
}

impl From<SubmitError> for ServiceError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Duplicate(id) => ServiceError::Conflict(id),
            SubmitError::QueueFull { capacity } => ServiceError::QueueFull { capacity },
            SubmitError::ShuttingDown => ServiceError::ShuttingDown,
        }
    }
}

/// Copy the upload next to its final name and move it into place, so a
/// task directory never holds a partial original.
fn stage_original(source: &Path, staging: &Path, dir: &Path, original: &Path) -> std::io::Result<()> {
    if let Some(parent) = staging.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(dir)?;
    let moved = std::fs::copy(source, staging).and_then(|_| match std::fs::rename(staging, original) {
        Ok(()) => Ok(()),
        // Staging may sit on another filesystem.
        Err(_) => std::fs::copy(staging, original).map(|_| ()),
    });
    let _ = std::fs::remove_file(staging);
    if moved.is_err() {
        let _ = std::fs::remove_dir_all(dir);
    }
    moved
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
