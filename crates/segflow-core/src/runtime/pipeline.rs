use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use thiserror::Error;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::analyzer::{self, VolumeStats};
use crate::layout::{TaskLayout, VolumeExt};
use crate::runner::{RunnerError, Segmenter, locate_output};
use crate::runtime::pool::panic_message;
use crate::store::{StoreError, TaskStore};
use crate::task::Task;

/// Why a claimed task did not complete.
#[derive(Debug, Error)]
pub(crate) enum PipelineError {
    /// The record vanished mid-run; nothing may be written back.
    #[error("task was deleted while running")]
    Deleted,

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blocking step failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("internal error: {0}")]
    Panicked(String),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => PipelineError::Deleted,
            other => PipelineError::Store(other),
        }
    }
}

/// Drives one task through prepare → infer → post-process → finalize.
pub struct TaskPipeline<S> {
    store: Arc<S>,
    segmenter: Arc<dyn Segmenter>,
    data_dir: PathBuf,
}

impl<S: TaskStore> TaskPipeline<S> {
    pub fn new(store: Arc<S>, segmenter: Arc<dyn Segmenter>, data_dir: PathBuf) -> Self {
        Self {
            store,
            segmenter,
            data_dir,
        }
    }

    /// Execute `task_id` to a terminal state.
    ///
    /// Never fails and never panics: an id that no longer exists or is no
    /// longer queued is skipped, and every error or panic after the claim
    /// becomes a `FAILED` transition. Scratch directories are removed on
    /// every path.
    pub async fn execute(&self, task_id: String) {
        let span = info_span!("task", task_id = %task_id);
        async {
            let Some(original) = self.claim(&task_id).await else {
                return;
            };
            let layout = TaskLayout::new(&self.data_dir, &task_id);
            let started = Instant::now();

            let outcome = AssertUnwindSafe(self.run(&task_id, &layout, &original, started))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(PipelineError::Panicked(panic_message(panic.as_ref()))));

            remove_dir_quietly(layout.input_dir()).await;
            remove_dir_quietly(layout.output_dir()).await;

            match outcome {
                Ok(stats) => info!(
                    kidney_volume = stats.kidney_volume,
                    tumor_volume = stats.tumor_volume,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "task completed"
                ),
                Err(PipelineError::Deleted) => {
                    info!("task deleted while running; discarding its files");
                    remove_dir_quietly(layout.dir().to_path_buf()).await;
                }
                Err(e) => self.record_failure(&task_id, &layout, e).await,
            }
        }
        .instrument(span)
        .await
    }

    /// `QUEUED → PROCESSING`; returns the original artifact path.
    async fn claim(&self, task_id: &str) -> Option<PathBuf> {
        let claimed = self
            .store
            .update(task_id, |t| {
                t.claim("preparing input")?;
                Ok(t.original_path.clone())
            })
            .await;
        match claimed {
            Ok(original) => Some(original),
            Err(StoreError::NotFound { .. }) => {
                debug!("task no longer exists; skipping");
                None
            }
            Err(StoreError::Transition(e)) => {
                warn!(error = %e, "task is not queued; skipping");
                None
            }
            Err(e) => {
                error!(error = %e, "failed to claim task");
                None
            }
        }
    }

    async fn run(
        &self,
        task_id: &str,
        layout: &TaskLayout,
        original: &Path,
        started: Instant,
    ) -> Result<VolumeStats, PipelineError> {
        let input_dir = layout.input_dir();
        let output_dir = layout.output_dir();

        let runner_input = layout.runner_input(task_id, VolumeExt::of_path(original));
        let prepare = {
            let (original, input_dir, output_dir) = (original.to_path_buf(), input_dir.clone(), output_dir.clone());
            tokio::task::spawn_blocking(move || prepare_layout(&original, &input_dir, &output_dir, &runner_input))
        };
        prepare.await??;
        self.advance(task_id, 20, "running segmentation").await?;

        self.segmenter.segment(task_id, &input_dir, &output_dir).await?;
        self.advance(task_id, 80, "processing segmentation result").await?;

        let segmentation = {
            let layout = layout.clone();
            tokio::task::spawn_blocking(move || -> Result<PathBuf, PipelineError> {
                let produced = locate_output(&layout.output_dir())?;
                let target = layout.segmentation(VolumeExt::of_path(&produced));
                std::fs::rename(&produced, &target)?;
                Ok(target)
            })
            .await??
        };
        self.advance(task_id, 90, "computing volume statistics").await?;

        let stats = {
            let segmentation = segmentation.clone();
            match tokio::task::spawn_blocking(move || analyzer::compute_volumes(&segmentation)).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(error = %e, "volume analysis aborted; reporting zero");
                    VolumeStats::default()
                }
            }
        };

        let processing_time = started.elapsed().as_secs_f64();
        self.store
            .update(task_id, move |t| Ok(t.complete(segmentation, stats, processing_time)?))
            .await?;
        Ok(stats)
    }

    async fn advance(&self, task_id: &str, progress: u8, message: &'static str) -> Result<(), PipelineError> {
        self.store
            .update(task_id, |t| Ok(t.advance(progress, message)?))
            .await?;
        debug!(progress, message, "task progress");
        Ok(())
    }

    async fn record_failure(&self, task_id: &str, layout: &TaskLayout, err: PipelineError) {
        warn!(error = %err, "task failed");
        for ext in [VolumeExt::NiiGz, VolumeExt::Nii] {
            let _ = tokio::fs::remove_file(layout.segmentation(ext)).await;
        }

        let message = format!("inference failed: {err}");
        match self
            .store
            .update(task_id, |t: &mut Task| Ok(t.fail(message)?))
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotFound { .. }) => {
                debug!("task deleted before its failure could be recorded");
                remove_dir_quietly(layout.dir().to_path_buf()).await;
            }
            Err(e) => error!(error = %e, "failed to record task failure"),
        }
    }
}

/// Fresh `input/` holding the runner's copy of the original, and an empty
/// `output/`.
fn prepare_layout(original: &Path, input_dir: &Path, output_dir: &Path, runner_input: &Path) -> std::io::Result<()> {
    for dir in [input_dir, output_dir] {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        std::fs::create_dir_all(dir)?;
    }
    std::fs::copy(original, runner_input)?;
    Ok(())
}

async fn remove_dir_quietly(dir: PathBuf) {
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove directory"),
    }
}
