//! The [`Task`] record and its lifecycle transitions.
//!
//! Every status change goes through one of the transition methods below so
//! the lifecycle invariants hold no matter which store persists the record:
//!
//! - `QUEUED → PROCESSING` only via [`Task::claim`];
//! - progress never decreases while the task is non-terminal;
//! - volumes and processing time are present if and only if the task is
//!   `COMPLETED`;
//! - `completed_at` is set exactly when a terminal state is entered.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analyzer::VolumeStats;

/// High-level lifecycle state of a segmentation task.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted and waiting for a worker.
    Queued,
    /// Claimed by a worker; the pipeline is running.
    Processing,
    /// Segmentation and statistics are available.
    Completed,
    /// The last run failed; `message` holds the reason.
    Failed,
}

impl TaskStatus {
    /// `COMPLETED` and `FAILED` are terminal: no automatic transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A lifecycle transition that the current state does not allow.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    /// The task is being processed; it cannot be re-queued or claimed again.
    #[error("task {id} is already processing")]
    Busy { id: String },

    /// The transition requires a different source state.
    #[error("task {id} is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        actual: TaskStatus,
        expected: &'static str,
    },

    /// Progress only moves forward while a task is running.
    #[error("progress for task {id} may not decrease from {current} to {requested}")]
    ProgressRegression {
        id: String,
        current: u8,
        requested: u8,
    },
}

/// One submitted segmentation job and its lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    /// Original upload name; metadata only.
    pub filename: String,
    pub original_path: PathBuf,
    /// Unset until the task is `COMPLETED`.
    pub segmentation_path: Option<PathBuf>,
    pub status: TaskStatus,
    /// 0–100.
    pub progress: u8,
    pub message: Option<String>,
    /// mm³, label 1.
    pub kidney_volume: Option<f64>,
    /// mm³, label 2.
    pub tumor_volume: Option<f64>,
    /// Seconds from claim to completion.
    pub processing_time: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub const QUEUED_MESSAGE: &str = "queued";

impl Task {
    /// A fresh `QUEUED` task.
    pub fn new(id: impl Into<String>, filename: impl Into<String>, original_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            filename: filename.into(),
            original_path,
            segmentation_path: None,
            status: TaskStatus::Queued,
            progress: 0,
            message: Some(QUEUED_MESSAGE.to_owned()),
            kidney_volume: None,
            tumor_volume: None,
            processing_time: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Put the task back in the queue, keeping `id` and `original_path`.
    ///
    /// Everything produced by a previous run is cleared so that the next
    /// completion sets it exactly once.
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        if self.status == TaskStatus::Processing {
            return Err(TransitionError::Busy {
                id: self.id.clone(),
            });
        }
        self.status = TaskStatus::Queued;
        self.progress = 0;
        self.message = Some(QUEUED_MESSAGE.to_owned());
        self.clear_outputs();
        self.completed_at = None;
        Ok(())
    }

    /// Claim a queued task for execution (`PROCESSING`, progress 10).
    pub fn claim(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        match self.status {
            TaskStatus::Queued => {
                self.status = TaskStatus::Processing;
                self.progress = 10;
                self.message = Some(message.into());
                Ok(())
            }
            TaskStatus::Processing => Err(TransitionError::Busy {
                id: self.id.clone(),
            }),
            actual => Err(TransitionError::InvalidState {
                id: self.id.clone(),
                actual,
                expected: "queued",
            }),
        }
    }

    /// Move a running task forward to `progress`.
    pub fn advance(&mut self, progress: u8, message: impl Into<String>) -> Result<(), TransitionError> {
        self.expect_processing()?;
        let progress = progress.min(100);
        if progress < self.progress {
            return Err(TransitionError::ProgressRegression {
                id: self.id.clone(),
                current: self.progress,
                requested: progress,
            });
        }
        self.progress = progress;
        self.message = Some(message.into());
        Ok(())
    }

    /// Finalize a running task with its result artifact and statistics.
    pub fn complete(
        &mut self,
        segmentation_path: PathBuf,
        stats: VolumeStats,
        processing_time: f64,
    ) -> Result<(), TransitionError> {
        self.expect_processing()?;
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.message = Some("segmentation completed".to_owned());
        self.segmentation_path = Some(segmentation_path);
        self.kidney_volume = Some(stats.kidney_volume);
        self.tumor_volume = Some(stats.tumor_volume);
        self.processing_time = Some(processing_time);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Fail a non-terminal task. No result artifact stays referenced.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::InvalidState {
                id: self.id.clone(),
                actual: self.status,
                expected: "queued or processing",
            });
        }
        self.status = TaskStatus::Failed;
        self.progress = 0;
        self.message = Some(message.into());
        self.clear_outputs();
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn expect_processing(&self) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Processing {
            return Err(TransitionError::InvalidState {
                id: self.id.clone(),
                actual: self.status,
                expected: "processing",
            });
        }
        Ok(())
    }

    fn clear_outputs(&mut self) {
        self.segmentation_path = None;
        self.kidney_volume = None;
        self.tumor_volume = None;
        self.processing_time = None;
    }

    /// Statistics, present only for completed tasks.
    pub fn stats(&self) -> Option<TaskStats> {
        match (self.kidney_volume, self.tumor_volume) {
            (Some(kidney_volume), Some(tumor_volume)) => Some(TaskStats {
                kidney_volume,
                tumor_volume,
                processing_time: self.processing_time,
            }),
            _ => None,
        }
    }

    /// JSON-facing view of the record.
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            filename: self.filename.clone(),
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            stats: self.stats(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub kidney_volume: f64,
    pub tumor_volume: f64,
    pub processing_time: Option<f64>,
}

/// Serialized shape handed to outer collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: String,
    pub filename: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: Option<String>,
    pub stats: Option<TaskStats>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued() -> Task {
        Task::new("t1", "case.nii.gz", PathBuf::from("/data/t1/original.nii.gz"))
    }

    fn stats() -> VolumeStats {
        VolumeStats {
            kidney_volume: 100.0,
            tumor_volume: 50.0,
        }
    }

    #[test]
    fn status_text_round_trips_through_strum_and_serde() {
        assert_eq!(TaskStatus::Processing.to_string(), "processing");
        assert_eq!("failed".parse::<TaskStatus>().unwrap(), TaskStatus::Failed);
        assert_eq!(
            serde_json::to_string(&TaskStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn full_lifecycle_sets_outputs_once() {
        let mut task = queued();
        task.claim("preparing").unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.progress, 10);

        task.advance(20, "running").unwrap();
        task.advance(80, "post-processing").unwrap();
        task.complete(PathBuf::from("/data/t1/segmentation.nii.gz"), stats(), 12.5)
            .unwrap();

        assert!(task.is_terminal());
        assert_eq!(task.progress, 100);
        assert_eq!(task.kidney_volume, Some(100.0));
        assert!(task.completed_at.is_some());
        assert!(task.advance(100, "again").is_err());
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut task = queued();
        task.claim("preparing").unwrap();
        task.advance(80, "late").unwrap();
        let err = task.advance(20, "early").unwrap_err();
        assert!(matches!(err, TransitionError::ProgressRegression { current: 80, .. }));
        assert_eq!(task.progress, 80);
    }

    #[test]
    fn failing_clears_result_and_resets_progress() {
        let mut task = queued();
        task.claim("preparing").unwrap();
        task.advance(80, "post-processing").unwrap();
        task.fail("inference failed: exit status 1").unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.progress, 0);
        assert!(task.segmentation_path.is_none());
        assert!(task.stats().is_none());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn requeue_rejects_processing_and_resets_terminal() {
        let mut task = queued();
        task.claim("preparing").unwrap();
        assert!(matches!(task.requeue(), Err(TransitionError::Busy { .. })));

        task.complete(PathBuf::from("/seg.nii.gz"), stats(), 1.0).unwrap();
        task.requeue().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.progress, 0);
        assert_eq!(task.id, "t1");
        assert_eq!(task.original_path, PathBuf::from("/data/t1/original.nii.gz"));
        assert!(task.kidney_volume.is_none());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn claim_requires_queued() {
        let mut task = queued();
        task.fail("interrupted").unwrap();
        assert!(matches!(
            task.claim("preparing"),
            Err(TransitionError::InvalidState { actual: TaskStatus::Failed, .. })
        ));
    }

    #[test]
    fn summary_only_carries_stats_when_completed() {
        let mut task = queued();
        let json = serde_json::to_value(task.summary()).unwrap();
        assert!(json["stats"].is_null());
        assert_eq!(json["status"], "queued");

        task.claim("preparing").unwrap();
        task.complete(PathBuf::from("/seg.nii.gz"), stats(), 3.0).unwrap();
        let json = serde_json::to_value(task.summary()).unwrap();
        assert_eq!(json["stats"]["kidneyVolume"], 100.0);
        assert_eq!(json["stats"]["tumorVolume"], 50.0);
        assert!(json["completedAt"].is_string());
    }
}
