//! The inference seam.
//!
//! A [`Segmenter`] turns an input directory holding one modality-suffixed
//! volume into an output directory holding exactly one result volume. The
//! production implementation is [`NnUnetRunner`], which drives the external
//! nnU-Net CLI; tests substitute in-process fakes.

mod nnunet;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub use nnunet::NnUnetRunner;

use crate::layout::VolumeExt;

/// Why a segmentation call failed. Each cause renders a distinct message.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Neither candidate checkpoint exists; a configuration problem.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("failed to launch segmentation process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("segmentation process exited with status {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("segmentation process timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("no result produced in {}", dir.display())]
    NoOutput { dir: PathBuf },

    #[error("ambiguous result: {count} volumes in {}", dir.display())]
    AmbiguousOutput { dir: PathBuf, count: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Segmenter: Send + Sync + 'static {
    /// Segment the single volume in `input_dir`, writing the result into
    /// `output_dir`. Blocks the calling task until the call finishes.
    async fn segment(&self, task_id: &str, input_dir: &Path, output_dir: &Path) -> Result<(), RunnerError>;
}

/// The one result volume in `dir`.
///
/// Zero volumes is [`RunnerError::NoOutput`]; more than one is
/// [`RunnerError::AmbiguousOutput`]. Files that are not `.nii`/`.nii.gz`
/// (logs, plans, json summaries) are ignored.
pub fn locate_output(dir: &Path) -> Result<PathBuf, RunnerError> {
    let mut found = Vec::new();
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                let is_volume = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(VolumeExt::of)
                    .is_some();
                if is_volume && entry.file_type()?.is_file() {
                    found.push(path);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    match found.len() {
        0 => Err(RunnerError::NoOutput { dir: dir.to_path_buf() }),
        1 => Ok(found.remove(0)),
        count => Err(RunnerError::AmbiguousOutput {
            dir: dir.to_path_buf(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TempDir;

    #[test]
    fn exactly_one_volume_is_located() {
        let dir = TempDir::new("locate");
        std::fs::write(dir.path().join("case.nii.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("plans.pkl"), b"x").unwrap();
        assert_eq!(locate_output(dir.path()).unwrap(), dir.path().join("case.nii.gz"));
    }

    #[test]
    fn empty_or_missing_dir_is_no_output() {
        let dir = TempDir::new("locate");
        assert!(matches!(locate_output(dir.path()), Err(RunnerError::NoOutput { .. })));
        assert!(matches!(
            locate_output(&dir.path().join("absent")),
            Err(RunnerError::NoOutput { .. })
        ));
    }

    #[test]
    fn several_volumes_are_ambiguous() {
        let dir = TempDir::new("locate");
        std::fs::write(dir.path().join("a.nii.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("b.nii"), b"x").unwrap();
        let err = locate_output(dir.path()).unwrap_err();
        assert!(matches!(err, RunnerError::AmbiguousOutput { count: 2, .. }));
        assert!(err.to_string().starts_with("ambiguous result"));
    }

    #[test]
    fn failure_causes_render_distinctly() {
        let exit = RunnerError::NonZeroExit {
            code: 1,
            stderr: "CUDA out of memory".into(),
        };
        let timeout = RunnerError::Timeout { secs: 600 };
        let missing = RunnerError::NoOutput { dir: "/out".into() };
        assert!(exit.to_string().contains("exited with status 1"));
        assert!(timeout.to_string().contains("timed out after 600s"));
        assert!(missing.to_string().starts_with("no result produced"));
    }
}
