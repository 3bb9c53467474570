//! On-disk layout owned by each task.
//!
//! ```text
//! <data_dir>/<task_id>/
//!     original.<ext>          uploaded scan
//!     segmentation.<ext>      written on completion
//!     input/                  scratch, removed after every run
//!     output/                 scratch, removed after every run
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::volume::Interpolation;

/// Accepted volume file extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeExt {
    NiiGz,
    Nii,
}

impl VolumeExt {
    /// Detect the extension of `name`, case-insensitively.
    pub fn of(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".nii.gz") {
            Some(VolumeExt::NiiGz)
        } else if lower.ends_with(".nii") {
            Some(VolumeExt::Nii)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VolumeExt::NiiGz => "nii.gz",
            VolumeExt::Nii => "nii",
        }
    }

    /// Extension of a path written by this crate, defaulting to `.nii.gz`.
    pub fn of_path(path: &Path) -> Self {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::of)
            .unwrap_or(VolumeExt::NiiGz)
    }
}

/// The two artifacts a task can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ArtifactKind {
    Original,
    Segmentation,
}

impl ArtifactKind {
    /// Labels must stay discrete; intensities may be blended.
    pub fn interpolation(self) -> Interpolation {
        match self {
            ArtifactKind::Original => Interpolation::Linear,
            ArtifactKind::Segmentation => Interpolation::Nearest,
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    /// Accepts `original` / `segmentation`, optionally with `.nii` or `.nii.gz`.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let stem = name
            .strip_suffix(".nii.gz")
            .or_else(|| name.strip_suffix(".nii"))
            .unwrap_or(name);
        match stem {
            "original" => Ok(ArtifactKind::Original),
            "segmentation" => Ok(ArtifactKind::Segmentation),
            _ => Err(format!("invalid artifact name '{name}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskLayout {
    dir: PathBuf,
}

impl TaskLayout {
    pub fn new(data_dir: &Path, task_id: &str) -> Self {
        Self {
            dir: data_dir.join(task_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn original(&self, ext: VolumeExt) -> PathBuf {
        self.dir.join(format!("original.{}", ext.as_str()))
    }

    pub fn segmentation(&self, ext: VolumeExt) -> PathBuf {
        self.dir.join(format!("segmentation.{}", ext.as_str()))
    }

    pub fn input_dir(&self) -> PathBuf {
        self.dir.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.join("output")
    }

    /// Path of the runner input file: `<task_id>_0000.<ext>`, the modality
    /// suffix the segmentation tool expects.
    pub fn runner_input(&self, task_id: &str, ext: VolumeExt) -> PathBuf {
        self.input_dir().join(format!("{task_id}_0000.{}", ext.as_str()))
    }

    /// First existing file for `kind`, preferring `.nii.gz`.
    pub fn find_artifact(&self, kind: ArtifactKind) -> Option<PathBuf> {
        [VolumeExt::NiiGz, VolumeExt::Nii]
            .into_iter()
            .map(|ext| match kind {
                ArtifactKind::Original => self.original(ext),
                ArtifactKind::Segmentation => self.segmentation(ext),
            })
            .find(|p| p.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_are_detected_case_insensitively() {
        assert_eq!(VolumeExt::of("CASE_00001.NII.GZ"), Some(VolumeExt::NiiGz));
        assert_eq!(VolumeExt::of("scan.nii"), Some(VolumeExt::Nii));
        assert_eq!(VolumeExt::of("scan.dcm"), None);
        assert_eq!(VolumeExt::of("scan.gz"), None);
    }

    #[test]
    fn artifact_names_accept_optional_extension() {
        assert_eq!("original".parse(), Ok(ArtifactKind::Original));
        assert_eq!("segmentation.nii.gz".parse(), Ok(ArtifactKind::Segmentation));
        assert_eq!("original.nii".parse(), Ok(ArtifactKind::Original));
        assert!("../etc/passwd".parse::<ArtifactKind>().is_err());
        assert!("Segmentation".parse::<ArtifactKind>().is_err());
    }

    #[test]
    fn segmentation_uses_nearest_sampling() {
        assert_eq!(ArtifactKind::Segmentation.interpolation(), Interpolation::Nearest);
        assert_eq!(ArtifactKind::Original.interpolation(), Interpolation::Linear);
    }

    #[test]
    fn paths_are_rooted_in_the_task_dir() {
        let layout = TaskLayout::new(Path::new("/data"), "abc");
        assert_eq!(layout.original(VolumeExt::NiiGz), PathBuf::from("/data/abc/original.nii.gz"));
        assert_eq!(
            layout.runner_input("abc", VolumeExt::Nii),
            PathBuf::from("/data/abc/input/abc_0000.nii")
        );
        assert_eq!(layout.output_dir(), PathBuf::from("/data/abc/output"));
    }
}
