//! Content-addressed cache of downsampled artifact previews.
//!
//! Entries live at `<root>/<key[..2]>/<key>.nii.gz`, where `key` is the
//! SHA-256 of `(task id, artifact, factor)`. An entry is written once through
//! a temporary file and a rename, so readers never see a partial file.
//! Concurrent misses for the same key may both compute it; the last rename
//! wins and the bytes are identical. There is no invalidation: artifacts are
//! write-once per task.

use std::fmt::Write as _;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use sha2::Digest as _;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::layout::ArtifactKind;
use crate::volume::{Volume, VolumeError};

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("artifact not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the file-serving layer should send back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServedArtifact {
    pub path: PathBuf,
    /// `false` when the original was served in place of a preview.
    pub is_preview: bool,
    /// The factor actually applied; `None` for the original.
    pub factor: Option<u32>,
}

impl ServedArtifact {
    fn original(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            is_preview: false,
            factor: None,
        }
    }
}

#[derive(Debug)]
pub struct PreviewCache {
    root: PathBuf,
    factors: RangeInclusive<u32>,
    generated: AtomicU64,
}

impl PreviewCache {
    pub fn new(root: impl Into<PathBuf>, factors: RangeInclusive<u32>) -> Self {
        Self {
            root: root.into(),
            factors,
            generated: AtomicU64::new(0),
        }
    }

    pub fn factors(&self) -> &RangeInclusive<u32> {
        &self.factors
    }

    /// Number of entries this instance has computed.
    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    pub fn cache_key(task_id: &str, kind: ArtifactKind, factor: u32) -> String {
        let mut hasher = sha2::Sha256::new();
        hasher.update(task_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(kind.as_ref().as_bytes());
        hasher.update([0u8]);
        hasher.update(factor.to_string().as_bytes());
        let digest = hasher.finalize();

        let mut key = String::with_capacity(64);
        for b in digest.iter() {
            let _ = write!(&mut key, "{:02x}", b);
        }
        key
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(&key[..2]).join(format!("{key}.nii.gz"))
    }

    /// Serve a preview of `source` at `factor`, computing it on a miss.
    ///
    /// A factor outside the configured range, or any failure while
    /// downsampling, serves `source` itself with `is_preview = false`. Only a
    /// missing source is an error.
    pub async fn serve(
        &self,
        task_id: &str,
        kind: ArtifactKind,
        source: &Path,
        factor: u32,
    ) -> Result<ServedArtifact, PreviewError> {
        match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(PreviewError::NotFound {
                    path: source.to_path_buf(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PreviewError::NotFound {
                    path: source.to_path_buf(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        if !self.factors.contains(&factor) {
            warn!(
                task_id,
                artifact = %kind,
                factor,
                reason = "factor_out_of_range",
                "serving original instead of preview"
            );
            return Ok(ServedArtifact::original(source));
        }

        let key = Self::cache_key(task_id, kind, factor);
        let entry = self.entry_path(&key);
        if tokio::fs::try_exists(&entry).await.unwrap_or(false) {
            debug!(task_id, artifact = %kind, factor, "preview cache hit");
            return Ok(Self::preview(entry, factor));
        }

        let started = std::time::Instant::now();
        let job = {
            let source = source.to_path_buf();
            let entry = entry.clone();
            tokio::task::spawn_blocking(move || build_entry(&source, &entry, kind, factor))
        };
        let outcome = match job.await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(format!("preview worker failed: {e}")),
        };

        match outcome {
            Ok(bytes) => {
                self.generated.fetch_add(1, Ordering::Relaxed);
                info!(
                    task_id,
                    artifact = %kind,
                    factor,
                    bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "preview generated"
                );
                Ok(Self::preview(entry, factor))
            }
            Err(error) => {
                warn!(
                    task_id,
                    artifact = %kind,
                    factor,
                    reason = "downsample_failed",
                    error = %error,
                    "serving original instead of preview"
                );
                Ok(ServedArtifact::original(source))
            }
        }
    }

    /// Remove every cached preview of `kind` for `task_id`. Returns the
    /// number of entries removed.
    pub async fn evict(&self, task_id: &str, kind: ArtifactKind) -> usize {
        let mut removed = 0;
        for factor in self.factors.clone() {
            let entry = self.entry_path(&Self::cache_key(task_id, kind, factor));
            match tokio::fs::remove_file(&entry).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(task_id, artifact = %kind, factor, error = %e, "failed to evict preview"),
            }
        }
        if removed > 0 {
            debug!(task_id, artifact = %kind, removed, "evicted previews");
        }
        removed
    }

    fn preview(path: PathBuf, factor: u32) -> ServedArtifact {
        ServedArtifact {
            path,
            is_preview: true,
            factor: Some(factor),
        }
    }
}

#[derive(Debug, Error)]
enum BuildError {
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Downsample `source` and persist it at `entry`; returns the bytes written.
fn build_entry(source: &Path, entry: &Path, kind: ArtifactKind, factor: u32) -> Result<usize, BuildError> {
    let volume = Volume::read(source)?;
    let bytes = volume.downsample(factor, kind.interpolation())?.encode_gz()?;
    write_atomic(entry, &bytes)?;
    Ok(bytes.len())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("cache entry has no parent directory"))?;
    std::fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|s| s.to_str()).unwrap_or("entry"),
        uuid::Uuid::new_v4()
    ));
    let written = std::fs::write(&tmp, bytes).and_then(|()| std::fs::rename(&tmp, path));
    if written.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    written
}
