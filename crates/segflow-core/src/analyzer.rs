//! Label volume statistics for a finished segmentation.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::volume::{Volume, VolumeError};

/// Label value of the kidney in segmentation artifacts.
pub const KIDNEY_LABEL: f64 = 1.0;
/// Label value of the tumor in segmentation artifacts.
pub const TUMOR_LABEL: f64 = 2.0;

/// Per-label volumes in cubic millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStats {
    pub kidney_volume: f64,
    pub tumor_volume: f64,
}

/// Count label voxels and scale by the voxel volume.
pub fn try_compute_volumes(segmentation: &Path) -> Result<VolumeStats, VolumeError> {
    let volume = Volume::read(segmentation)?;
    Ok(volumes_of(&volume))
}

/// Same as [`try_compute_volumes`] but never fails: any read or geometry
/// error yields zero volumes.
pub fn compute_volumes(segmentation: &Path) -> VolumeStats {
    match try_compute_volumes(segmentation) {
        Ok(stats) => stats,
        Err(e) => {
            warn!(path = %segmentation.display(), error = %e, "volume statistics unavailable; reporting zero");
            VolumeStats::default()
        }
    }
}

pub fn volumes_of(volume: &Volume) -> VolumeStats {
    let voxel_volume: f64 = volume.spacing().iter().map(|s| f64::from(s.abs())).product();
    let (mut kidney, mut tumor) = (0u64, 0u64);
    for value in volume.values() {
        if value == KIDNEY_LABEL {
            kidney += 1;
        } else if value == TUMOR_LABEL {
            tumor += 1;
        }
    }
    debug!(kidney_voxels = kidney, tumor_voxels = tumor, voxel_volume, "counted label voxels");
    VolumeStats {
        kidney_volume: kidney as f64 * voxel_volume,
        tumor_volume: tumor as f64 * voxel_volume,
    }
}
