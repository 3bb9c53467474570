use std::path::{Path, PathBuf};

use crate::config::ModelConfig;
use crate::volume::{Volume, VoxelData};

/// A unique scratch directory under the OS temp dir, removed on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!("segflow-{prefix}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).expect("create temp dir");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// A model layout under `root` whose entry point is a `/bin/sh` script with
/// `body`. Argument positions follow the runner's command line, so `$2` is
/// the input dir and `$4` the output dir. The fold directory exists but
/// holds no weights.
pub fn fake_model(root: &Path, body: &str) -> ModelConfig {
    let model_path = root
        .join("RESULTS_FOLDER/nnUNet/3d_fullres/Task001_kits")
        .join("nnUNetTrainerV2__nnUNetPlansv2.1");
    let tool_root = root.join("tool");
    std::fs::create_dir_all(model_path.join("fold_0")).expect("create model dir");
    std::fs::create_dir_all(&tool_root).expect("create tool root");
    std::fs::write(tool_root.join("predict.sh"), format!("#!/bin/sh\n{body}\n")).expect("write script");

    let mut model = ModelConfig::from_model_path(model_path, tool_root, None, None).expect("model path");
    model.interpreter = PathBuf::from("/bin/sh");
    model.entrypoint = PathBuf::from("predict.sh");
    model
}

/// A 2x2x2 label volume whose `vox_offset` (bytes 108..112) is finite but
/// lies far beyond any addressable payload.
pub fn unaddressable_volume() -> Vec<u8> {
    let mut bytes = Volume::from_data([2, 2, 2], [1.0; 3], VoxelData::U8(vec![1; 8]))
        .expect("volume")
        .encode();
    bytes[108..112].copy_from_slice(&1.0e30f32.to_le_bytes());
    bytes
}
