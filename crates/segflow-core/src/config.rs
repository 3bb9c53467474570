//! Runtime configuration, loaded from environment variables at startup.
//!
//! Every field has a default so the service works without any variables
//! set. Values are read through a lookup closure; [`Config::from_env`] uses
//! the process environment and tests pass a map, so no test ever mutates
//! shared process state.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Errors detected while assembling or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The model path does not follow `<results>/nnUNet/<network>/<task>/<trainer>__<plans>`.
    #[error("model path {path} does not follow <results>/nnUNet/<network>/<task>/<trainer>__<plans>")]
    InvalidModelPath { path: PathBuf },

    #[error("worker pool size must be at least 1")]
    ZeroWorkers,

    #[error("preview factor range {min}..={max} is empty or starts below 2")]
    InvalidFactorRange { min: u32, max: u32 },

    #[error("inference timeout must be non-zero")]
    ZeroTimeout,
}

/// How the inference runner picks model weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointMode {
    /// First of `model_best`, `model_final_checkpoint` present in the model directory.
    Auto,
    /// Use this checkpoint name verbatim.
    Named(String),
}

impl FromStr for CheckpointMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            Ok(CheckpointMode::Auto)
        } else {
            Ok(CheckpointMode::Named(s.to_owned()))
        }
    }
}

/// Everything the inference runner needs to know about the active model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// `<results>/nnUNet/<network>/<task>/<trainer>__<plans>`.
    pub model_path: PathBuf,
    /// Working directory of the external tool.
    pub tool_root: PathBuf,
    /// Program used to launch the entry point (e.g. `python3`).
    pub interpreter: PathBuf,
    /// Entry script; relative paths resolve against `tool_root`.
    pub entrypoint: PathBuf,
    pub fold: u32,
    pub disable_tta: bool,
    pub network: String,
    pub task_name: String,
    pub trainer_class: String,
    pub plans_identifier: String,
    /// `RESULTS_FOLDER` for the external tool.
    pub results_folder: PathBuf,
    /// `nnUNet_raw_data_base` for the external tool.
    pub raw_data_base: PathBuf,
    /// `nnUNet_preprocessed` for the external tool.
    pub preprocessed: PathBuf,
}

impl ModelConfig {
    /// Derive network, task, trainer, plans and the tool's data folders from
    /// the model path.
    ///
    /// `raw_data_base` and `preprocessed` default to siblings of the results
    /// folder when not given.
    pub fn from_model_path(
        model_path: impl Into<PathBuf>,
        tool_root: impl Into<PathBuf>,
        raw_data_base: Option<PathBuf>,
        preprocessed: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let model_path = absolutize(&model_path.into());
        let invalid = || ConfigError::InvalidModelPath {
            path: model_path.clone(),
        };

        let names: Vec<&str> = model_path
            .components()
            .rev()
            .take(4)
            .map(|c| match c {
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(invalid)?;
        let [trainer_plans, task_name, network, _] = names.as_slice() else {
            return Err(invalid());
        };
        let (trainer_class, plans_identifier) = trainer_plans.split_once("__").ok_or_else(invalid)?;
        if trainer_class.is_empty() || plans_identifier.is_empty() {
            return Err(invalid());
        }

        let results_folder = model_path
            .ancestors()
            .nth(4)
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(invalid)?
            .to_path_buf();
        let data_root = results_folder
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| results_folder.clone());

        Ok(Self {
            network: (*network).to_owned(),
            task_name: (*task_name).to_owned(),
            trainer_class: trainer_class.to_owned(),
            plans_identifier: plans_identifier.to_owned(),
            raw_data_base: raw_data_base
                .map(|p| absolutize(&p))
                .unwrap_or_else(|| data_root.join("nnUNet_raw_data_base")),
            preprocessed: preprocessed
                .map(|p| absolutize(&p))
                .unwrap_or_else(|| data_root.join("nnUNet_preprocessed")),
            results_folder,
            model_path,
            tool_root: absolutize(&tool_root.into()),
            interpreter: PathBuf::from("python3"),
            entrypoint: PathBuf::from("eval.py"),
            fold: 0,
            disable_tta: true,
        })
    }

    /// Directory holding the weights of the configured fold.
    pub fn fold_dir(&self) -> PathBuf {
        self.model_path.join(format!("fold_{}", self.fold))
    }

    pub fn entrypoint_path(&self) -> PathBuf {
        self.tool_root.join(&self.entrypoint)
    }
}

/// Runtime configuration for segflow.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the per-task directories.
    pub data_dir: PathBuf,
    /// Root of the preview cache.
    pub cache_dir: PathBuf,
    /// Scratch area for incoming uploads.
    pub temp_dir: PathBuf,
    /// sqlx SQLite URL, e.g. `sqlite://data/segflow.db` or `sqlite::memory:`.
    pub database_url: String,
    /// Worker pool size; must not exceed the usable accelerator count.
    pub worker_count: usize,
    /// Pending submissions the pool accepts before rejecting.
    pub queue_capacity: usize,
    /// Hard wall-clock bound on one external segmentation call.
    pub inference_timeout: Duration,
    pub checkpoint: CheckpointMode,
    pub preview_factors: RangeInclusive<u32>,
    pub max_upload_bytes: u64,
    /// `tracing` filter string, e.g. `"info"` or `"debug,sqlx=warn"`.
    pub log_level: String,
    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
    pub model: ModelConfig,
}

const DEFAULT_MODEL_PATH: &str =
    "nnUNet_data/RESULTS_FOLDER/nnUNet/3d_fullres/Task001_kits/nnUNetTrainerV2__nnUNetPlansv2.1";

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build [`Config`] from an explicit key/value map.
    pub fn from_map(vars: &HashMap<String, String>) -> Self {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());
        let path_or = |key: &str, default: &str| absolutize(Path::new(&env_or(key, default)));

        let min_factor = parse_env(&lookup, "SEGFLOW_PREVIEW_MIN_FACTOR", 2u32);
        let max_factor = parse_env(&lookup, "SEGFLOW_PREVIEW_MAX_FACTOR", 8u32);

        let model_path = path_or("SEGFLOW_MODEL_PATH", DEFAULT_MODEL_PATH);
        let tool_root = path_or("SEGFLOW_TOOL_ROOT", "nnUNet");
        let raw_data_base = lookup("SEGFLOW_RAW_DATA_BASE").map(|p| absolutize(Path::new(&p)));
        let preprocessed = lookup("SEGFLOW_PREPROCESSED").map(|p| absolutize(Path::new(&p)));
        let mut model = ModelConfig::from_model_path(
            &model_path,
            &tool_root,
            raw_data_base.clone(),
            preprocessed.clone(),
        )
        .unwrap_or_else(|_| {
            // Kept so `validate` can report the bad path instead of panicking here.
            let results_folder = model_path.clone();
            ModelConfig {
                network: String::new(),
                task_name: String::new(),
                trainer_class: String::new(),
                plans_identifier: String::new(),
                raw_data_base: raw_data_base.unwrap_or_else(|| results_folder.join("nnUNet_raw_data_base")),
                preprocessed: preprocessed.unwrap_or_else(|| results_folder.join("nnUNet_preprocessed")),
                results_folder,
                model_path: model_path.clone(),
                tool_root: tool_root.clone(),
                interpreter: PathBuf::new(),
                entrypoint: PathBuf::new(),
                fold: 0,
                disable_tta: true,
            }
        });
        model.interpreter = PathBuf::from(env_or("SEGFLOW_INTERPRETER", "python3"));
        model.entrypoint = PathBuf::from(env_or("SEGFLOW_ENTRYPOINT", "eval.py"));
        model.fold = parse_env(&lookup, "SEGFLOW_FOLD", 0);
        model.disable_tta = parse_bool(lookup("SEGFLOW_DISABLE_TTA"), true);

        Self {
            data_dir: path_or("SEGFLOW_DATA_DIR", "data/results"),
            cache_dir: path_or("SEGFLOW_CACHE_DIR", "data/preview-cache"),
            temp_dir: path_or("SEGFLOW_TEMP_DIR", "data/temp"),
            database_url: env_or("SEGFLOW_DATABASE_URL", "sqlite://data/segflow.db"),
            worker_count: parse_env(&lookup, "SEGFLOW_WORKERS", 2),
            queue_capacity: parse_env(&lookup, "SEGFLOW_QUEUE_CAPACITY", 64),
            inference_timeout: Duration::from_secs(parse_env(
                &lookup,
                "SEGFLOW_INFERENCE_TIMEOUT_SECS",
                600,
            )),
            checkpoint: env_or("SEGFLOW_CHECKPOINT", "auto")
                .parse()
                .unwrap_or(CheckpointMode::Auto),
            preview_factors: min_factor..=max_factor,
            max_upload_bytes: parse_env(&lookup, "SEGFLOW_MAX_UPLOAD_BYTES", 500 * 1024 * 1024),
            log_level: env_or("SEGFLOW_LOG", "info"),
            log_json: parse_bool(lookup("SEGFLOW_LOG_JSON"), false),
            model,
        }
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.inference_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        let (min, max) = (*self.preview_factors.start(), *self.preview_factors.end());
        if min < 2 || min > max {
            return Err(ConfigError::InvalidFactorRange { min, max });
        }
        if self.model.trainer_class.is_empty() {
            return Err(ConfigError::InvalidModelPath {
                path: self.model.model_path.clone(),
            });
        }
        Ok(())
    }

    /// Create the data, cache and temp directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.data_dir, &self.cache_dir, &self.temp_dir] {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(parent) = sqlite_file_parent(&self.database_url) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn parse_env<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Directory of a file-backed SQLite URL, if it names one.
fn sqlite_file_parent(url: &str) -> Option<&Path> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    if rest.starts_with(":memory:") {
        return None;
    }
    let file = rest.split('?').next()?;
    Path::new(file).parent().filter(|p| !p.as_os_str().is_empty())
}
