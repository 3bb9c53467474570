use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{RunnerError, Segmenter};
use crate::config::{CheckpointMode, Config, ConfigError, ModelConfig};

/// Checkpoints tried, in order, when the mode is [`CheckpointMode::Auto`].
pub const AUTO_CHECKPOINTS: [&str; 2] = ["model_best", "model_final_checkpoint"];

/// Output lines kept for failure diagnostics.
const TAIL_LINES: usize = 20;
/// Lines of stderr copied into the error message.
const MESSAGE_LINES: usize = 5;
const READER_GRACE: Duration = Duration::from_secs(5);

/// Runs the nnU-Net prediction entry point as a child process.
///
/// The command line is
///
/// ```text
/// <interpreter> <tool_root>/<entrypoint> -i <in> -o <out> -t <task> -m <network>
///     -tr <trainer> -p <plans> -f <fold> -chk <checkpoint> [--disable_tta]
/// ```
///
/// run with `tool_root` as working directory. The tool's data folders are
/// passed per invocation through the child's environment only.
#[derive(Debug, Clone)]
pub struct NnUnetRunner {
    model: ModelConfig,
    checkpoint: CheckpointMode,
    timeout: Duration,
}

impl NnUnetRunner {
    pub fn new(model: ModelConfig, checkpoint: CheckpointMode, timeout: Duration) -> Self {
        Self {
            model,
            checkpoint,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(
            config.model.clone(),
            config.checkpoint.clone(),
            config.inference_timeout,
        ))
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    /// Pick the checkpoint name passed as `-chk`.
    ///
    /// A named checkpoint is used verbatim. In auto mode the first of
    /// [`AUTO_CHECKPOINTS`] with weights in the fold directory or the model
    /// directory wins; weights match by file name or file stem
    /// (`model_best.model`, `model_best.model.pkl`).
    pub fn resolve_checkpoint(&self) -> Result<String, RunnerError> {
        if let CheckpointMode::Named(name) = &self.checkpoint {
            return Ok(name.clone());
        }
        let dirs = [self.model.fold_dir(), self.model.model_path.clone()];
        for candidate in AUTO_CHECKPOINTS {
            if dirs.iter().any(|dir| has_checkpoint(dir, candidate)) {
                return Ok(candidate.to_owned());
            }
        }
        Err(RunnerError::Checkpoint(format!(
            "none of {} found in {}",
            AUTO_CHECKPOINTS.join(", "),
            self.model.model_path.display()
        )))
    }

    /// Variables the tool reads to locate its data, derived from the model path.
    pub fn environment(&self) -> [(&'static str, &Path); 3] {
        [
            ("nnUNet_raw_data_base", self.model.raw_data_base.as_path()),
            ("nnUNet_preprocessed", self.model.preprocessed.as_path()),
            ("RESULTS_FOLDER", self.model.results_folder.as_path()),
        ]
    }

    fn command(&self, input_dir: &Path, output_dir: &Path, checkpoint: &str) -> Command {
        let model = &self.model;
        let mut cmd = Command::new(&model.interpreter);
        cmd.arg(model.entrypoint_path())
            .arg("-i")
            .arg(input_dir)
            .arg("-o")
            .arg(output_dir)
            .args(["-t", model.task_name.as_str()])
            .args(["-m", model.network.as_str()])
            .args(["-tr", model.trainer_class.as_str()])
            .args(["-p", model.plans_identifier.as_str()])
            .args(["-f", model.fold.to_string().as_str()])
            .args(["-chk", checkpoint]);
        if model.disable_tta {
            cmd.arg("--disable_tta");
        }
        cmd.envs(self.environment())
            .current_dir(&model.tool_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Segmenter for NnUnetRunner {
    async fn segment(&self, task_id: &str, input_dir: &Path, output_dir: &Path) -> Result<(), RunnerError> {
        let checkpoint = self.resolve_checkpoint()?;
        let mut child = self
            .command(input_dir, output_dir, &checkpoint)
            .spawn()
            .map_err(RunnerError::Spawn)?;
        info!(
            task_id,
            checkpoint = %checkpoint,
            network = %self.model.network,
            fold = self.model.fold,
            "segmentation process started"
        );
        let started = Instant::now();

        let stdout = child.stdout.take().map(|out| tokio::spawn(tail_lines(out, "stdout")));
        let stderr = child.stderr.take().map(|err| tokio::spawn(tail_lines(err, "stderr")));

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(task_id, error = %e, "failed to kill timed-out segmentation process");
                }
                warn!(task_id, timeout_secs = self.timeout.as_secs(), "segmentation process timed out");
                return Err(RunnerError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let _ = join_tail(stdout).await;
        let stderr_tail = join_tail(stderr).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !status.success() {
            for line in &stderr_tail {
                warn!(task_id, line = %line, "segmentation stderr");
            }
            let start = stderr_tail.len().saturating_sub(MESSAGE_LINES);
            let stderr = if stderr_tail.is_empty() {
                "<no stderr>".to_owned()
            } else {
                stderr_tail[start..].join(" | ")
            };
            return Err(RunnerError::NonZeroExit {
                code: status.code().unwrap_or(-1),
                stderr,
            });
        }

        info!(task_id, elapsed_ms, "segmentation process finished");
        Ok(())
    }
}

fn has_checkpoint(dir: &Path, name: &str) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    let prefix = format!("{name}.");
    entries.flatten().any(|entry| {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        file_name == name || file_name.starts_with(&prefix)
    })
}

/// Log each line at debug and keep the last [`TAIL_LINES`].
async fn tail_lines<R: AsyncRead + Unpin>(reader: R, stream: &'static str) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stream, line = %line, "segmentation output");
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

/// A grandchild that inherited the pipe can keep it open after the child
/// exits, so readers get a bounded grace period.
async fn join_tail(handle: Option<tokio::task::JoinHandle<Vec<String>>>) -> Vec<String> {
    let Some(handle) = handle else {
        return Vec::new();
    };
    match tokio::time::timeout(READER_GRACE, handle).await {
        Ok(Ok(lines)) => lines,
        _ => Vec::new(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{TempDir, fake_model};

    fn runner(root: &Path, script: &str, timeout: Duration) -> NnUnetRunner {
        NnUnetRunner::new(fake_model(root, script), CheckpointMode::Auto, timeout)
    }

    fn io_dirs(root: &Path) -> (PathBuf, PathBuf) {
        let input = root.join("input");
        let output = root.join("output");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&output).unwrap();
        std::fs::write(input.join("t1_0000.nii.gz"), b"volume").unwrap();
        (input, output)
    }

    #[test]
    fn auto_prefers_model_best() {
        let dir = TempDir::new("ckpt");
        let runner = runner(dir.path(), "exit 0", Duration::from_secs(5));
        let fold = runner.model().fold_dir();
        std::fs::write(fold.join("model_final_checkpoint.model"), b"w").unwrap();
        assert_eq!(runner.resolve_checkpoint().unwrap(), "model_final_checkpoint");

        std::fs::write(fold.join("model_best.model"), b"w").unwrap();
        assert_eq!(runner.resolve_checkpoint().unwrap(), "model_best");
    }

    #[test]
    fn missing_checkpoints_are_a_configuration_error() {
        let dir = TempDir::new("ckpt");
        let runner = runner(dir.path(), "exit 0", Duration::from_secs(5));
        let err = runner.resolve_checkpoint().unwrap_err();
        assert!(matches!(err, RunnerError::Checkpoint(_)));

        let named = NnUnetRunner {
            checkpoint: CheckpointMode::Named("model_ep_100".into()),
            ..runner
        };
        assert_eq!(named.resolve_checkpoint().unwrap(), "model_ep_100");
    }

    #[tokio::test]
    async fn passes_cli_contract_and_environment() {
        let dir = TempDir::new("runner");
        let script = r#"
out="$4"
printf '%s\n' "$@" > "$out/args.txt"
printf '%s\n' "$RESULTS_FOLDER" "$nnUNet_raw_data_base" "$nnUNet_preprocessed" > "$out/env.txt"
pwd > "$out/cwd.txt"
"#;
        let runner = runner(dir.path(), script, Duration::from_secs(10));
        std::fs::write(runner.model().fold_dir().join("model_best.model"), b"w").unwrap();
        let (input, output) = io_dirs(dir.path());

        runner.segment("t1", &input, &output).await.unwrap();

        let args = std::fs::read_to_string(output.join("args.txt")).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(args[0], "-i");
        assert_eq!(args[1], input.to_str().unwrap());
        assert!(args.windows(2).any(|w| w == ["-t", "Task001_kits"]));
        assert!(args.windows(2).any(|w| w == ["-chk", "model_best"]));
        assert!(args.windows(2).any(|w| w == ["-f", "0"]));
        assert_eq!(args.last(), Some(&"--disable_tta"));

        let model = runner.model();
        let env = std::fs::read_to_string(output.join("env.txt")).unwrap();
        let env: Vec<&str> = env.lines().collect();
        assert_eq!(env[0], model.results_folder.to_str().unwrap());
        assert_eq!(env[1], model.raw_data_base.to_str().unwrap());
        assert_eq!(env[2], model.preprocessed.to_str().unwrap());

        let cwd = std::fs::read_to_string(output.join("cwd.txt")).unwrap();
        assert_eq!(
            std::fs::canonicalize(cwd.trim()).unwrap(),
            std::fs::canonicalize(&model.tool_root).unwrap()
        );
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let dir = TempDir::new("runner");
        let runner = runner(dir.path(), "echo 'RuntimeError: CUDA out of memory' >&2\nexit 3", Duration::from_secs(10));
        std::fs::write(runner.model().fold_dir().join("model_best.model"), b"w").unwrap();
        let (input, output) = io_dirs(dir.path());

        let err = runner.segment("t1", &input, &output).await.unwrap_err();
        match err {
            RunnerError::NonZeroExit { code, stderr } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("CUDA out of memory"));
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_process_times_out() {
        let dir = TempDir::new("runner");
        let runner = runner(dir.path(), "exec sleep 30", Duration::from_millis(300));
        std::fs::write(runner.model().fold_dir().join("model_best.model"), b"w").unwrap();
        let (input, output) = io_dirs(dir.path());

        let started = Instant::now();
        let err = runner.segment("t1", &input, &output).await.unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_spawn_error() {
        let dir = TempDir::new("runner");
        let mut model = fake_model(dir.path(), "exit 0");
        model.interpreter = dir.path().join("no-such-interpreter");
        let runner = NnUnetRunner::new(model, CheckpointMode::Named("model_best".into()), Duration::from_secs(5));
        let (input, output) = io_dirs(dir.path());

        let err = runner.segment("t1", &input, &output).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn(_)));
    }
}
