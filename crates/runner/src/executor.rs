#![forbid(unsafe_code)]

use serde_json::{Value, json};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;
use tr_core::{IdError, OUTPUT_ROOT, RunId, ToolError};
use tr_storage::RunRow;

pub const INPUT_DIR: &str = "input";
pub const RESULT_FILE: &str = "result.json";
pub const STDERR_FILE: &str = "stderr.log";
const CONTEXT_FILE: &str = "context.json";
const MEMORY_FILE: &str = "memory.json";
const STDERR_TAIL_CHARS: usize = 400;
const DEFAULT_WAIT_POLL: Duration = Duration::from_millis(50);

/// Everything a sandbox needs to run one job.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub run_id: RunId,
    pub tool_version_id: String,
    pub context: Value,
    /// Relative to `<run_dir>/input`.
    pub input_files: Vec<String>,
    pub memory: Value,
    pub run_dir: PathBuf,
}

impl ExecutionRequest {
    pub fn for_run(run: &RunRow, run_dir: PathBuf) -> Result<Self, IdError> {
        Ok(Self {
            run_id: RunId::try_new(run.id.as_str())?,
            run_dir,
            tool_version_id: run.tool_version_id.clone(),
            context: run.context.clone(),
            input_files: run.input_files.clone(),
            memory: run.memory.clone(),
        })
    }

    pub fn input_dir(&self) -> PathBuf {
        self.run_dir.join(INPUT_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.run_dir.join(OUTPUT_ROOT)
    }

    pub fn result_path(&self) -> PathBuf {
        self.run_dir.join(RESULT_FILE)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub exit_code: Option<i32>,
    /// Raw result document bytes; `None` when the sandbox wrote none.
    pub result: Option<Vec<u8>>,
}

/// Set by the worker when the job's lease is lost; executors stop as soon as they notice.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("prepare run directory {}: {source}", .path.display())]
    Prepare { path: PathBuf, source: io::Error },
    #[error("input file is missing from the run directory (path={path})")]
    MissingInput { path: String },
    #[error("failed to spawn sandbox ({program}): {source}")]
    Spawn { program: String, source: io::Error },
    #[error("wait for sandbox: {0}")]
    Wait(#[source] io::Error),
    #[error("sandbox exited with {exit} and wrote no result document")]
    Crashed { exit: String, stderr_tail: String },
    #[error("read result document: {0}")]
    ReadResult(#[source] io::Error),
    #[error("sandbox execution was cancelled")]
    Cancelled,
    #[error("sandbox executor panicked: {0}")]
    Panicked(String),
}

impl ExecutorError {
    /// Diagnostic detail for logs and the run's `error_detail`.
    pub fn detail(&self) -> Value {
        match self {
            Self::Prepare { path, source } => json!({
                "reason": "prepare_failed",
                "path": path.display().to_string(),
                "error": source.to_string(),
            }),
            Self::MissingInput { path } => json!({ "reason": "missing_input", "path": path }),
            Self::Spawn { program, source } => json!({
                "reason": "spawn_failed",
                "program": program,
                "error": source.to_string(),
            }),
            Self::Wait(source) => json!({ "reason": "wait_failed", "error": source.to_string() }),
            Self::Crashed { exit, stderr_tail } => json!({
                "reason": "crashed",
                "exit": exit,
                "stderr_tail": stderr_tail,
            }),
            Self::ReadResult(source) => {
                json!({ "reason": "result_unreadable", "error": source.to_string() })
            }
            Self::Cancelled => json!({ "reason": "cancelled" }),
            Self::Panicked(message) => json!({ "reason": "panicked", "message": message }),
        }
    }
}

impl From<ExecutorError> for ToolError {
    fn from(err: ExecutorError) -> Self {
        let detail = err.detail();
        ToolError::internal(format!("sandbox execution failed: {err}"), Some(detail))
    }
}

/// Runs one job's code in isolation and hands back its raw result document.
///
/// Called from a dedicated thread while the worker keeps heartbeating; implementations
/// should poll `cancel` and return [`ExecutorError::Cancelled`] promptly once it is set.
pub trait SandboxExecutor: Send + Sync {
    fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancelFlag,
    ) -> Result<ExecutionOutput, ExecutorError>;
}

/// Spawns a configured program inside the run directory.
///
/// The program finds its inputs through `TR_*` environment variables and must write
/// `result.json` into the run directory and its artifacts under `output/`.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    wait_poll: Duration,
}

impl CommandExecutor {
    pub fn new(command: Vec<String>) -> Option<Self> {
        let mut parts = command.into_iter().filter(|part| !part.trim().is_empty());
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            wait_poll: DEFAULT_WAIT_POLL,
        })
    }

    /// Lay out `input/` and a fresh `output/`. Outputs of an earlier attempt are discarded.
    fn prepare_run_dir(&self, request: &ExecutionRequest) -> Result<PathBuf, ExecutorError> {
        let prepare = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ExecutorError::Prepare { path, source }
        };

        let input_dir = request.input_dir();
        std::fs::create_dir_all(&input_dir).map_err(prepare(&input_dir))?;
        for rel in &request.input_files {
            if !input_dir.join(rel).is_file() {
                return Err(ExecutorError::MissingInput { path: rel.clone() });
            }
        }
        write_json(&input_dir.join(CONTEXT_FILE), &request.context)?;
        write_json(&input_dir.join(MEMORY_FILE), &request.memory)?;

        let output_dir = request.output_dir();
        if output_dir.exists() {
            std::fs::remove_dir_all(&output_dir).map_err(prepare(&output_dir))?;
        }
        std::fs::create_dir_all(&output_dir).map_err(prepare(&output_dir))?;

        let result_path = request.result_path();
        match std::fs::remove_file(&result_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(prepare(&result_path)(err)),
        }

        std::fs::canonicalize(&request.run_dir).map_err(prepare(&request.run_dir))
    }
}

impl SandboxExecutor for CommandExecutor {
    fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancelFlag,
    ) -> Result<ExecutionOutput, ExecutorError> {
        let run_dir = self.prepare_run_dir(request)?;
        let stderr_path = run_dir.join(STDERR_FILE);
        let stderr = File::create(&stderr_path).map_err(|source| ExecutorError::Prepare {
            path: stderr_path.clone(),
            source,
        })?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&run_dir)
            .env("TR_RUN_ID", request.run_id.as_str())
            .env("TR_TOOL_VERSION_ID", &request.tool_version_id)
            .env("TR_RUN_DIR", &run_dir)
            .env("TR_INPUT_DIR", run_dir.join(INPUT_DIR))
            .env("TR_OUTPUT_DIR", run_dir.join(OUTPUT_ROOT))
            .env("TR_RESULT_PATH", run_dir.join(RESULT_FILE))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let status = loop {
            if let Some(status) = child.try_wait().map_err(ExecutorError::Wait)? {
                break status;
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecutorError::Cancelled);
            }
            sleep(self.wait_poll);
        };

        let result = match std::fs::read(run_dir.join(RESULT_FILE)) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(ExecutorError::ReadResult(err)),
        };
        if result.is_none() && !status.success() {
            return Err(ExecutorError::Crashed {
                exit: format_exit_status(&status),
                stderr_tail: read_stderr_tail(&stderr_path, STDERR_TAIL_CHARS),
            });
        }

        Ok(ExecutionOutput {
            exit_code: status.code(),
            result,
        })
    }
}

fn write_json(path: &Path, value: &Value) -> Result<(), ExecutorError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| ExecutorError::Prepare {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })?;
    std::fs::write(path, bytes).map_err(|source| ExecutorError::Prepare {
        path: path.to_path_buf(),
        source,
    })
}

fn format_exit_status(status: &ExitStatus) -> String {
    status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

/// Last `tail_chars` of the captured stderr, folded onto one line.
fn read_stderr_tail(stderr_path: &Path, tail_chars: usize) -> String {
    let raw = match std::fs::read(stderr_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(_) => return "-".to_string(),
    };
    let folded = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if folded.is_empty() {
        return "-".to_string();
    }
    let total = folded.chars().count();
    folded.chars().skip(total.saturating_sub(tail_chars)).collect()
}
