#![forbid(unsafe_code)]

pub mod config;
mod error;
pub mod executor;
pub mod logging;
pub mod materialize;
pub mod worker;

pub use config::WorkerConfig;
pub use error::RunnerError;
pub use executor::{
    CancelFlag, CommandExecutor, ExecutionOutput, ExecutionRequest, ExecutorError, SandboxExecutor,
};
pub use materialize::{RunOutcome, failure_record, materialize};
pub use worker::{JobDisposition, JobReport, Worker, WorkerSummary};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
