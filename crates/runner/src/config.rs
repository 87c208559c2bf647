#![forbid(unsafe_code)]

use crate::error::RunnerError;
use std::path::{Path, PathBuf};
use tr_core::{QueueName, WorkerId};

pub const DEFAULT_STORAGE_DIRNAME: &str = ".toolrun";
pub const RUNS_DIRNAME: &str = "runs";
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;
pub const DEFAULT_POLL_MS: u64 = 1_000;
pub const DEFAULT_MAX_POLL_MS: u64 = 10_000;
pub const DEFAULT_LEASE_TTL_MS: u64 = 60_000;
const MIN_LEASE_TTL_MS: u64 = 1_000;
const MAX_LEASE_TTL_MS: u64 = 600_000; // 10 minutes
const MIN_HEARTBEAT_MS: u64 = 10;

pub fn default_runs_dir(storage_dir: &Path) -> PathBuf {
    storage_dir.join(RUNS_DIRNAME)
}

/// Settings of one worker process.
///
/// Built from CLI flags by the binary, or directly in tests. Call [`WorkerConfig::validate`]
/// before use; [`crate::Worker::new`] does so itself.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub storage_dir: PathBuf,
    /// Root of the per-run directories (`<runs_dir>/<run_id>/{input,output}`).
    pub runs_dir: PathBuf,
    pub queue: QueueName,
    pub worker_id: WorkerId,
    /// Process at most one job, then return.
    pub once: bool,
    pub max_concurrency: usize,
    pub poll_ms: u64,
    pub max_poll_ms: u64,
    pub lease_ttl_ms: u64,
    /// `0` means a third of the lease TTL.
    pub heartbeat_ms: u64,
}

impl WorkerConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        let storage_dir = storage_dir.into();
        Self {
            runs_dir: default_runs_dir(&storage_dir),
            storage_dir,
            queue: QueueName::default_queue(),
            worker_id: WorkerId::generate(),
            once: false,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            poll_ms: DEFAULT_POLL_MS,
            max_poll_ms: DEFAULT_MAX_POLL_MS,
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            heartbeat_ms: 0,
        }
    }

    pub fn validate(mut self) -> Result<Self, RunnerError> {
        if self.max_concurrency == 0 {
            return Err(RunnerError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.poll_ms == 0 {
            return Err(RunnerError::Config("poll_ms must be at least 1".to_string()));
        }
        self.max_poll_ms = self.max_poll_ms.max(self.poll_ms);

        self.lease_ttl_ms = self.lease_ttl_ms.clamp(MIN_LEASE_TTL_MS, MAX_LEASE_TTL_MS);
        if self.heartbeat_ms == 0 {
            self.heartbeat_ms = self.lease_ttl_ms / 3;
        }
        self.heartbeat_ms = self.heartbeat_ms.max(MIN_HEARTBEAT_MS);
        if self.heartbeat_ms >= self.lease_ttl_ms {
            return Err(RunnerError::Config(format!(
                "heartbeat_ms ({}) must be shorter than lease_ttl_ms ({})",
                self.heartbeat_ms, self.lease_ttl_ms
            )));
        }
        Ok(self)
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }
}
