#![forbid(unsafe_code)]

use super::RunRow;
use serde_json::Value as JsonValue;
use std::fmt;
use tr_core::{ArtifactsManifest, JobId, QueueName, RunId, WorkerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    Claimed,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "claimed" => Some(Self::Claimed),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Statuses that carry a worker lease.
    pub fn is_leased(self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct JobRow {
    pub id: String,
    pub run_id: String,
    pub queue: String,
    pub status: JobStatus,
    pub worker_id: Option<String>,
    pub lease_expires_at_ms: Option<i64>,
    pub attempts: i64,
    pub previous_worker_id: Option<String>,
    pub error_summary: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct JobEventRow {
    pub seq: i64,
    pub job_id: String,
    pub ts_ms: i64,
    pub kind: String,
    pub message: String,
    pub meta_json: Option<String>,
}

#[derive(Clone, Debug)]
pub struct JobCreateRequest {
    pub run_id: RunId,
    pub queue: QueueName,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct JobClaimNextRequest {
    pub queue: QueueName,
    pub worker_id: WorkerId,
    pub now_ms: i64,
    pub lease_ttl_ms: u64,
}

#[derive(Clone, Debug)]
pub struct JobClaim {
    pub job: JobRow,
    /// A previous owner may have left partial side effects behind.
    pub is_adoption: bool,
}

#[derive(Clone, Debug)]
pub struct JobHeartbeatRequest {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub now_ms: i64,
    pub lease_ttl_ms: u64,
}

#[derive(Clone, Debug)]
pub struct JobOwnerRequest {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct RunFailure {
    /// `USER_ERROR` or one of the `ErrorKind` codes.
    pub error_code: String,
    /// Display-safe text only.
    pub error_summary: String,
    pub error_detail: Option<JsonValue>,
}

#[derive(Clone, Debug)]
pub enum RunCompletion {
    Succeeded {
        ui_payload: JsonValue,
        manifest: ArtifactsManifest,
    },
    Failed(RunFailure),
}

#[derive(Clone, Debug)]
pub struct JobCompleteRequest {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub now_ms: i64,
    pub outcome: RunCompletion,
}

#[derive(Clone, Debug)]
pub struct JobCompleteResult {
    pub job: JobRow,
    pub run: RunRow,
    /// The run was already terminal and was left untouched.
    pub run_already_final: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobsStatusCounts {
    pub queued: u64,
    pub claimed: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
}
