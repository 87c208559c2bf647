#![forbid(unsafe_code)]

use super::JobRow;
use serde_json::Value as JsonValue;
use std::fmt;
use tr_core::{ArtifactsManifest, QueueName, RunId, ToolId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct RunRow {
    pub id: String,
    pub tool_id: String,
    pub tool_version_id: String,
    pub status: RunStatus,
    pub context: JsonValue,
    pub input_files: Vec<String>,
    pub memory: JsonValue,
    pub ui_payload: Option<JsonValue>,
    pub artifacts_manifest: Option<ArtifactsManifest>,
    pub error_kind: Option<String>,
    pub error_summary: Option<String>,
    pub error_detail: Option<JsonValue>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct RunCreateRequest {
    /// Generated when absent.
    pub run_id: Option<RunId>,
    pub tool_id: ToolId,
    pub tool_version_id: String,
    pub context: JsonValue,
    /// Names relative to the run's `input/` directory.
    pub input_files: Vec<String>,
    pub memory: JsonValue,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct EnqueueRunRequest {
    pub run: RunCreateRequest,
    pub queue: QueueName,
}

#[derive(Clone, Debug)]
pub struct EnqueueRunResult {
    pub run: RunRow,
    pub job: JobRow,
}
