#![forbid(unsafe_code)]

use tr_core::{ErrorKind, ToolError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    #[error("unknown job (job_id={job_id})")]
    UnknownJob { job_id: String },
    #[error("unknown run (run_id={run_id})")]
    UnknownRun { run_id: String },
    #[error("unknown tool (tool_id={tool_id})")]
    UnknownTool { tool_id: String },
    #[error("run already exists (run_id={run_id})")]
    RunAlreadyExists { run_id: String },
    #[error("run already has an active job (run_id={run_id})")]
    DuplicateActiveJob { run_id: String },
    #[error("job is already terminal (job_id={job_id}, status={status})")]
    JobAlreadyTerminal { job_id: String, status: String },
    #[error(
        "job claim mismatch (job_id={job_id}, owner={}, caller={caller})",
        .owner.as_deref().unwrap_or("-")
    )]
    JobClaimMismatch {
        job_id: String,
        owner: Option<String>,
        caller: String,
    },
    #[error("job is not in a claimable state (job_id={job_id}, status={status})")]
    JobNotClaimable { job_id: String, status: String },
    #[error("run is not terminal (run_id={run_id}, status={status})")]
    RunNotTerminal { run_id: String, status: String },
    #[error("draft lock held (tool_id={tool_id}, holder={holder_user_id}, expires_at_ms={expires_at_ms})")]
    DraftLockHeld {
        tool_id: String,
        holder_user_id: String,
        expires_at_ms: i64,
    },
    #[error("stale draft head (tool_id={tool_id}, expected={expected}, current={current})")]
    StaleDraftHead {
        tool_id: String,
        expected: String,
        current: String,
    },
    #[error("no draft lock (tool_id={tool_id})")]
    DraftLockNotFound { tool_id: String },
    #[error("draft lock release forbidden (tool_id={tool_id}, holder={holder_user_id})")]
    DraftLockForbidden {
        tool_id: String,
        holder_user_id: String,
    },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Sql(_) | Self::CorruptRow(_) => ErrorKind::Internal,
            Self::InvalidInput(_) => ErrorKind::Validation,
            Self::UnknownJob { .. }
            | Self::UnknownRun { .. }
            | Self::UnknownTool { .. }
            | Self::DraftLockNotFound { .. } => ErrorKind::NotFound,
            Self::DraftLockForbidden { .. } | Self::JobClaimMismatch { .. } => {
                ErrorKind::Forbidden
            }
            Self::RunAlreadyExists { .. }
            | Self::DuplicateActiveJob { .. }
            | Self::JobAlreadyTerminal { .. }
            | Self::JobNotClaimable { .. }
            | Self::RunNotTerminal { .. }
            | Self::DraftLockHeld { .. }
            | Self::StaleDraftHead { .. } => ErrorKind::Conflict,
        }
    }
}

impl From<StoreError> for ToolError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Validation => ToolError::validation(message),
            ErrorKind::NotFound => ToolError::not_found(message),
            ErrorKind::Forbidden => ToolError::forbidden(message),
            ErrorKind::Conflict => ToolError::conflict(message),
            ErrorKind::Internal => ToolError::internal(message, None),
        }
    }
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
