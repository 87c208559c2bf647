#![forbid(unsafe_code)]

use crate::executor::ExecutorError;
use tr_core::{CapacityError, ErrorKind, IdError, ToolError};
use tr_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("invalid id: {0}")]
    Id(#[from] IdError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid JSON for {field}: {source}")]
    Json {
        field: &'static str,
        source: serde_json::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl RunnerError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(err) => err.kind(),
            Self::Capacity(_) | Self::Id(_) | Self::Config(_) | Self::Json { .. } => {
                ErrorKind::Validation
            }
            Self::Executor(_) | Self::Io { .. } => ErrorKind::Internal,
        }
    }
}

impl From<RunnerError> for ToolError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Store(err) => err.into(),
            RunnerError::Executor(err) => err.into(),
            other => ToolError::Failure {
                kind: other.kind(),
                message: other.to_string(),
                detail: None,
            },
        }
    }
}
