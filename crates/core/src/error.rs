#![forbid(unsafe_code)]

use serde::Serialize;
use serde_json::Value;
use std::fmt;

const USER_MESSAGE_FALLBACK: &str = "The tool reported an error.";
const MAX_USER_MESSAGE_CHARS: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "FORBIDDEN")]
    Forbidden,
    #[serde(rename = "CONFLICT")]
    Conflict,
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Forbidden => "FORBIDDEN",
            Self::Conflict => "CONFLICT",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// The only text of a non-user failure that may reach an end user.
    pub fn public_message(self) -> &'static str {
        match self {
            Self::Validation => "The request was invalid.",
            Self::NotFound => "The requested item was not found.",
            Self::Forbidden => "You are not allowed to do that.",
            Self::Conflict => "The item is busy or was changed by someone else.",
            Self::Internal => "The tool run failed. Please try again later.",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "VALIDATION_ERROR" => Some(Self::Validation),
            "NOT_FOUND" => Some(Self::NotFound),
            "FORBIDDEN" => Some(Self::Forbidden),
            "CONFLICT" => Some(Self::Conflict),
            "INTERNAL_ERROR" => Some(Self::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Display-safe message raised by a sandboxed script for its end user.
///
/// Trimmed and capped on construction; blank input collapses to a generic fallback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct UserMessage(String);

impl UserMessage {
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self(USER_MESSAGE_FALLBACK.to_string());
        }
        if trimmed.chars().count() <= MAX_USER_MESSAGE_CHARS {
            return Self(trimmed.to_string());
        }
        let mut capped = trimmed
            .chars()
            .take(MAX_USER_MESSAGE_CHARS)
            .collect::<String>();
        capped.truncate(capped.trim_end().len());
        Self(capped)
    }

    pub fn fallback() -> Self {
        Self(USER_MESSAGE_FALLBACK.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for UserMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum ToolError {
    /// Raised inside the sandboxed script; the only variant shown verbatim.
    #[error("{0}")]
    User(UserMessage),
    #[error("{kind}: {message}")]
    Failure {
        kind: ErrorKind,
        message: String,
        detail: Option<Value>,
    },
}

impl ToolError {
    pub fn user(raw: &str) -> Self {
        Self::User(UserMessage::new(raw))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::failure(ErrorKind::Validation, message, None)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::failure(ErrorKind::NotFound, message, None)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::failure(ErrorKind::Forbidden, message, None)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::failure(ErrorKind::Conflict, message, None)
    }

    pub fn internal(message: impl Into<String>, detail: Option<Value>) -> Self {
        Self::failure(ErrorKind::Internal, message, detail)
    }

    fn failure(kind: ErrorKind, message: impl Into<String>, detail: Option<Value>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
            detail,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::User(_) => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::User(_) => "USER_ERROR",
            Self::Failure { kind, .. } => kind.code(),
        }
    }

    /// Text safe to show an end user: the user message itself, or the kind's generic text.
    pub fn display_message(&self) -> String {
        match self {
            Self::User(message) => message.as_str().to_string(),
            Self::Failure { kind, .. } => kind.public_message().to_string(),
        }
    }

    /// Diagnostic detail for logs and the store; never rendered to the end user.
    pub fn detail(&self) -> Option<&Value> {
        match self {
            Self::User(_) => None,
            Self::Failure { detail, .. } => detail.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_message_is_trimmed_and_falls_back_when_blank() {
        assert_eq!(UserMessage::new("  bad input  ").as_str(), "bad input");
        assert_eq!(UserMessage::new("").as_str(), USER_MESSAGE_FALLBACK);
        assert_eq!(UserMessage::new(" \n\t ").as_str(), USER_MESSAGE_FALLBACK);
    }

    #[test]
    fn user_message_is_capped() {
        let long = "é".repeat(MAX_USER_MESSAGE_CHARS + 20);
        let msg = UserMessage::new(&long);
        assert_eq!(msg.as_str().chars().count(), MAX_USER_MESSAGE_CHARS);
    }

    #[test]
    fn only_user_errors_surface_their_text() {
        let user = ToolError::user("Column 'price' is missing");
        assert_eq!(user.display_message(), "Column 'price' is missing");
        assert_eq!(user.code(), "USER_ERROR");
        assert!(user.detail().is_none());

        let internal = ToolError::internal(
            "result path escapes output root: /etc/passwd",
            Some(json!({ "path": "/etc/passwd" })),
        );
        assert_eq!(
            internal.display_message(),
            ErrorKind::Internal.public_message()
        );
        assert!(!internal.display_message().contains("/etc/passwd"));
        assert_eq!(internal.code(), "INTERNAL_ERROR");
        assert_eq!(internal.detail(), Some(&json!({ "path": "/etc/passwd" })));
    }

    #[test]
    fn error_kind_codes_round_trip() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::NotFound,
            ErrorKind::Forbidden,
            ErrorKind::Conflict,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::parse(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("USER_ERROR"), None);
    }
}
