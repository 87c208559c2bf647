#![forbid(unsafe_code)]

use crate::error::ToolError;
use serde_json::json;

/// Every artifact a sandbox reports must live under this first segment.
pub const OUTPUT_ROOT: &str = "output";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path must not be empty")]
    Empty,
    #[error("path must be relative (path={path})")]
    Absolute { path: String },
    #[error("path traversal is not allowed (path={path})")]
    Traversal { path: String },
    #[error("path contains control characters (path={path:?})")]
    ControlChars { path: String },
    #[error("path must live under {OUTPUT_ROOT}/ (path={path})")]
    OutsideOutputRoot { path: String },
}

impl PathError {
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Empty => None,
            Self::Absolute { path }
            | Self::Traversal { path }
            | Self::ControlChars { path }
            | Self::OutsideOutputRoot { path } => Some(path),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Absolute { .. } => "absolute",
            Self::Traversal { .. } => "traversal",
            Self::ControlChars { .. } => "control_chars",
            Self::OutsideOutputRoot { .. } => "outside_output_root",
        }
    }
}

impl From<PathError> for ToolError {
    fn from(err: PathError) -> Self {
        let detail = json!({
            "reason": err.reason(),
            "path": err.path(),
        });
        ToolError::internal(format!("sandbox reported an invalid path: {err}"), Some(detail))
    }
}

/// Normalize a sandbox-reported relative POSIX path.
///
/// Rejects empty, absolute and `..`-bearing paths; collapses `.` and empty segments.
/// Backslashes count as separators so `..\\x` cannot slip through.
pub fn normalize_relative_path(raw: &str) -> Result<String, PathError> {
    if raw.trim().is_empty() {
        return Err(PathError::Empty);
    }
    if raw.chars().any(char::is_control) {
        return Err(PathError::ControlChars {
            path: raw.to_string(),
        });
    }
    if raw.starts_with('/') || raw.starts_with('\\') || has_drive_prefix(raw) {
        return Err(PathError::Absolute {
            path: raw.to_string(),
        });
    }

    let mut segments = Vec::<&str>::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(PathError::Traversal {
                    path: raw.to_string(),
                });
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(segments.join("/"))
}

/// Normalize `raw` and require it to be rooted at `output/` (or be `output` itself).
pub fn validate_output_path(raw: &str) -> Result<String, PathError> {
    let normalized = normalize_relative_path(raw)?;
    let first = normalized.split('/').next().unwrap_or_default();
    if first != OUTPUT_ROOT {
        return Err(PathError::OutsideOutputRoot { path: normalized });
    }
    Ok(normalized)
}

fn has_drive_prefix(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dot_and_empty_segments() {
        assert_eq!(
            normalize_relative_path("./output/./report.pdf").as_deref(),
            Ok("output/report.pdf")
        );
        assert_eq!(
            normalize_relative_path("output//nested///a.txt").as_deref(),
            Ok("output/nested/a.txt")
        );
        assert_eq!(
            normalize_relative_path("output/dir/").as_deref(),
            Ok("output/dir")
        );
    }

    #[test]
    fn normalize_rejects_empty_absolute_and_traversal() {
        assert_eq!(normalize_relative_path(""), Err(PathError::Empty));
        assert_eq!(normalize_relative_path("  "), Err(PathError::Empty));
        assert_eq!(normalize_relative_path("./."), Err(PathError::Empty));
        assert!(matches!(
            normalize_relative_path("/output/report.pdf"),
            Err(PathError::Absolute { .. })
        ));
        assert!(matches!(
            normalize_relative_path("C:\\output\\a.txt"),
            Err(PathError::Absolute { .. })
        ));
        assert!(matches!(
            normalize_relative_path("output/../evil.txt"),
            Err(PathError::Traversal { .. })
        ));
        assert!(matches!(
            normalize_relative_path("output\\..\\evil.txt"),
            Err(PathError::Traversal { .. })
        ));
        assert!(matches!(
            normalize_relative_path("output/a\u{0000}.txt"),
            Err(PathError::ControlChars { .. })
        ));
    }

    #[test]
    fn dotted_names_are_not_traversal() {
        assert_eq!(
            normalize_relative_path("output/..hidden/a..b.txt").as_deref(),
            Ok("output/..hidden/a..b.txt")
        );
    }

    #[test]
    fn output_path_must_be_rooted_at_output() {
        assert_eq!(validate_output_path("output").as_deref(), Ok("output"));
        assert_eq!(
            validate_output_path("./output/./report.pdf").as_deref(),
            Ok("output/report.pdf")
        );
        assert!(matches!(
            validate_output_path("tmp/report.pdf"),
            Err(PathError::OutsideOutputRoot { .. })
        ));
        assert!(matches!(
            validate_output_path("outputs/report.pdf"),
            Err(PathError::OutsideOutputRoot { .. })
        ));
        assert!(matches!(
            validate_output_path("/output/report.pdf"),
            Err(PathError::Absolute { .. })
        ));
        assert!(matches!(
            validate_output_path("output/../evil.txt"),
            Err(PathError::Traversal { .. })
        ));
    }

    #[test]
    fn path_errors_become_internal_tool_errors() {
        let err: ToolError = validate_output_path("output/../evil.txt")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), Some(crate::ErrorKind::Internal));
        let detail = err.detail().expect("detail");
        assert_eq!(detail["reason"], "traversal");
        assert_eq!(detail["path"], "output/../evil.txt");
    }
}
