#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_ID_LEN: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdError {
    Empty,
    TooLong,
    InvalidChar { ch: char, index: usize },
}

impl IdError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "id must not be empty",
            Self::TooLong => "id is too long",
            Self::InvalidChar { .. } => "id contains characters outside [A-Za-z0-9._:-]",
        }
    }
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidChar { ch, index } => {
                write!(f, "{} (ch={ch:?}, index={index})", self.message())
            }
            _ => f.write_str(self.message()),
        }
    }
}

impl std::error::Error for IdError {}

fn validate_id(value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if value.len() > MAX_ID_LEN {
        return Err(IdError::TooLong);
    }
    for (index, ch) in value.chars().enumerate() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ':' | '-') {
            continue;
        }
        return Err(IdError::InvalidChar { ch, index });
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                let trimmed = value.trim();
                validate_id(trimmed)?;
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::try_new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

string_id!(JobId);
string_id!(RunId);
string_id!(ToolId);
string_id!(UserId);
string_id!(
    /// Stable identity of one worker process; owns job leases.
    WorkerId
);
string_id!(
    /// Logical partition of the job queue. Workers only claim from the queue they poll.
    QueueName
);

impl QueueName {
    pub const DEFAULT: &'static str = "default";

    pub fn default_queue() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl WorkerId {
    /// `<host>-<pid>-<hex nanos>`; unique enough to tell concurrent workers apart.
    pub fn generate() -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .map(|raw| sanitize_id_fragment(&raw))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "worker".to_string());
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let mut host = host;
        host.truncate(64);
        Self(format!("{host}-{}-{nanos:x}", std::process::id()))
    }
}

fn sanitize_id_fragment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Prefixed, time-ordered identifier (`JOB-…`, `RUN-…`) for newly created rows.
pub fn new_prefixed_id(prefix: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let seq = SEQ.fetch_add(1, Ordering::Relaxed) & 0xffff;
    format!("{prefix}-{nanos:016x}{seq:04x}{:06x}", std::process::id() & 0xff_ffff)
}
