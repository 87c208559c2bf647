#![forbid(unsafe_code)]

use serde_json::{Value as JsonValue, json};
use tr_core::{Actor, ToolId, UserId};

#[derive(Clone, Debug)]
pub struct ToolRow {
    pub id: String,
    pub draft_head_id: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct ToolRegisterRequest {
    pub tool_id: ToolId,
    pub draft_head_id: String,
    pub now_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DraftLockRow {
    pub tool_id: String,
    pub draft_head_id: String,
    pub locked_by_user_id: String,
    pub locked_at_ms: i64,
    pub expires_at_ms: i64,
    pub forced_by_user_id: Option<String>,
}

impl DraftLockRow {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }

    pub fn is_held_by(&self, user_id: &UserId) -> bool {
        self.locked_by_user_id == user_id.as_str()
    }
}

#[derive(Clone, Debug)]
pub struct AcquireDraftLockCommand {
    pub tool_id: ToolId,
    pub draft_head_id: String,
    pub force: bool,
}

#[derive(Clone, Debug)]
pub struct ReleaseDraftLockCommand {
    pub tool_id: ToolId,
}

#[derive(Clone, Debug)]
pub struct DraftLockAcquireRequest {
    pub actor: Actor,
    pub command: AcquireDraftLockCommand,
    pub now_ms: i64,
    pub ttl_ms: u64,
}

#[derive(Clone, Debug)]
pub struct DraftLockReleaseRequest {
    pub actor: Actor,
    pub command: ReleaseDraftLockCommand,
    pub now_ms: i64,
}

/// A lock as seen by one user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DraftLockView {
    pub tool_id: String,
    pub draft_head_id: String,
    pub locked_by_user_id: String,
    /// RFC 3339, UTC.
    pub expires_at: String,
    pub is_owner: bool,
    pub forced_by_user_id: Option<String>,
}

impl DraftLockView {
    pub fn to_json(&self) -> JsonValue {
        let mut value = json!({
            "tool_id": self.tool_id,
            "draft_head_id": self.draft_head_id,
            "locked_by_user_id": self.locked_by_user_id,
            "expires_at": self.expires_at,
            "is_owner": self.is_owner,
        });
        if let (Some(forced_by), Some(obj)) = (&self.forced_by_user_id, value.as_object_mut()) {
            obj.insert("forced_by_user_id".to_string(), json!(forced_by));
        }
        value
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseDraftLockResult {
    pub tool_id: String,
}

impl ReleaseDraftLockResult {
    pub fn to_json(&self) -> JsonValue {
        json!({ "tool_id": self.tool_id })
    }
}
