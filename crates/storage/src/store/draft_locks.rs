#![forbid(unsafe_code)]

use super::*;
use rusqlite::{OptionalExtension, params};
use tr_core::{ToolId, UserId};

pub const DEFAULT_DRAFT_LOCK_TTL_MS: u64 = 15 * 60 * 1000;
const MIN_DRAFT_LOCK_TTL_MS: u64 = 1_000;
const MAX_DRAFT_LOCK_TTL_MS: u64 = 24 * 60 * 60 * 1000;
const MAX_DRAFT_HEAD_ID_LEN: usize = 128;

fn normalize_draft_head_id(raw: &str) -> Result<String, StoreError> {
    normalize_required_text(
        raw,
        MAX_DRAFT_HEAD_ID_LEN,
        "draft_head_id must not be empty",
        "draft_head_id is too long",
    )
}

fn load_tool_tx(tx: &Transaction<'_>, tool_id: &str) -> Result<Option<ToolRow>, StoreError> {
    Ok(tx
        .query_row(
            "SELECT id, draft_head_id, created_at_ms, updated_at_ms FROM tools WHERE id=?1",
            params![tool_id],
            |row| {
                Ok(ToolRow {
                    id: row.get(0)?,
                    draft_head_id: row.get(1)?,
                    created_at_ms: row.get(2)?,
                    updated_at_ms: row.get(3)?,
                })
            },
        )
        .optional()?)
}

fn load_lock_tx(tx: &Transaction<'_>, tool_id: &str) -> Result<Option<DraftLockRow>, StoreError> {
    Ok(tx
        .query_row(
            r#"
            SELECT tool_id, draft_head_id, locked_by_user_id, locked_at_ms, expires_at_ms, forced_by_user_id
            FROM draft_locks
            WHERE tool_id=?1
            "#,
            params![tool_id],
            |row| {
                Ok(DraftLockRow {
                    tool_id: row.get(0)?,
                    draft_head_id: row.get(1)?,
                    locked_by_user_id: row.get(2)?,
                    locked_at_ms: row.get(3)?,
                    expires_at_ms: row.get(4)?,
                    forced_by_user_id: row.get(5)?,
                })
            },
        )
        .optional()?)
}

fn upsert_lock_tx(tx: &Transaction<'_>, lock: &DraftLockRow) -> Result<(), StoreError> {
    tx.execute(
        r#"
        INSERT INTO draft_locks(tool_id, draft_head_id, locked_by_user_id, locked_at_ms, expires_at_ms, forced_by_user_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(tool_id) DO UPDATE SET
          draft_head_id=excluded.draft_head_id,
          locked_by_user_id=excluded.locked_by_user_id,
          locked_at_ms=excluded.locked_at_ms,
          expires_at_ms=excluded.expires_at_ms,
          forced_by_user_id=excluded.forced_by_user_id
        "#,
        params![
            lock.tool_id,
            lock.draft_head_id,
            lock.locked_by_user_id,
            lock.locked_at_ms,
            lock.expires_at_ms,
            lock.forced_by_user_id,
        ],
    )?;
    Ok(())
}

fn view_for(lock: DraftLockRow, viewer: &UserId) -> Result<DraftLockView, StoreError> {
    Ok(DraftLockView {
        expires_at: rfc3339_from_ms(lock.expires_at_ms)?,
        is_owner: lock.is_held_by(viewer),
        tool_id: lock.tool_id,
        draft_head_id: lock.draft_head_id,
        locked_by_user_id: lock.locked_by_user_id,
        forced_by_user_id: lock.forced_by_user_id,
    })
}

impl SqliteStore {
    /// Register a tool or move its draft head.
    pub fn tool_register(&mut self, request: ToolRegisterRequest) -> Result<ToolRow, StoreError> {
        let draft_head_id = normalize_draft_head_id(&request.draft_head_id)?;
        let tx = self.write_tx()?;
        tx.execute(
            r#"
            INSERT INTO tools(id, draft_head_id, created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(id) DO UPDATE SET draft_head_id=excluded.draft_head_id, updated_at_ms=excluded.updated_at_ms
            "#,
            params![request.tool_id.as_str(), draft_head_id, request.now_ms],
        )?;
        let tool = load_tool_tx(&tx, request.tool_id.as_str())?.ok_or_else(|| {
            StoreError::UnknownTool {
                tool_id: request.tool_id.as_str().to_string(),
            }
        })?;
        tx.commit()?;
        Ok(tool)
    }

    /// Take, refresh or (for override roles with `force`) steal the draft lock of a tool.
    ///
    /// An expired lock is treated as absent and silently replaced.
    pub fn draft_lock_acquire(
        &mut self,
        request: DraftLockAcquireRequest,
    ) -> Result<DraftLockView, StoreError> {
        let DraftLockAcquireRequest {
            actor,
            command,
            now_ms,
            ttl_ms,
        } = request;
        let tool_id = command.tool_id.as_str();
        let draft_head_id = normalize_draft_head_id(&command.draft_head_id)?;
        let expires_at_ms = expiry_ms(
            now_ms,
            ttl_ms.clamp(MIN_DRAFT_LOCK_TTL_MS, MAX_DRAFT_LOCK_TTL_MS),
        );
        let caller = actor.user_id.as_str();

        let tx = self.write_tx()?;
        let Some(tool) = load_tool_tx(&tx, tool_id)? else {
            return Err(StoreError::UnknownTool {
                tool_id: tool_id.to_string(),
            });
        };
        if tool.draft_head_id != draft_head_id {
            return Err(StoreError::StaleDraftHead {
                tool_id: tool_id.to_string(),
                expected: draft_head_id,
                current: tool.draft_head_id,
            });
        }

        let next = match load_lock_tx(&tx, tool_id)? {
            Some(current) if !current.is_expired(now_ms) && current.is_held_by(&actor.user_id) => {
                let forced_by_user_id = if command.force {
                    current.forced_by_user_id.clone()
                } else {
                    None
                };
                DraftLockRow {
                    draft_head_id,
                    expires_at_ms,
                    forced_by_user_id,
                    ..current
                }
            }
            Some(current) if !current.is_expired(now_ms) => {
                if !(command.force && actor.can_override_locks()) {
                    return Err(StoreError::DraftLockHeld {
                        tool_id: tool_id.to_string(),
                        holder_user_id: current.locked_by_user_id,
                        expires_at_ms: current.expires_at_ms,
                    });
                }
                tracing::info!(
                    tool_id,
                    previous_holder = %current.locked_by_user_id,
                    forced_by = caller,
                    "draft lock overridden"
                );
                DraftLockRow {
                    tool_id: tool_id.to_string(),
                    draft_head_id,
                    locked_by_user_id: caller.to_string(),
                    locked_at_ms: now_ms,
                    expires_at_ms,
                    forced_by_user_id: Some(caller.to_string()),
                }
            }
            _ => DraftLockRow {
                tool_id: tool_id.to_string(),
                draft_head_id,
                locked_by_user_id: caller.to_string(),
                locked_at_ms: now_ms,
                expires_at_ms,
                forced_by_user_id: None,
            },
        };
        upsert_lock_tx(&tx, &next)?;
        tx.commit()?;

        view_for(next, &actor.user_id)
    }

    /// Delete the lock. Only its holder or an override role may release it.
    pub fn draft_lock_release(
        &mut self,
        request: DraftLockReleaseRequest,
    ) -> Result<ReleaseDraftLockResult, StoreError> {
        let tool_id = request.command.tool_id.as_str();
        let tx = self.write_tx()?;

        let lock = match load_lock_tx(&tx, tool_id)? {
            Some(lock) if lock.is_expired(request.now_ms) => {
                tx.execute(
                    "DELETE FROM draft_locks WHERE tool_id=?1",
                    params![tool_id],
                )?;
                tx.commit()?;
                return Err(StoreError::DraftLockNotFound {
                    tool_id: tool_id.to_string(),
                });
            }
            Some(lock) => lock,
            None => {
                return Err(StoreError::DraftLockNotFound {
                    tool_id: tool_id.to_string(),
                });
            }
        };

        if !lock.is_held_by(&request.actor.user_id) && !request.actor.can_override_locks() {
            return Err(StoreError::DraftLockForbidden {
                tool_id: tool_id.to_string(),
                holder_user_id: lock.locked_by_user_id,
            });
        }

        tx.execute(
            "DELETE FROM draft_locks WHERE tool_id=?1",
            params![tool_id],
        )?;
        tx.commit()?;
        Ok(ReleaseDraftLockResult {
            tool_id: tool_id.to_string(),
        })
    }

    /// The unexpired lock on `tool_id`, as seen by `viewer`.
    pub fn draft_lock_get(
        &mut self,
        tool_id: &ToolId,
        viewer: &UserId,
        now_ms: i64,
    ) -> Result<Option<DraftLockView>, StoreError> {
        let tx = self.conn.transaction()?;
        let lock = load_lock_tx(&tx, tool_id.as_str())?;
        tx.commit()?;
        lock.filter(|lock| !lock.is_expired(now_ms))
            .map(|lock| view_for(lock, viewer))
            .transpose()
    }

    /// Housekeeping: drop every lock that expired at or before `now_ms`.
    pub fn draft_locks_delete_expired(&mut self, now_ms: i64) -> Result<usize, StoreError> {
        let tx = self.write_tx()?;
        let deleted = tx.execute(
            "DELETE FROM draft_locks WHERE expires_at_ms <= ?1",
            params![now_ms],
        )?;
        tx.commit()?;
        Ok(deleted)
    }
}
