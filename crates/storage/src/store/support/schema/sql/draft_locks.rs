#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS tools (
          id TEXT PRIMARY KEY,
          draft_head_id TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        -- One row per tool: the primary key is the mutual exclusion.
        CREATE TABLE IF NOT EXISTS draft_locks (
          tool_id TEXT PRIMARY KEY REFERENCES tools(id),
          draft_head_id TEXT NOT NULL,
          locked_by_user_id TEXT NOT NULL,
          locked_at_ms INTEGER NOT NULL,
          expires_at_ms INTEGER NOT NULL,
          forced_by_user_id TEXT
        );
"#;
