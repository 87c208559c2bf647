#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS runs (
          id TEXT PRIMARY KEY,
          tool_id TEXT NOT NULL,
          tool_version_id TEXT NOT NULL,
          status TEXT NOT NULL,
          context_json TEXT NOT NULL,
          input_files_json TEXT NOT NULL,
          memory_json TEXT NOT NULL,
          ui_payload_json TEXT,
          -- Manifest only: artifact bytes stay on disk under the run directory.
          artifacts_manifest_json TEXT,
          error_kind TEXT,
          error_summary TEXT,
          error_detail_json TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          started_at_ms INTEGER,
          completed_at_ms INTEGER
        );
"#;
