#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT PRIMARY KEY,
          run_id TEXT NOT NULL REFERENCES runs(id),
          queue TEXT NOT NULL,
          status TEXT NOT NULL,
          worker_id TEXT,
          lease_expires_at_ms INTEGER,
          attempts INTEGER NOT NULL DEFAULT 0,
          previous_worker_id TEXT,
          error_summary TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          completed_at_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS job_events (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id TEXT NOT NULL,
          ts_ms INTEGER NOT NULL,
          kind TEXT NOT NULL,
          message TEXT NOT NULL,
          meta_json TEXT
        );
"#;
