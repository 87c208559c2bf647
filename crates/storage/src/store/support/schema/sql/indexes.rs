#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_active_per_run
          ON jobs(run_id) WHERE status IN ('queued', 'claimed', 'running');
        CREATE INDEX IF NOT EXISTS idx_jobs_claim_order ON jobs(queue, status, created_at_ms, id);
        CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs(status, lease_expires_at_ms);
        CREATE INDEX IF NOT EXISTS idx_job_events_job_seq ON job_events(job_id, seq);
        CREATE INDEX IF NOT EXISTS idx_runs_tool ON runs(tool_id, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_draft_locks_expiry ON draft_locks(expires_at_ms);
"#;
