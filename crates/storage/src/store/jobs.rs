#![forbid(unsafe_code)]

use super::runs::{finish_run_tx, mark_run_running_tx, require_run_tx};
use super::*;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{OptionalExtension, params};
use serde_json::json;
use tr_core::{JobId, QueueName, RunId, new_prefixed_id};

const MAX_ERROR_SUMMARY_CHARS: usize = 500;
const MAX_TAIL_EVENTS: usize = 200;

const JOB_COLUMNS: &str = "id, run_id, queue, status, worker_id, lease_expires_at_ms, attempts, \
     previous_worker_id, error_summary, created_at_ms, updated_at_ms, completed_at_ms";

fn lease_expiry_ms(now_ms: i64, lease_ttl_ms: u64) -> Result<i64, StoreError> {
    if lease_ttl_ms == 0 {
        return Err(StoreError::InvalidInput("lease_ttl_ms must be positive"));
    }
    Ok(expiry_ms(now_ms, lease_ttl_ms))
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        JobStatus::parse(raw)
            .ok_or_else(|| FromSqlError::Other(format!("unknown job status {raw:?}").into()))
    }
}

fn read_job_row(row: &rusqlite::Row<'_>) -> Result<JobRow, rusqlite::Error> {
    Ok(JobRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        queue: row.get(2)?,
        status: row.get(3)?,
        worker_id: row.get(4)?,
        lease_expires_at_ms: row.get(5)?,
        attempts: row.get(6)?,
        previous_worker_id: row.get(7)?,
        error_summary: row.get(8)?,
        created_at_ms: row.get(9)?,
        updated_at_ms: row.get(10)?,
        completed_at_ms: row.get(11)?,
    })
}

pub(super) fn load_job_tx(tx: &Transaction<'_>, job_id: &str) -> Result<Option<JobRow>, StoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1");
    Ok(tx.query_row(&sql, params![job_id], read_job_row).optional()?)
}

fn require_job_tx(tx: &Transaction<'_>, job_id: &str) -> Result<JobRow, StoreError> {
    load_job_tx(tx, job_id)?.ok_or_else(|| StoreError::UnknownJob {
        job_id: job_id.to_string(),
    })
}

pub(super) fn insert_job_tx(
    tx: &Transaction<'_>,
    run_id: &str,
    queue: &str,
    now_ms: i64,
) -> Result<JobRow, StoreError> {
    let active: Option<String> = tx
        .query_row(
            "SELECT id FROM jobs WHERE run_id=?1 AND status IN ('queued', 'claimed', 'running') LIMIT 1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;
    if active.is_some() {
        return Err(StoreError::DuplicateActiveJob {
            run_id: run_id.to_string(),
        });
    }

    let id = new_prefixed_id("JOB");
    let inserted = tx.execute(
        r#"
        INSERT INTO jobs(id, run_id, queue, status, attempts, created_at_ms, updated_at_ms)
        VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?4)
        "#,
        params![id, run_id, queue, now_ms],
    );
    match inserted {
        Ok(_) => {}
        // The partial unique index is the backstop for the check above.
        Err(err) if error::is_unique_violation(&err) => {
            return Err(StoreError::DuplicateActiveJob {
                run_id: run_id.to_string(),
            });
        }
        Err(err) => return Err(err.into()),
    }
    insert_job_event_tx(tx, &id, now_ms, "queued", "queued", None)?;

    Ok(JobRow {
        id,
        run_id: run_id.to_string(),
        queue: queue.to_string(),
        status: JobStatus::Queued,
        worker_id: None,
        lease_expires_at_ms: None,
        attempts: 0,
        previous_worker_id: None,
        error_summary: None,
        created_at_ms: now_ms,
        updated_at_ms: now_ms,
        completed_at_ms: None,
    })
}

fn insert_job_event_tx(
    tx: &Transaction<'_>,
    job_id: &str,
    ts_ms: i64,
    kind: &str,
    message: &str,
    meta: Option<serde_json::Value>,
) -> Result<i64, StoreError> {
    tx.execute(
        "INSERT INTO job_events(job_id, ts_ms, kind, message, meta_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![job_id, ts_ms, kind, message, meta.as_ref().map(encode_json)],
    )?;
    Ok(tx.last_insert_rowid())
}

fn guard_owner(job: &JobRow, worker_id: &str) -> Result<(), StoreError> {
    if job.status.is_terminal() {
        return Err(StoreError::JobAlreadyTerminal {
            job_id: job.id.clone(),
            status: job.status.as_str().to_string(),
        });
    }
    if !job.status.is_leased() || job.worker_id.as_deref() != Some(worker_id) {
        return Err(StoreError::JobClaimMismatch {
            job_id: job.id.clone(),
            owner: job.worker_id.clone(),
            caller: worker_id.to_string(),
        });
    }
    Ok(())
}

fn cap_summary(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= MAX_ERROR_SUMMARY_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().take(MAX_ERROR_SUMMARY_CHARS).collect()
}

// With `outcome = None` the run must already be terminal and the job mirrors it.
fn finish_job_tx(
    tx: &Transaction<'_>,
    job_id: &str,
    worker_id: &str,
    now_ms: i64,
    outcome: Option<&RunCompletion>,
) -> Result<JobCompleteResult, StoreError> {
    let job = require_job_tx(tx, job_id)?;
    guard_owner(&job, worker_id)?;

    let run_before = require_run_tx(tx, &job.run_id)?;
    let run_already_final = run_before.status.is_terminal();
    if !run_already_final {
        let Some(outcome) = outcome else {
            return Err(StoreError::RunNotTerminal {
                run_id: run_before.id,
                status: run_before.status.as_str().to_string(),
            });
        };
        finish_run_tx(tx, &job.run_id, outcome, now_ms)?;
    }
    let run = require_run_tx(tx, &job.run_id)?;

    let (status, error_summary) = match run.status {
        RunStatus::Succeeded => (JobStatus::Succeeded, None),
        _ => (
            JobStatus::Failed,
            Some(cap_summary(run.error_summary.as_deref().unwrap_or_default())),
        ),
    };
    let changed = tx.execute(
        r#"
        UPDATE jobs
        SET status=?3, worker_id=NULL, lease_expires_at_ms=NULL, error_summary=?4,
            updated_at_ms=?5, completed_at_ms=?5
        WHERE id=?1 AND worker_id=?2 AND status IN ('claimed', 'running')
        "#,
        params![job_id, worker_id, status.as_str(), error_summary, now_ms],
    )?;
    if changed != 1 {
        return Err(StoreError::JobClaimMismatch {
            job_id: job_id.to_string(),
            owner: job.worker_id,
            caller: worker_id.to_string(),
        });
    }
    insert_job_event_tx(
        tx,
        job_id,
        now_ms,
        status.as_str(),
        status.as_str(),
        Some(json!({
            "worker_id": worker_id,
            "run_already_final": run_already_final,
        })),
    )?;

    let job = require_job_tx(tx, job_id)?;
    Ok(JobCompleteResult {
        job,
        run,
        run_already_final,
    })
}

impl SqliteStore {
    pub fn job_create(&mut self, request: JobCreateRequest) -> Result<JobRow, StoreError> {
        let tx = self.write_tx()?;
        require_run_tx(&tx, request.run_id.as_str())?;
        let job = insert_job_tx(
            &tx,
            request.run_id.as_str(),
            request.queue.as_str(),
            request.now_ms,
        )?;
        tx.commit()?;
        Ok(job)
    }

    pub fn job_get(&mut self, job_id: &JobId) -> Result<Option<JobRow>, StoreError> {
        let tx = self.conn.transaction()?;
        let job = load_job_tx(&tx, job_id.as_str())?;
        tx.commit()?;
        Ok(job)
    }

    pub fn job_active_for_run(&mut self, run_id: &RunId) -> Result<Option<JobRow>, StoreError> {
        let tx = self.conn.transaction()?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE run_id=?1 AND status IN ('queued', 'claimed', 'running')"
        );
        let job = tx
            .query_row(&sql, params![run_id.as_str()], read_job_row)
            .optional()?;
        tx.commit()?;
        Ok(job)
    }

    pub fn job_claim_next(
        &mut self,
        request: JobClaimNextRequest,
    ) -> Result<Option<JobClaim>, StoreError> {
        let now_ms = request.now_ms;
        let lease_expires_at_ms = lease_expiry_ms(now_ms, request.lease_ttl_ms)?;
        let worker_id = request.worker_id.as_str();

        let tx = self.write_tx()?;
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE queue=?1
              AND (status='queued'
                   OR (status IN ('claimed', 'running') AND COALESCE(lease_expires_at_ms, 0) <= ?2))
            ORDER BY created_at_ms ASC, id ASC
            LIMIT 1
            "#
        );
        let candidate = tx
            .query_row(&sql, params![request.queue.as_str(), now_ms], read_job_row)
            .optional()?;
        let Some(candidate) = candidate else {
            return Ok(None);
        };

        let lease_taken_over = candidate.status.is_leased();
        let is_adoption = lease_taken_over || candidate.attempts > 0;
        let previous_worker_id = if lease_taken_over {
            candidate.worker_id.clone()
        } else {
            candidate.previous_worker_id.clone()
        };

        let changed = tx.execute(
            r#"
            UPDATE jobs
            SET status='claimed', worker_id=?2, lease_expires_at_ms=?3, attempts=attempts + 1,
                previous_worker_id=?4, updated_at_ms=?5
            WHERE id=?1 AND status=?6 AND attempts=?7
            "#,
            params![
                candidate.id,
                worker_id,
                lease_expires_at_ms,
                previous_worker_id,
                now_ms,
                candidate.status.as_str(),
                candidate.attempts,
            ],
        )?;
        if changed != 1 {
            return Err(StoreError::JobNotClaimable {
                job_id: candidate.id,
                status: candidate.status.as_str().to_string(),
            });
        }

        let (kind, meta) = if is_adoption {
            (
                "adopted",
                json!({
                    "worker_id": worker_id,
                    "previous_worker_id": previous_worker_id,
                    "previous_status": candidate.status.as_str(),
                    "attempt": candidate.attempts + 1,
                }),
            )
        } else {
            ("claimed", json!({ "worker_id": worker_id }))
        };
        insert_job_event_tx(&tx, &candidate.id, now_ms, kind, kind, Some(meta))?;

        let job = require_job_tx(&tx, &candidate.id)?;
        tx.commit()?;

        if is_adoption {
            tracing::debug!(
                job_id = %job.id,
                worker_id,
                previous_worker_id = previous_worker_id.as_deref().unwrap_or("-"),
                attempt = job.attempts,
                "job adopted"
            );
        }
        Ok(Some(JobClaim { job, is_adoption }))
    }

    pub fn job_heartbeat(&mut self, request: JobHeartbeatRequest) -> Result<bool, StoreError> {
        let lease_expires_at_ms = lease_expiry_ms(request.now_ms, request.lease_ttl_ms)?;
        let tx = self.write_tx()?;
        let changed = tx.execute(
            r#"
            UPDATE jobs
            SET lease_expires_at_ms=?3, updated_at_ms=?4
            WHERE id=?1 AND worker_id=?2 AND status IN ('claimed', 'running')
            "#,
            params![
                request.job_id.as_str(),
                request.worker_id.as_str(),
                lease_expires_at_ms,
                request.now_ms,
            ],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    }

    pub fn job_mark_running(&mut self, request: JobOwnerRequest) -> Result<bool, StoreError> {
        let tx = self.write_tx()?;
        let job = require_job_tx(&tx, request.job_id.as_str())?;
        if guard_owner(&job, request.worker_id.as_str()).is_err() {
            return Ok(false);
        }
        tx.execute(
            "UPDATE jobs SET status='running', updated_at_ms=?2 WHERE id=?1",
            params![job.id, request.now_ms],
        )?;
        mark_run_running_tx(&tx, &job.run_id, request.now_ms)?;
        insert_job_event_tx(
            &tx,
            &job.id,
            request.now_ms,
            "running",
            "running",
            Some(json!({ "worker_id": request.worker_id.as_str() })),
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn job_complete(
        &mut self,
        request: JobCompleteRequest,
    ) -> Result<JobCompleteResult, StoreError> {
        let tx = self.write_tx()?;
        let result = finish_job_tx(
            &tx,
            request.job_id.as_str(),
            request.worker_id.as_str(),
            request.now_ms,
            Some(&request.outcome),
        )?;
        tx.commit()?;
        Ok(result)
    }

    pub fn job_settle_from_run(
        &mut self,
        request: JobOwnerRequest,
    ) -> Result<JobCompleteResult, StoreError> {
        let tx = self.write_tx()?;
        let result = finish_job_tx(
            &tx,
            request.job_id.as_str(),
            request.worker_id.as_str(),
            request.now_ms,
            None,
        )?;
        tx.commit()?;
        Ok(result)
    }

    pub fn jobs_clear_stale_leases(&mut self, now_ms: i64) -> Result<usize, StoreError> {
        let tx = self.write_tx()?;
        let stale = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, worker_id
                FROM jobs
                WHERE status IN ('claimed', 'running') AND COALESCE(lease_expires_at_ms, 0) <= ?1
                ORDER BY created_at_ms ASC, id ASC
                "#,
            )?;
            let rows = stmt.query_map(params![now_ms], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for (job_id, worker_id) in &stale {
            tx.execute(
                r#"
                UPDATE jobs
                SET status='queued', previous_worker_id=worker_id, worker_id=NULL,
                    lease_expires_at_ms=NULL, updated_at_ms=?2
                WHERE id=?1
                "#,
                params![job_id, now_ms],
            )?;
            insert_job_event_tx(
                &tx,
                job_id,
                now_ms,
                "lease_expired",
                "requeued after lease expiry",
                Some(json!({ "previous_worker_id": worker_id })),
            )?;
        }
        tx.commit()?;

        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "requeued jobs with expired leases");
        }
        Ok(stale.len())
    }

    pub fn jobs_status_counts(&self, queue: &QueueName) -> Result<JobsStatusCounts, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(1) FROM jobs WHERE queue=?1 GROUP BY status")?;
        let mut rows = stmt.query(params![queue.as_str()])?;
        let mut counts = JobsStatusCounts::default();
        while let Some(row) = rows.next()? {
            let count = row.get::<_, i64>(1)?.max(0) as u64;
            match row.get::<_, JobStatus>(0)? {
                JobStatus::Queued => counts.queued = count,
                JobStatus::Claimed => counts.claimed = count,
                JobStatus::Running => counts.running = count,
                JobStatus::Succeeded => counts.succeeded = count,
                JobStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    pub fn job_events_tail(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<JobEventRow>, StoreError> {
        let limit = limit.clamp(1, MAX_TAIL_EVENTS) as i64;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT seq, job_id, ts_ms, kind, message, meta_json
            FROM job_events
            WHERE job_id=?1
            ORDER BY seq DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![job_id.as_str(), limit], |row| {
            Ok(JobEventRow {
                seq: row.get(0)?,
                job_id: row.get(1)?,
                ts_ms: row.get(2)?,
                kind: row.get(3)?,
                message: row.get(4)?,
                meta_json: row.get(5)?,
            })
        })?;
        let mut events = rows.collect::<Result<Vec<_>, _>>()?;
        events.reverse();
        Ok(events)
    }
}
