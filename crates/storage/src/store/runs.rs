#![forbid(unsafe_code)]

use super::*;
use rusqlite::{OptionalExtension, params};
use serde_json::Value as JsonValue;
use tr_core::{RunId, normalize_relative_path, new_prefixed_id};

const MAX_TOOL_VERSION_ID_LEN: usize = 128;
const MAX_INPUT_FILES: usize = 64;

const RUN_COLUMNS: &str = "id, tool_id, tool_version_id, status, context_json, input_files_json, memory_json, \
     ui_payload_json, artifacts_manifest_json, error_kind, error_summary, error_detail_json, \
     created_at_ms, updated_at_ms, started_at_ms, completed_at_ms";

struct RawRunRow {
    id: String,
    tool_id: String,
    tool_version_id: String,
    status: String,
    context_json: String,
    input_files_json: String,
    memory_json: String,
    ui_payload_json: Option<String>,
    artifacts_manifest_json: Option<String>,
    error_kind: Option<String>,
    error_summary: Option<String>,
    error_detail_json: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
    started_at_ms: Option<i64>,
    completed_at_ms: Option<i64>,
}

fn read_raw_run_row(row: &rusqlite::Row<'_>) -> Result<RawRunRow, rusqlite::Error> {
    Ok(RawRunRow {
        id: row.get(0)?,
        tool_id: row.get(1)?,
        tool_version_id: row.get(2)?,
        status: row.get(3)?,
        context_json: row.get(4)?,
        input_files_json: row.get(5)?,
        memory_json: row.get(6)?,
        ui_payload_json: row.get(7)?,
        artifacts_manifest_json: row.get(8)?,
        error_kind: row.get(9)?,
        error_summary: row.get(10)?,
        error_detail_json: row.get(11)?,
        created_at_ms: row.get(12)?,
        updated_at_ms: row.get(13)?,
        started_at_ms: row.get(14)?,
        completed_at_ms: row.get(15)?,
    })
}

impl RawRunRow {
    fn decode(self) -> Result<RunRow, StoreError> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| StoreError::CorruptRow(format!("runs.status={}", self.status)))?;
        let input_files = serde_json::from_str::<Vec<String>>(&self.input_files_json)
            .map_err(|e| StoreError::CorruptRow(format!("runs.input_files_json: {e}")))?;
        let artifacts_manifest = self
            .artifacts_manifest_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::CorruptRow(format!("runs.artifacts_manifest_json: {e}")))?;
        Ok(RunRow {
            id: self.id,
            tool_id: self.tool_id,
            tool_version_id: self.tool_version_id,
            status,
            context: decode_json_column("runs.context_json", &self.context_json)?,
            input_files,
            memory: decode_json_column("runs.memory_json", &self.memory_json)?,
            ui_payload: decode_optional_json_column("runs.ui_payload_json", self.ui_payload_json)?,
            artifacts_manifest,
            error_kind: self.error_kind,
            error_summary: self.error_summary,
            error_detail: decode_optional_json_column(
                "runs.error_detail_json",
                self.error_detail_json,
            )?,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
            started_at_ms: self.started_at_ms,
            completed_at_ms: self.completed_at_ms,
        })
    }
}

pub(super) fn load_run_tx(tx: &Transaction<'_>, run_id: &str) -> Result<Option<RunRow>, StoreError> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id=?1");
    tx.query_row(&sql, params![run_id], read_raw_run_row)
        .optional()?
        .map(RawRunRow::decode)
        .transpose()
}

pub(super) fn require_run_tx(tx: &Transaction<'_>, run_id: &str) -> Result<RunRow, StoreError> {
    load_run_tx(tx, run_id)?.ok_or_else(|| StoreError::UnknownRun {
        run_id: run_id.to_string(),
    })
}

fn normalize_input_files(files: &[String]) -> Result<Vec<String>, StoreError> {
    if files.len() > MAX_INPUT_FILES {
        return Err(StoreError::InvalidInput("too many input files"));
    }
    let mut out = Vec::with_capacity(files.len());
    for raw in files {
        let normalized = normalize_relative_path(raw)
            .map_err(|_| StoreError::InvalidInput("input file name must be a safe relative path"))?;
        if !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    Ok(out)
}

pub(super) fn insert_run_tx(
    tx: &Transaction<'_>,
    request: RunCreateRequest,
) -> Result<RunRow, StoreError> {
    let run_id = match request.run_id {
        Some(id) => id,
        None => RunId::try_new(new_prefixed_id("RUN"))
            .map_err(|_| StoreError::InvalidInput("generated run id is invalid"))?,
    };
    let tool_version_id = normalize_required_text(
        &request.tool_version_id,
        MAX_TOOL_VERSION_ID_LEN,
        "tool_version_id must not be empty",
        "tool_version_id is too long",
    )?;
    let input_files = normalize_input_files(&request.input_files)?;
    let input_files_json = encode_json(&JsonValue::from(input_files.clone()));
    let now_ms = request.now_ms;

    let inserted = tx.execute(
        r#"
        INSERT INTO runs(
          id, tool_id, tool_version_id, status, context_json, input_files_json, memory_json,
          created_at_ms, updated_at_ms
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
        "#,
        params![
            run_id.as_str(),
            request.tool_id.as_str(),
            tool_version_id,
            RunStatus::Queued.as_str(),
            encode_json(&request.context),
            input_files_json,
            encode_json(&request.memory),
            now_ms,
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(err) if error::is_unique_violation(&err) => {
            return Err(StoreError::RunAlreadyExists {
                run_id: run_id.into_string(),
            });
        }
        Err(err) => return Err(err.into()),
    }

    Ok(RunRow {
        id: run_id.into_string(),
        tool_id: request.tool_id.into_string(),
        tool_version_id,
        status: RunStatus::Queued,
        context: request.context,
        input_files,
        memory: request.memory,
        ui_payload: None,
        artifacts_manifest: None,
        error_kind: None,
        error_summary: None,
        error_detail: None,
        created_at_ms: now_ms,
        updated_at_ms: now_ms,
        started_at_ms: None,
        completed_at_ms: None,
    })
}

/// Queued → running. Terminal runs are left as they are.
pub(super) fn mark_run_running_tx(
    tx: &Transaction<'_>,
    run_id: &str,
    now_ms: i64,
) -> Result<bool, StoreError> {
    let changed = tx.execute(
        r#"
        UPDATE runs
        SET status='running', started_at_ms=COALESCE(started_at_ms, ?2), updated_at_ms=?2
        WHERE id=?1 AND status IN ('queued', 'running')
        "#,
        params![run_id, now_ms],
    )?;
    Ok(changed == 1)
}

/// Write the run outcome. Returns false (and writes nothing) when the run is already terminal.
pub(super) fn finish_run_tx(
    tx: &Transaction<'_>,
    run_id: &str,
    outcome: &RunCompletion,
    now_ms: i64,
) -> Result<bool, StoreError> {
    let changed = match outcome {
        RunCompletion::Succeeded {
            ui_payload,
            manifest,
        } => {
            let manifest_json = serde_json::to_string(manifest)
                .map_err(|e| StoreError::CorruptRow(format!("artifacts manifest: {e}")))?;
            tx.execute(
                r#"
                UPDATE runs
                SET status='succeeded', ui_payload_json=?2, artifacts_manifest_json=?3,
                    error_kind=NULL, error_summary=NULL, error_detail_json=NULL,
                    updated_at_ms=?4, completed_at_ms=?4
                WHERE id=?1 AND status IN ('queued', 'running')
                "#,
                params![run_id, encode_json(ui_payload), manifest_json, now_ms],
            )?
        }
        RunCompletion::Failed(failure) => tx.execute(
            r#"
            UPDATE runs
            SET status='failed', error_kind=?2, error_summary=?3, error_detail_json=?4,
                updated_at_ms=?5, completed_at_ms=?5
            WHERE id=?1 AND status IN ('queued', 'running')
            "#,
            params![
                run_id,
                failure.error_code,
                failure.error_summary,
                failure.error_detail.as_ref().map(encode_json),
                now_ms,
            ],
        )?,
    };
    Ok(changed == 1)
}

impl SqliteStore {
    pub fn run_create(&mut self, request: RunCreateRequest) -> Result<RunRow, StoreError> {
        let tx = self.write_tx()?;
        let run = insert_run_tx(&tx, request)?;
        tx.commit()?;
        Ok(run)
    }

    pub fn run_get(&mut self, run_id: &RunId) -> Result<Option<RunRow>, StoreError> {
        let tx = self.conn.transaction()?;
        let run = load_run_tx(&tx, run_id.as_str())?;
        tx.commit()?;
        Ok(run)
    }

    pub fn run_mark_running(&mut self, run_id: &RunId, now_ms: i64) -> Result<bool, StoreError> {
        let tx = self.write_tx()?;
        require_run_tx(&tx, run_id.as_str())?;
        let changed = mark_run_running_tx(&tx, run_id.as_str(), now_ms)?;
        tx.commit()?;
        Ok(changed)
    }

    /// Create a run and its queued job atomically.
    pub fn enqueue_run(
        &mut self,
        request: EnqueueRunRequest,
    ) -> Result<EnqueueRunResult, StoreError> {
        let now_ms = request.run.now_ms;
        let tx = self.write_tx()?;
        let run = insert_run_tx(&tx, request.run)?;
        let job = jobs::insert_job_tx(&tx, &run.id, request.queue.as_str(), now_ms)?;
        tx.commit()?;
        Ok(EnqueueRunResult { run, job })
    }
}
