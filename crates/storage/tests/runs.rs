#![forbid(unsafe_code)]

use serde_json::json;
use std::path::PathBuf;
use tr_core::{ErrorKind, QueueName, RunId, ToolId};
use tr_storage::{EnqueueRunRequest, RunCreateRequest, RunStatus, SqliteStore, StoreError};

const T0: i64 = 1_700_000_000_000;

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("tr_storage_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn request(run_id: Option<&str>, input_files: &[&str]) -> RunCreateRequest {
    RunCreateRequest {
        run_id: run_id.map(|id| RunId::try_new(id).expect("run id")),
        tool_id: ToolId::try_new("tool-csv").expect("tool id"),
        tool_version_id: " v7 ".to_string(),
        context: json!({ "user": "alice" }),
        input_files: input_files.iter().map(|s| s.to_string()).collect(),
        memory: json!({ "threshold": 3 }),
        now_ms: T0,
    }
}

#[test]
fn run_create_generates_ids_and_normalizes_inputs() {
    let mut store = SqliteStore::open(temp_dir("run_create")).expect("open store");
    let run = store
        .run_create(request(None, &["./data.csv", "nested//b.json", "data.csv"]))
        .expect("create run");

    assert!(run.id.starts_with("RUN-"));
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.tool_version_id, "v7");
    assert_eq!(run.input_files, ["data.csv", "nested/b.json"]);

    let loaded = store
        .run_get(&RunId::try_new(run.id.clone()).expect("run id"))
        .expect("get")
        .expect("run exists");
    assert_eq!(loaded.context, json!({ "user": "alice" }));
    assert_eq!(loaded.memory, json!({ "threshold": 3 }));
    assert_eq!(loaded.input_files, run.input_files);
    assert_eq!(loaded.ui_payload, None);
}

#[test]
fn run_create_rejects_duplicates_and_unsafe_inputs() {
    let mut store = SqliteStore::open(temp_dir("run_create_errors")).expect("open store");
    store
        .run_create(request(Some("run-1"), &[]))
        .expect("create run");

    let err = store
        .run_create(request(Some("run-1"), &[]))
        .expect_err("duplicate");
    assert!(matches!(err, StoreError::RunAlreadyExists { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    for bad in ["../secrets.txt", "/etc/passwd", ""] {
        let err = store
            .run_create(request(Some("run-2"), &[bad]))
            .expect_err("unsafe input file");
        assert_eq!(err.kind(), ErrorKind::Validation, "input {bad:?}");
    }
}

#[test]
fn enqueue_is_atomic() {
    let mut store = SqliteStore::open(temp_dir("enqueue_atomic")).expect("open store");
    store
        .run_create(request(Some("run-1"), &[]))
        .expect("create run");

    let err = store
        .enqueue_run(EnqueueRunRequest {
            run: request(Some("run-1"), &[]),
            queue: QueueName::default_queue(),
        })
        .expect_err("run id taken");
    assert!(matches!(err, StoreError::RunAlreadyExists { .. }));

    let counts = store
        .jobs_status_counts(&QueueName::default_queue())
        .expect("counts");
    assert_eq!(counts.queued, 0);
}

#[test]
fn mark_running_is_idempotent_and_keeps_first_start() {
    let mut store = SqliteStore::open(temp_dir("run_mark_running")).expect("open store");
    store
        .run_create(request(Some("run-1"), &[]))
        .expect("create run");
    let run_id = RunId::try_new("run-1").expect("run id");

    assert!(store.run_mark_running(&run_id, T0 + 5).expect("mark"));
    assert!(store.run_mark_running(&run_id, T0 + 9).expect("mark again"));
    let run = store.run_get(&run_id).expect("get").expect("run");
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.started_at_ms, Some(T0 + 5));

    let err = store
        .run_mark_running(&RunId::try_new("missing").expect("run id"), T0)
        .expect_err("unknown run");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
