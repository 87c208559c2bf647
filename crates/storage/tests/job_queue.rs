#![forbid(unsafe_code)]

use rusqlite::{Connection, params};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tr_core::{ErrorKind, JobId, ManifestBuilder, QueueName, RunId, ToolId, WorkerId};
use tr_storage::{
    DB_FILE_NAME, EnqueueRunRequest, JobClaimNextRequest, JobCompleteRequest, JobCreateRequest,
    JobHeartbeatRequest, JobOwnerRequest, JobRow, JobStatus, RunCompletion, RunCreateRequest,
    RunFailure, RunStatus, SqliteStore, StoreError,
};

const T0: i64 = 1_700_000_000_000;
const TTL: u64 = 30_000;

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

fn setup(test_name: &str) -> (SqliteStore, PathBuf) {
    let dir = temp_dir(test_name);
    let store = SqliteStore::open(&dir).expect("open store");
    (store, dir)
}

fn queue(name: &str) -> QueueName {
    QueueName::try_new(name).expect("queue name")
}

fn worker(name: &str) -> WorkerId {
    WorkerId::try_new(name).expect("worker id")
}

fn job_id(job: &JobRow) -> JobId {
    JobId::try_new(job.id.clone()).expect("job id")
}

fn run_request(run_id: &str, now_ms: i64) -> RunCreateRequest {
    RunCreateRequest {
        run_id: Some(RunId::try_new(run_id).expect("run id")),
        tool_id: ToolId::try_new("tool-csv").expect("tool id"),
        tool_version_id: "v1".to_string(),
        context: json!({ "locale": "en" }),
        input_files: vec!["data.csv".to_string()],
        memory: json!({}),
        now_ms,
    }
}

fn enqueue(store: &mut SqliteStore, run_id: &str, queue_name: &str, now_ms: i64) -> JobRow {
    store
        .enqueue_run(EnqueueRunRequest {
            run: run_request(run_id, now_ms),
            queue: queue(queue_name),
        })
        .expect("enqueue run")
        .job
}

fn claim(
    store: &mut SqliteStore,
    queue_name: &str,
    worker_id: &str,
    now_ms: i64,
    lease_ttl_ms: u64,
) -> Option<tr_storage::JobClaim> {
    store
        .job_claim_next(JobClaimNextRequest {
            queue: queue(queue_name),
            worker_id: worker(worker_id),
            now_ms,
            lease_ttl_ms,
        })
        .expect("claim next")
}

fn raw_conn(dir: &Path) -> Connection {
    Connection::open(dir.join(DB_FILE_NAME)).expect("open raw connection")
}

#[test]
fn claim_takes_oldest_queued_job_and_sets_lease() {
    let (mut store, _dir) = setup("claim_oldest");
    let first = enqueue(&mut store, "run-1", "default", T0);
    let _second = enqueue(&mut store, "run-2", "default", T0 + 5);

    let claimed = claim(&mut store, "default", "worker-a", T0 + 10, TTL).expect("job");
    assert!(!claimed.is_adoption);
    assert_eq!(claimed.job.id, first.id);
    assert_eq!(claimed.job.status, JobStatus::Claimed);
    assert_eq!(claimed.job.worker_id.as_deref(), Some("worker-a"));
    assert_eq!(claimed.job.lease_expires_at_ms, Some(T0 + 10 + TTL as i64));
    assert_eq!(claimed.job.attempts, 1);
}

#[test]
fn claim_only_sees_the_polled_queue() {
    let (mut store, _dir) = setup("claim_queue_isolation");
    enqueue(&mut store, "run-1", "gpu", T0);

    assert!(claim(&mut store, "default", "worker-a", T0, TTL).is_none());
    assert!(claim(&mut store, "gpu", "worker-a", T0, TTL).is_some());
    assert!(claim(&mut store, "gpu", "worker-b", T0, TTL).is_none());
}

#[test]
fn only_one_active_job_per_run() {
    let (mut store, _dir) = setup("duplicate_active_job");
    let job = enqueue(&mut store, "run-1", "default", T0);
    let run_id = RunId::try_new("run-1").expect("run id");

    let err = store
        .job_create(JobCreateRequest {
            run_id: run_id.clone(),
            queue: queue("default"),
            now_ms: T0 + 1,
        })
        .expect_err("second active job must be rejected");
    assert!(matches!(err, StoreError::DuplicateActiveJob { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    claim(&mut store, "default", "worker-a", T0 + 2, TTL).expect("claim");
    store
        .job_complete(JobCompleteRequest {
            job_id: job_id(&job),
            worker_id: worker("worker-a"),
            now_ms: T0 + 3,
            outcome: RunCompletion::Failed(RunFailure {
                error_code: "INTERNAL_ERROR".to_string(),
                error_summary: "The tool run failed. Please try again later.".to_string(),
                error_detail: None,
            }),
        })
        .expect("complete");

    let retry = store
        .job_create(JobCreateRequest {
            run_id,
            queue: queue("default"),
            now_ms: T0 + 4,
        })
        .expect("a terminal job frees the run");
    assert_eq!(retry.status, JobStatus::Queued);
}

#[test]
fn job_create_requires_an_existing_run() {
    let (mut store, _dir) = setup("job_create_unknown_run");
    let err = store
        .job_create(JobCreateRequest {
            run_id: RunId::try_new("missing").expect("run id"),
            queue: queue("default"),
            now_ms: T0,
        })
        .expect_err("unknown run");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn concurrent_claims_never_share_a_job() {
    const JOBS: usize = 5;
    const WORKERS: usize = 8;

    let (mut store, dir) = setup("concurrent_claims");
    for i in 0..JOBS {
        enqueue(&mut store, &format!("run-{i}"), "default", T0 + i as i64);
    }
    drop(store);

    let handles = (0..WORKERS)
        .map(|w| {
            let dir = dir.clone();
            std::thread::spawn(move || {
                let mut store = SqliteStore::open(&dir).expect("open store");
                claim(&mut store, "default", &format!("worker-{w}"), T0 + 100, TTL)
                    .map(|c| c.job.id)
            })
        })
        .collect::<Vec<_>>();

    let claimed = handles
        .into_iter()
        .filter_map(|h| h.join().expect("join"))
        .collect::<Vec<_>>();
    let unique = claimed.iter().cloned().collect::<HashSet<_>>();
    assert_eq!(claimed.len(), JOBS.min(WORKERS));
    assert_eq!(unique.len(), claimed.len());
}

#[test]
fn expired_lease_is_adopted_by_another_worker() {
    let (mut store, _dir) = setup("lease_adoption");
    enqueue(&mut store, "run-1", "default", T0);

    let first = claim(&mut store, "default", "worker-a", T0, 1_000).expect("claim");
    let id = job_id(&first.job);

    assert!(claim(&mut store, "default", "worker-b", T0 + 999, TTL).is_none());

    let adopted = claim(&mut store, "default", "worker-b", T0 + 1_000, TTL).expect("adopt");
    assert!(adopted.is_adoption);
    assert_eq!(adopted.job.id, first.job.id);
    assert_eq!(adopted.job.worker_id.as_deref(), Some("worker-b"));
    assert_eq!(adopted.job.previous_worker_id.as_deref(), Some("worker-a"));
    assert_eq!(adopted.job.attempts, 2);

    let still_owner = store
        .job_heartbeat(JobHeartbeatRequest {
            job_id: id.clone(),
            worker_id: worker("worker-a"),
            now_ms: T0 + 1_001,
            lease_ttl_ms: TTL,
        })
        .expect("heartbeat");
    assert!(!still_owner);

    let err = store
        .job_complete(JobCompleteRequest {
            job_id: id,
            worker_id: worker("worker-a"),
            now_ms: T0 + 1_002,
            outcome: RunCompletion::Succeeded {
                ui_payload: json!({}),
                manifest: ManifestBuilder::new().build(),
            },
        })
        .expect_err("lost owner must not complete");
    assert!(matches!(err, StoreError::JobClaimMismatch { .. }));
}

#[test]
fn lease_ttl_is_stored_exactly_as_requested() {
    let (mut store, _dir) = setup("lease_exact");
    enqueue(&mut store, "run-1", "default", T0);
    enqueue(&mut store, "run-2", "default", T0 + 1);

    let short = claim(&mut store, "default", "worker-a", T0, 500).expect("claim");
    assert_eq!(short.job.lease_expires_at_ms, Some(T0 + 500));

    let long = claim(&mut store, "default", "worker-a", T0, 1_800_000).expect("claim");
    assert_eq!(long.job.lease_expires_at_ms, Some(T0 + 1_800_000));

    assert!(claim(&mut store, "default", "worker-b", T0 + 499, TTL).is_none());
    let adopted = claim(&mut store, "default", "worker-b", T0 + 500, TTL).expect("adopt");
    assert_eq!(adopted.job.id, short.job.id);
    assert!(adopted.is_adoption);

    assert!(claim(&mut store, "default", "worker-b", T0 + 600_000, TTL).is_none());

    let renewed = store
        .job_heartbeat(JobHeartbeatRequest {
            job_id: job_id(&adopted.job),
            worker_id: worker("worker-b"),
            now_ms: T0 + 600,
            lease_ttl_ms: 250,
        })
        .expect("heartbeat");
    assert!(renewed);
    let row = store
        .job_get(&job_id(&adopted.job))
        .expect("get")
        .expect("row");
    assert_eq!(row.lease_expires_at_ms, Some(T0 + 850));
}

#[test]
fn zero_lease_ttl_is_rejected() {
    let (mut store, _dir) = setup("lease_zero");
    enqueue(&mut store, "run-1", "default", T0);

    let err = store
        .job_claim_next(JobClaimNextRequest {
            queue: queue("default"),
            worker_id: worker("worker-a"),
            now_ms: T0,
            lease_ttl_ms: 0,
        })
        .expect_err("zero ttl");
    assert!(matches!(err, StoreError::InvalidInput(_)));

    let claimed = claim(&mut store, "default", "worker-a", T0, TTL).expect("claim");
    assert!(!claimed.is_adoption);
}

#[test]
fn heartbeat_keeps_the_lease_alive() {
    let (mut store, _dir) = setup("heartbeat_extends");
    enqueue(&mut store, "run-1", "default", T0);
    let claimed = claim(&mut store, "default", "worker-a", T0, 1_000).expect("claim");

    let owned = store
        .job_heartbeat(JobHeartbeatRequest {
            job_id: job_id(&claimed.job),
            worker_id: worker("worker-a"),
            now_ms: T0 + 900,
            lease_ttl_ms: 1_000,
        })
        .expect("heartbeat");
    assert!(owned);

    assert!(claim(&mut store, "default", "worker-b", T0 + 1_500, TTL).is_none());
    assert!(claim(&mut store, "default", "worker-b", T0 + 1_900, TTL).is_some());
}

#[test]
fn sweep_requeues_expired_leases_and_claim_still_reports_adoption() {
    let (mut store, _dir) = setup("clear_stale_leases");
    enqueue(&mut store, "run-1", "default", T0);
    enqueue(&mut store, "run-2", "default", T0 + 1);
    let a = claim(&mut store, "default", "worker-a", T0 + 2, 1_000).expect("claim a");
    claim(&mut store, "default", "worker-b", T0 + 2, 60_000).expect("claim b");

    assert_eq!(store.jobs_clear_stale_leases(T0 + 500).expect("sweep"), 0);
    assert_eq!(store.jobs_clear_stale_leases(T0 + 1_002).expect("sweep"), 1);

    let requeued = store
        .job_get(&job_id(&a.job))
        .expect("get")
        .expect("job exists");
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.worker_id, None);
    assert_eq!(requeued.lease_expires_at_ms, None);
    assert_eq!(requeued.previous_worker_id.as_deref(), Some("worker-a"));

    let adopted = claim(&mut store, "default", "worker-c", T0 + 1_003, TTL).expect("claim");
    assert_eq!(adopted.job.id, a.job.id);
    assert!(adopted.is_adoption);
    assert_eq!(adopted.job.previous_worker_id.as_deref(), Some("worker-a"));

    let kinds = store
        .job_events_tail(&job_id(&a.job), 10)
        .expect("events")
        .into_iter()
        .map(|e| e.kind)
        .collect::<Vec<_>>();
    assert_eq!(kinds, ["queued", "claimed", "lease_expired", "adopted"]);
}

#[test]
fn completion_writes_job_and_run_together() {
    let (mut store, _dir) = setup("complete_success");
    let job = enqueue(&mut store, "run-1", "default", T0);
    claim(&mut store, "default", "worker-a", T0 + 1, TTL).expect("claim");

    let running = store
        .job_mark_running(JobOwnerRequest {
            job_id: job_id(&job),
            worker_id: worker("worker-a"),
            now_ms: T0 + 2,
        })
        .expect("mark running");
    assert!(running);
    let run = store
        .run_get(&RunId::try_new("run-1").expect("run id"))
        .expect("run get")
        .expect("run");
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.started_at_ms, Some(T0 + 2));

    let mut builder = ManifestBuilder::new();
    builder.push("output/report.pdf", 42).expect("artifact");
    let manifest = builder.build();
    let done = store
        .job_complete(JobCompleteRequest {
            job_id: job_id(&job),
            worker_id: worker("worker-a"),
            now_ms: T0 + 3,
            outcome: RunCompletion::Succeeded {
                ui_payload: json!({ "blocks": [] }),
                manifest: manifest.clone(),
            },
        })
        .expect("complete");

    assert!(!done.run_already_final);
    assert_eq!(done.job.status, JobStatus::Succeeded);
    assert_eq!(done.job.worker_id, None);
    assert_eq!(done.job.completed_at_ms, Some(T0 + 3));
    assert_eq!(done.run.status, RunStatus::Succeeded);
    assert_eq!(done.run.ui_payload, Some(json!({ "blocks": [] })));
    assert_eq!(done.run.artifacts_manifest, Some(manifest));

    let err = store
        .job_complete(JobCompleteRequest {
            job_id: job_id(&job),
            worker_id: worker("worker-a"),
            now_ms: T0 + 4,
            outcome: RunCompletion::Failed(RunFailure {
                error_code: "INTERNAL_ERROR".to_string(),
                error_summary: "late".to_string(),
                error_detail: None,
            }),
        })
        .expect_err("terminal job is final");
    assert!(matches!(err, StoreError::JobAlreadyTerminal { .. }));
}

#[test]
fn failed_completion_keeps_summary_and_detail_apart() {
    let (mut store, _dir) = setup("complete_failure");
    let job = enqueue(&mut store, "run-1", "default", T0);
    claim(&mut store, "default", "worker-a", T0 + 1, TTL).expect("claim");

    let done = store
        .job_complete(JobCompleteRequest {
            job_id: job_id(&job),
            worker_id: worker("worker-a"),
            now_ms: T0 + 2,
            outcome: RunCompletion::Failed(RunFailure {
                error_code: "USER_ERROR".to_string(),
                error_summary: "Column 'price' is missing".to_string(),
                error_detail: Some(json!({ "exit_code": 1 })),
            }),
        })
        .expect("complete");

    assert_eq!(done.job.status, JobStatus::Failed);
    assert_eq!(
        done.job.error_summary.as_deref(),
        Some("Column 'price' is missing")
    );
    assert_eq!(done.run.status, RunStatus::Failed);
    assert_eq!(done.run.error_kind.as_deref(), Some("USER_ERROR"));
    assert_eq!(done.run.error_detail, Some(json!({ "exit_code": 1 })));
    assert_eq!(done.run.artifacts_manifest, None);
}

#[test]
fn adopted_job_with_final_run_is_settled_without_overwrite() {
    let (mut store, dir) = setup("settle_from_run");
    let job = enqueue(&mut store, "run-1", "default", T0);
    claim(&mut store, "default", "worker-a", T0, 1_000).expect("claim");

    // The previous owner's run write landed but its job write did not.
    raw_conn(&dir)
        .execute(
            "UPDATE runs SET status='succeeded', ui_payload_json='{\"ok\":true}', completed_at_ms=?2 WHERE id=?1",
            params!["run-1", T0 + 10],
        )
        .expect("finish run out of band");

    let adopted = claim(&mut store, "default", "worker-b", T0 + 2_000, TTL).expect("adopt");
    assert!(adopted.is_adoption);

    let err = store
        .job_settle_from_run(JobOwnerRequest {
            job_id: job_id(&job),
            worker_id: worker("worker-a"),
            now_ms: T0 + 2_001,
        })
        .expect_err("previous owner cannot settle");
    assert!(matches!(err, StoreError::JobClaimMismatch { .. }));

    let settled = store
        .job_settle_from_run(JobOwnerRequest {
            job_id: job_id(&job),
            worker_id: worker("worker-b"),
            now_ms: T0 + 2_002,
        })
        .expect("settle");
    assert!(settled.run_already_final);
    assert_eq!(settled.job.status, JobStatus::Succeeded);
    assert_eq!(settled.run.ui_payload, Some(json!({ "ok": true })));
    assert_eq!(settled.run.completed_at_ms, Some(T0 + 10));
}

#[test]
fn settle_refuses_runs_that_are_still_open() {
    let (mut store, _dir) = setup("settle_open_run");
    let job = enqueue(&mut store, "run-1", "default", T0);
    claim(&mut store, "default", "worker-a", T0, TTL).expect("claim");

    let err = store
        .job_settle_from_run(JobOwnerRequest {
            job_id: job_id(&job),
            worker_id: worker("worker-a"),
            now_ms: T0 + 1,
        })
        .expect_err("run is not terminal");
    assert!(matches!(err, StoreError::RunNotTerminal { .. }));
}

#[test]
fn mark_running_requires_ownership() {
    let (mut store, _dir) = setup("mark_running_owner");
    let job = enqueue(&mut store, "run-1", "default", T0);
    claim(&mut store, "default", "worker-a", T0, TTL).expect("claim");

    let owned = store
        .job_mark_running(JobOwnerRequest {
            job_id: job_id(&job),
            worker_id: worker("worker-b"),
            now_ms: T0 + 1,
        })
        .expect("mark running");
    assert!(!owned);
    let current = store.job_get(&job_id(&job)).expect("get").expect("job");
    assert_eq!(current.status, JobStatus::Claimed);
}

#[test]
fn status_counts_are_per_queue() {
    let (mut store, _dir) = setup("status_counts");
    enqueue(&mut store, "run-1", "default", T0);
    enqueue(&mut store, "run-2", "default", T0 + 1);
    enqueue(&mut store, "run-3", "default", T0 + 2);
    enqueue(&mut store, "run-4", "other", T0 + 3);
    claim(&mut store, "default", "worker-a", T0 + 4, TTL).expect("claim");

    let counts = store.jobs_status_counts(&queue("default")).expect("counts");
    assert_eq!(counts.queued, 2);
    assert_eq!(counts.claimed, 1);
    assert_eq!(counts.running, 0);
    assert_eq!(counts.succeeded + counts.failed, 0);

    let other = store.jobs_status_counts(&queue("other")).expect("counts");
    assert_eq!(other.queued, 1);
}
