#![forbid(unsafe_code)]

use crate::config::WorkerConfig;
use crate::error::RunnerError;
use crate::executor::{CancelFlag, ExecutionOutput, ExecutionRequest, ExecutorError, SandboxExecutor};
use crate::materialize::{RunOutcome, materialize};
use crate::now_ms;
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle, sleep};
use std::time::Duration;
use tr_core::{CapacityLimiter, CapacityPermit, JobId, RunId, ToolError};
use tr_storage::{
    JobClaim, JobClaimNextRequest, JobCompleteRequest, JobCompleteResult, JobHeartbeatRequest,
    JobOwnerRequest, JobStatus, SqliteStore, StoreError,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobDisposition {
    Succeeded,
    Failed { error_code: String },
    /// Adopted job whose run had already finished; finalized without executing again.
    Settled { status: JobStatus },
    /// Ownership was lost; nothing further was written for this job.
    Abandoned,
}

#[derive(Clone, Debug)]
pub struct JobReport {
    pub job_id: String,
    pub run_id: String,
    pub is_adoption: bool,
    pub disposition: JobDisposition,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub settled: usize,
    pub abandoned: usize,
}

impl WorkerSummary {
    fn record(&mut self, report: &JobReport) {
        self.claimed += 1;
        match report.disposition {
            JobDisposition::Succeeded => self.succeeded += 1,
            JobDisposition::Failed { .. } => self.failed += 1,
            JobDisposition::Settled { .. } => self.settled += 1,
            JobDisposition::Abandoned => self.abandoned += 1,
        }
    }
}

/// Polls one queue, runs claimed jobs through the sandbox executor and records outcomes.
///
/// Admission is gated by a [`CapacityLimiter`]: a job is only claimed while a slot is free,
/// and each claimed job runs on its own thread with its own store connection.
pub struct Worker {
    config: WorkerConfig,
    store: SqliteStore,
    executor: Arc<dyn SandboxExecutor>,
    capacity: Arc<CapacityLimiter>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        executor: Arc<dyn SandboxExecutor>,
    ) -> Result<Self, RunnerError> {
        let config = config.validate()?;
        let capacity = Arc::new(CapacityLimiter::new(config.max_concurrency)?);
        let store = SqliteStore::open(&config.storage_dir)?;
        Ok(Self {
            config,
            store,
            executor,
            capacity,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Setting the flag makes [`Worker::run`] stop claiming and return once in-flight jobs end.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    // In `once` mode at most one job is processed, inline.
    pub fn run(&mut self) -> Result<WorkerSummary, RunnerError> {
        let mut summary = WorkerSummary::default();
        if self.config.once {
            if let Some(report) = self.process_next()? {
                summary.record(&report);
            }
            return Ok(summary);
        }

        tracing::info!(
            worker_id = %self.config.worker_id,
            queue = %self.config.queue,
            max_concurrency = self.config.max_concurrency,
            "worker started"
        );
        let mut in_flight = Vec::<JoinHandle<JobReport>>::new();
        let mut idle_ms = self.config.poll_ms;
        while !self.shutdown.load(Ordering::SeqCst) {
            reap(&mut in_flight, &mut summary, false);

            let Some(permit) = self.capacity.try_permit() else {
                tracing::debug!(in_use = self.capacity.in_use(), "at capacity");
                sleep(Duration::from_millis(self.config.poll_ms));
                continue;
            };
            let claim = match self.claim() {
                Ok(Some(claim)) => claim,
                Ok(None) => {
                    drop(permit);
                    tracing::debug!(queue = %self.config.queue, idle_ms, "no eligible job");
                    sleep(Duration::from_millis(idle_ms));
                    idle_ms = idle_ms.saturating_mul(2).min(self.config.max_poll_ms);
                    continue;
                }
                Err(err) => {
                    drop(permit);
                    tracing::warn!(error = %err, "claim failed; retrying");
                    sleep(Duration::from_millis(idle_ms));
                    continue;
                }
            };
            idle_ms = self.config.poll_ms;
            in_flight.push(self.spawn_job(claim, permit)?);
        }

        reap(&mut in_flight, &mut summary, true);
        tracing::info!(
            claimed = summary.claimed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "worker stopped"
        );
        Ok(summary)
    }

    pub fn process_next(&mut self) -> Result<Option<JobReport>, RunnerError> {
        let Some(_permit) = self.capacity.try_permit() else {
            return Ok(None);
        };
        let Some(claim) = self.claim()? else {
            tracing::debug!(queue = %self.config.queue, "no eligible job");
            return Ok(None);
        };
        Ok(Some(process_claim(
            &mut self.store,
            self.executor.as_ref(),
            &self.config,
            claim,
        )))
    }

    fn claim(&mut self) -> Result<Option<JobClaim>, RunnerError> {
        Ok(self.store.job_claim_next(JobClaimNextRequest {
            queue: self.config.queue.clone(),
            worker_id: self.config.worker_id.clone(),
            now_ms: now_ms(),
            lease_ttl_ms: self.config.lease_ttl_ms,
        })?)
    }

    fn spawn_job(
        &self,
        claim: JobClaim,
        permit: CapacityPermit,
    ) -> Result<JoinHandle<JobReport>, RunnerError> {
        let config = self.config.clone();
        let executor = Arc::clone(&self.executor);
        thread::Builder::new()
            .name(format!("job-{}", claim.job.id))
            .spawn(move || {
                let _permit = permit;
                match SqliteStore::open(&config.storage_dir) {
                    Ok(mut store) => process_claim(&mut store, executor.as_ref(), &config, claim),
                    Err(err) => {
                        tracing::error!(
                            job_id = %claim.job.id,
                            error = %err,
                            "cannot open store for job; lease will lapse"
                        );
                        report(&claim, JobDisposition::Abandoned)
                    }
                }
            })
            .map_err(|source| RunnerError::io("spawn job thread", source))
    }
}

fn reap(in_flight: &mut Vec<JoinHandle<JobReport>>, summary: &mut WorkerSummary, wait_all: bool) {
    let mut pending = Vec::with_capacity(in_flight.len());
    for handle in in_flight.drain(..) {
        if !wait_all && !handle.is_finished() {
            pending.push(handle);
            continue;
        }
        match handle.join() {
            Ok(job) => summary.record(&job),
            Err(payload) => {
                tracing::error!(panic = %panic_message(payload), "job thread panicked");
                summary.claimed += 1;
                summary.abandoned += 1;
            }
        }
    }
    *in_flight = pending;
}

fn report(claim: &JobClaim, disposition: JobDisposition) -> JobReport {
    JobReport {
        job_id: claim.job.id.clone(),
        run_id: claim.job.run_id.clone(),
        is_adoption: claim.is_adoption,
        disposition,
    }
}

/// Everything that happens to one claimed job. Never fails: errors become a failed job.
fn process_claim(
    store: &mut SqliteStore,
    executor: &dyn SandboxExecutor,
    config: &WorkerConfig,
    claim: JobClaim,
) -> JobReport {
    let span = tracing::info_span!(
        "job",
        job_id = %claim.job.id,
        run_id = %claim.job.run_id,
        worker_id = %config.worker_id,
        queue = %config.queue,
    );
    let _entered = span.enter();

    if claim.is_adoption {
        tracing::info!(
            previous_worker_id = claim.job.previous_worker_id.as_deref().unwrap_or("-"),
            attempt = claim.job.attempts,
            "adopted job"
        );
    } else {
        tracing::info!(attempt = claim.job.attempts, "claimed job");
    }

    let disposition = match run_claimed_job(store, executor, config, &claim) {
        Ok(disposition) => disposition,
        Err(err) => record_worker_failure(store, config, &claim, err),
    };
    report(&claim, disposition)
}

fn run_claimed_job(
    store: &mut SqliteStore,
    executor: &dyn SandboxExecutor,
    config: &WorkerConfig,
    claim: &JobClaim,
) -> Result<JobDisposition, RunnerError> {
    let job_id = JobId::try_new(claim.job.id.as_str())?;
    let run_id = RunId::try_new(claim.job.run_id.as_str())?;
    let owner = |now_ms| JobOwnerRequest {
        job_id: job_id.clone(),
        worker_id: config.worker_id.clone(),
        now_ms,
    };

    let run = store
        .run_get(&run_id)?
        .ok_or_else(|| StoreError::UnknownRun {
            run_id: run_id.as_str().to_string(),
        })?;

    if claim.is_adoption && run.status.is_terminal() {
        let settled = store.job_settle_from_run(owner(now_ms()))?;
        tracing::info!(
            status = %settled.job.status,
            "run already finished; settled adopted job without executing"
        );
        return Ok(JobDisposition::Settled {
            status: settled.job.status,
        });
    }

    if !store.job_mark_running(owner(now_ms()))? {
        tracing::warn!("lease lost before execution; abandoning job");
        return Ok(JobDisposition::Abandoned);
    }

    let request = ExecutionRequest::for_run(&run, config.run_dir(&run.id))?;
    let outcome = match supervise(store, executor, config, &job_id, &request) {
        Supervised::LeaseLost => {
            tracing::warn!("lease lost during execution; discarding results");
            return Ok(JobDisposition::Abandoned);
        }
        Supervised::Finished(Ok(output)) => materialize(&request.run_dir, &output),
        Supervised::Finished(Err(err)) => {
            tracing::error!(error = %err, detail = %err.detail(), "sandbox execution failed");
            RunOutcome::Failed(err.into())
        }
    };

    complete(store, config, &job_id, outcome)
}

enum Supervised {
    Finished(Result<ExecutionOutput, ExecutorError>),
    LeaseLost,
}

/// Run the executor on a scoped thread and heartbeat from this one until it returns.
fn supervise(
    store: &mut SqliteStore,
    executor: &dyn SandboxExecutor,
    config: &WorkerConfig,
    job_id: &JobId,
    request: &ExecutionRequest,
) -> Supervised {
    let cancel = CancelFlag::new();
    let heartbeat_every = Duration::from_millis(config.heartbeat_ms);

    thread::scope(|scope| {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let cancel_ref = &cancel;
        let handle = scope.spawn(move || {
            let _done = done_tx;
            executor.execute(request, cancel_ref)
        });

        let mut lease_lost = false;
        loop {
            match done_rx.recv_timeout(heartbeat_every) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            if lease_lost {
                continue;
            }
            match store.job_heartbeat(JobHeartbeatRequest {
                job_id: job_id.clone(),
                worker_id: config.worker_id.clone(),
                now_ms: now_ms(),
                lease_ttl_ms: config.lease_ttl_ms,
            }) {
                Ok(true) => tracing::debug!("heartbeat"),
                Ok(false) => {
                    tracing::warn!("heartbeat found the lease taken; cancelling sandbox");
                    lease_lost = true;
                    cancel.cancel();
                }
                Err(err) => tracing::warn!(error = %err, "heartbeat failed; will retry"),
            }
        }

        let result = handle
            .join()
            .unwrap_or_else(|payload| Err(ExecutorError::Panicked(panic_message(payload))));
        if lease_lost {
            Supervised::LeaseLost
        } else {
            Supervised::Finished(result)
        }
    })
}

fn complete(
    store: &mut SqliteStore,
    config: &WorkerConfig,
    job_id: &JobId,
    outcome: RunOutcome,
) -> Result<JobDisposition, RunnerError> {
    let completed = store.job_complete(JobCompleteRequest {
        job_id: job_id.clone(),
        worker_id: config.worker_id.clone(),
        now_ms: now_ms(),
        outcome: outcome.into_completion(),
    });
    match completed {
        Ok(done) => Ok(disposition_of(&done)),
        Err(err @ (StoreError::JobClaimMismatch { .. } | StoreError::JobAlreadyTerminal { .. })) => {
            tracing::warn!(error = %err, "lease lost before completion; result discarded");
            Ok(JobDisposition::Abandoned)
        }
        Err(err) => Err(err.into()),
    }
}

fn disposition_of(done: &JobCompleteResult) -> JobDisposition {
    if done.run_already_final {
        tracing::info!(status = %done.run.status.as_str(), "run was already final; kept its outcome");
    }
    match done.job.status {
        JobStatus::Succeeded => {
            tracing::info!("job succeeded");
            JobDisposition::Succeeded
        }
        _ => {
            let error_code = done
                .run
                .error_kind
                .clone()
                .unwrap_or_else(|| tr_core::ErrorKind::Internal.code().to_string());
            tracing::error!(
                error_code = %error_code,
                summary = done.run.error_summary.as_deref().unwrap_or("-"),
                "job failed"
            );
            JobDisposition::Failed { error_code }
        }
    }
}

/// Last resort for store or bookkeeping errors: try to record a generic failure.
fn record_worker_failure(
    store: &mut SqliteStore,
    config: &WorkerConfig,
    claim: &JobClaim,
    err: RunnerError,
) -> JobDisposition {
    tracing::error!(error = %err, "job processing failed");
    let Ok(job_id) = JobId::try_new(claim.job.id.as_str()) else {
        return JobDisposition::Abandoned;
    };
    let failure = ToolError::internal(
        "worker failed while processing the job",
        Some(json!({ "error": err.to_string() })),
    );
    match complete(store, config, &job_id, RunOutcome::Failed(failure)) {
        Ok(disposition) => disposition,
        Err(record_err) => {
            tracing::error!(error = %record_err, "could not record job failure; lease will lapse");
            JobDisposition::Abandoned
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
