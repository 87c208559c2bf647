#![forbid(unsafe_code)]

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tr_core::{
    Actor, QueueName, Role, RunId, ToolError, ToolId, UserId, WorkerId, new_prefixed_id,
    normalize_relative_path,
};
use tr_runner::config::{
    DEFAULT_LEASE_TTL_MS, DEFAULT_MAX_CONCURRENCY, DEFAULT_MAX_POLL_MS, DEFAULT_POLL_MS,
    DEFAULT_STORAGE_DIRNAME, default_runs_dir,
};
use tr_runner::executor::INPUT_DIR;
use tr_runner::{CommandExecutor, RunnerError, Worker, WorkerConfig, logging, now_ms};
use tr_storage::{
    AcquireDraftLockCommand, DEFAULT_DRAFT_LOCK_TTL_MS, DraftLockAcquireRequest,
    DraftLockReleaseRequest, EnqueueRunRequest, ReleaseDraftLockCommand, RunCreateRequest,
    SqliteStore, ToolRegisterRequest,
};

#[derive(Parser)]
#[command(name = "tr_runner", version, about = "Sandboxed tool-run worker and queue tools")]
struct Cli {
    #[arg(long, global = true, env = "TR_STORAGE_DIR", default_value = DEFAULT_STORAGE_DIRNAME)]
    storage_dir: PathBuf,
    /// Root of per-run directories [default: <storage-dir>/runs].
    #[arg(long, global = true, env = "TR_RUNS_DIR")]
    runs_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn runs_dir(&self) -> PathBuf {
        self.runs_dir
            .clone()
            .unwrap_or_else(|| default_runs_dir(&self.storage_dir))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Poll a queue and execute jobs.
    Worker(WorkerArgs),
    /// Create a run and queue its job.
    Enqueue(EnqueueArgs),
    /// Requeue jobs with expired leases and drop expired draft locks.
    Sweep,
    Status {
        #[arg(long, env = "TR_QUEUE", default_value = QueueName::DEFAULT)]
        queue: String,
    },
    /// Register a tool or move its draft head.
    RegisterTool {
        #[arg(long)]
        tool_id: String,
        #[arg(long)]
        draft_head_id: String,
    },
    /// Acquire or release a tool's draft lock.
    DraftLock {
        #[command(subcommand)]
        command: DraftLockCommands,
    },
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(long, env = "TR_QUEUE", default_value = QueueName::DEFAULT)]
    queue: String,
    #[arg(long, env = "TR_WORKER_ID")]
    worker_id: Option<String>,
    #[arg(long)]
    once: bool,
    #[arg(long, env = "TR_MAX_CONCURRENCY", default_value_t = DEFAULT_MAX_CONCURRENCY)]
    max_concurrency: usize,
    #[arg(long, env = "TR_POLL_MS", default_value_t = DEFAULT_POLL_MS)]
    poll_ms: u64,
    #[arg(long, env = "TR_MAX_POLL_MS", default_value_t = DEFAULT_MAX_POLL_MS)]
    max_poll_ms: u64,
    #[arg(long, env = "TR_LEASE_TTL_MS", default_value_t = DEFAULT_LEASE_TTL_MS)]
    lease_ttl_ms: u64,
    /// [default: lease-ttl-ms / 3]
    #[arg(long, env = "TR_HEARTBEAT_MS")]
    heartbeat_ms: Option<u64>,
    /// Program and arguments run for every job.
    #[arg(
        long,
        env = "TR_SANDBOX_CMD",
        required = true,
        num_args = 1..,
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    sandbox_cmd: Vec<String>,
}

#[derive(Args)]
struct EnqueueArgs {
    #[arg(long)]
    tool_id: String,
    #[arg(long)]
    tool_version_id: String,
    #[arg(long, env = "TR_QUEUE", default_value = QueueName::DEFAULT)]
    queue: String,
    #[arg(long)]
    run_id: Option<String>,
    /// Execution context as a JSON object.
    #[arg(long, default_value = "{}")]
    context: String,
    #[arg(long, default_value = "{}")]
    memory: String,
    /// Local file copied into the run's input directory. Repeatable.
    #[arg(long = "input")]
    inputs: Vec<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Viewer,
    Editor,
    Maintainer,
    Admin,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Viewer => Role::Viewer,
            RoleArg::Editor => Role::Editor,
            RoleArg::Maintainer => Role::Maintainer,
            RoleArg::Admin => Role::Admin,
        }
    }
}

#[derive(Args)]
struct ActorArgs {
    #[arg(long, env = "TR_USER")]
    user: String,
    #[arg(long, value_enum, env = "TR_ROLE", default_value = "editor")]
    role: RoleArg,
}

impl ActorArgs {
    fn actor(&self) -> Result<Actor, RunnerError> {
        Ok(Actor::new(UserId::try_new(self.user.as_str())?, self.role.into()))
    }
}

#[derive(Subcommand)]
enum DraftLockCommands {
    Acquire {
        #[arg(long)]
        tool_id: String,
        #[arg(long)]
        draft_head_id: String,
        /// Take over a lock held by someone else (maintainer/admin only).
        #[arg(long)]
        force: bool,
        #[arg(long, default_value_t = DEFAULT_DRAFT_LOCK_TTL_MS)]
        ttl_ms: u64,
        #[command(flatten)]
        actor: ActorArgs,
    },
    Release {
        #[arg(long)]
        tool_id: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
}

#[derive(Serialize)]
struct EnqueueReport {
    run_id: String,
    job_id: String,
    queue: String,
    input_files: Vec<String>,
}

fn main() -> ExitCode {
    logging::init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            let code = err.kind().code();
            let tool_err = ToolError::from(err);
            print_json(&json!({
                "error": { "code": code, "message": tool_err.to_string() }
            }));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), RunnerError> {
    let runs_dir = cli.runs_dir();
    match cli.command {
        Commands::Worker(args) => run_worker(cli.storage_dir, runs_dir, args),
        Commands::Enqueue(args) => enqueue(&cli.storage_dir, &runs_dir, args),
        Commands::Sweep => {
            let mut store = SqliteStore::open(&cli.storage_dir)?;
            let now = now_ms();
            let requeued = store.jobs_clear_stale_leases(now)?;
            let locks_deleted = store.draft_locks_delete_expired(now)?;
            print_json(&json!({ "requeued_jobs": requeued, "deleted_draft_locks": locks_deleted }));
            Ok(())
        }
        Commands::Status { queue } => {
            let queue = QueueName::try_new(queue)?;
            let store = SqliteStore::open(&cli.storage_dir)?;
            let counts = store.jobs_status_counts(&queue)?;
            print_json(&json!({
                "queue": queue.as_str(),
                "queued": counts.queued,
                "claimed": counts.claimed,
                "running": counts.running,
                "succeeded": counts.succeeded,
                "failed": counts.failed,
            }));
            Ok(())
        }
        Commands::RegisterTool {
            tool_id,
            draft_head_id,
        } => {
            let mut store = SqliteStore::open(&cli.storage_dir)?;
            let tool = store.tool_register(ToolRegisterRequest {
                tool_id: ToolId::try_new(tool_id)?,
                draft_head_id,
                now_ms: now_ms(),
            })?;
            print_json(&json!({ "tool_id": tool.id, "draft_head_id": tool.draft_head_id }));
            Ok(())
        }
        Commands::DraftLock { command } => draft_lock(&cli.storage_dir, command),
    }
}

fn run_worker(storage_dir: PathBuf, runs_dir: PathBuf, args: WorkerArgs) -> Result<(), RunnerError> {
    let executor = CommandExecutor::new(args.sandbox_cmd)
        .ok_or_else(|| RunnerError::Config("sandbox command must not be empty".to_string()))?;
    let mut config = WorkerConfig::new(storage_dir);
    config.runs_dir = runs_dir;
    config.queue = QueueName::try_new(args.queue)?;
    if let Some(worker_id) = args.worker_id {
        config.worker_id = WorkerId::try_new(worker_id)?;
    }
    config.once = args.once;
    config.max_concurrency = args.max_concurrency;
    config.poll_ms = args.poll_ms;
    config.max_poll_ms = args.max_poll_ms;
    config.lease_ttl_ms = args.lease_ttl_ms;
    config.heartbeat_ms = args.heartbeat_ms.unwrap_or(0);

    let mut worker = Worker::new(config, Arc::new(executor))?;
    let summary = worker.run()?;
    if worker.config().once {
        print_json(&json!({
            "claimed": summary.claimed,
            "succeeded": summary.succeeded,
            "failed": summary.failed,
            "settled": summary.settled,
            "abandoned": summary.abandoned,
        }));
    }
    Ok(())
}

fn enqueue(storage_dir: &Path, runs_dir: &Path, args: EnqueueArgs) -> Result<(), RunnerError> {
    let context = parse_json_arg("context", &args.context)?;
    if !context.is_object() {
        return Err(RunnerError::Config("--context must be a JSON object".to_string()));
    }
    let memory = parse_json_arg("memory", &args.memory)?;
    let run_id = match args.run_id {
        Some(raw) => RunId::try_new(raw)?,
        None => RunId::try_new(new_prefixed_id("RUN"))?,
    };
    let queue = QueueName::try_new(args.queue)?;

    let mut store = SqliteStore::open(storage_dir)?;
    if store.run_get(&run_id)?.is_some() {
        return Err(tr_storage::StoreError::RunAlreadyExists {
            run_id: run_id.into_string(),
        }
        .into());
    }

    let input_dir = runs_dir.join(run_id.as_str()).join(INPUT_DIR);
    let mut input_files = Vec::with_capacity(args.inputs.len());
    for source in &args.inputs {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RunnerError::Config(format!("bad input path: {}", source.display())))?;
        let name = normalize_relative_path(name)
            .map_err(|e| RunnerError::Config(format!("bad input file name: {e}")))?;
        std::fs::create_dir_all(&input_dir)
            .map_err(|e| RunnerError::io(format!("create {}", input_dir.display()), e))?;
        std::fs::copy(source, input_dir.join(&name))
            .map_err(|e| RunnerError::io(format!("copy {}", source.display()), e))?;
        input_files.push(name);
    }

    let result = store.enqueue_run(EnqueueRunRequest {
        run: RunCreateRequest {
            run_id: Some(run_id),
            tool_id: ToolId::try_new(args.tool_id)?,
            tool_version_id: args.tool_version_id,
            context,
            input_files,
            memory,
            now_ms: now_ms(),
        },
        queue,
    })?;
    tracing::info!(run_id = %result.run.id, job_id = %result.job.id, "enqueued run");
    print_json(&EnqueueReport {
        run_id: result.run.id,
        job_id: result.job.id,
        queue: result.job.queue,
        input_files: result.run.input_files,
    });
    Ok(())
}

fn draft_lock(storage_dir: &Path, command: DraftLockCommands) -> Result<(), RunnerError> {
    let mut store = SqliteStore::open(storage_dir)?;
    match command {
        DraftLockCommands::Acquire {
            tool_id,
            draft_head_id,
            force,
            ttl_ms,
            actor,
        } => {
            let view = store.draft_lock_acquire(DraftLockAcquireRequest {
                actor: actor.actor()?,
                command: AcquireDraftLockCommand {
                    tool_id: ToolId::try_new(tool_id)?,
                    draft_head_id,
                    force,
                },
                now_ms: now_ms(),
                ttl_ms,
            })?;
            print_json(&view.to_json());
        }
        DraftLockCommands::Release { tool_id, actor } => {
            let released = store.draft_lock_release(DraftLockReleaseRequest {
                actor: actor.actor()?,
                command: ReleaseDraftLockCommand {
                    tool_id: ToolId::try_new(tool_id)?,
                },
                now_ms: now_ms(),
            })?;
            print_json(&released.to_json());
        }
    }
    Ok(())
}

fn parse_json_arg(field: &'static str, raw: &str) -> Result<Value, RunnerError> {
    serde_json::from_str(raw).map_err(|source| RunnerError::Json { field, source })
}

fn print_json(value: &impl Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("failed to encode output: {err}"),
    }
}
