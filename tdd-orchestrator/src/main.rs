//! Operator CLI for the TDD orchestrator.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tdd_orchestrator::circuit_breaker::CircuitBreakerRegistry;
use tdd_orchestrator::config::{load_config, OrchestratorConfig};
use tdd_orchestrator::database::Database;
use tdd_orchestrator::ingest::{ingest_tasks, load_task_file, IngestOptions};
use tdd_orchestrator::logging;
use tdd_orchestrator::metrics::MetricsCollector;
use tdd_orchestrator::models::TaskFilter;
use tdd_orchestrator::pipeline::Collaborators;
use tdd_orchestrator::{collaborators_from_config, Orchestrator};
use tdd_orchestrator_sdk::{BreakerLevel, CircuitState, EventBus, TaskStatus};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "tdd-orchestrator",
    version,
    about = "Run decomposed tasks through RED/GREEN/VERIFY with parallel workers"
)]
struct Cli {
    /// Configuration file (TOML); defaults apply when it does not exist
    #[arg(long, env = "TDD_ORCHESTRATOR_CONFIG", default_value = "tdd-orchestrator.toml")]
    config: PathBuf,

    /// Database path, overriding the configuration
    #[arg(long, env = "TDD_ORCHESTRATOR_DB")]
    db: Option<PathBuf>,

    /// Project the generated code lives in
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a YAML task batch into the store.
    Ingest {
        file: PathBuf,
        /// Fail if the batch contains a dependency cycle.
        #[arg(long)]
        reject_cycles: bool,
    },
    /// Run every phase with outstanding work.
    Run {
        /// Reclaim stale claims left by a previous session first.
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        max_invocations: Option<u64>,
        #[arg(long)]
        no_phase_gates: bool,
        /// Use no-op collaborators: nothing is generated, executed or committed.
        #[arg(long)]
        dry_run: bool,
    },
    /// Task counts, progress and breaker state.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List tasks.
    List {
        #[arg(long)]
        phase: Option<i64>,
        /// Storage status, e.g. `pending` or `blocked-static-review`
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Reset a failed task to pending.
    Retry { task_key: String },
    /// Force breakers closed: one scope, or every scope of a level.
    ResetBreaker {
        level: String,
        identifier: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    logging::init("info");

    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if let Some(db) = &cli.db {
        config.db_path = Some(db.clone());
    }
    let db = Database::open(config.resolved_db_path()?)?;

    match cli.command {
        Command::Ingest {
            file,
            reject_cycles,
        } => cmd_ingest(&db, file, reject_cycles),
        Command::Run {
            resume,
            workers,
            max_invocations,
            no_phase_gates,
            dry_run,
        } => {
            if let Some(workers) = workers {
                config.pool.max_workers = workers;
            }
            if let Some(limit) = max_invocations {
                config.pool.max_invocations_per_session = limit;
            }
            if no_phase_gates {
                config.pool.enable_phase_gates = false;
            }
            config.validate()?;
            cmd_run(db, &config, cli.project_dir, resume, dry_run).await
        }
        Command::Status { json } => cmd_status(&db, &config, json),
        Command::List {
            phase,
            status,
            json,
        } => cmd_list(&db, phase, status, json),
        Command::Retry { task_key } => {
            let task = db.retry_task(&task_key)?;
            println!(
                "{} reset to {} (retry #{})",
                task.task_key, task.status, task.retry_count
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::ResetBreaker { level, identifier } => {
            cmd_reset_breaker(db, &config, &level, identifier.as_deref())
        }
    }
}

fn cmd_ingest(db: &Database, file: PathBuf, reject_cycles: bool) -> Result<ExitCode> {
    let specs = load_task_file(&file)?;
    let report = ingest_tasks(db, &specs, &IngestOptions { reject_cycles })?;
    println!("ingested {} task(s)", report.inserted);
    if !report.verify_only.is_empty() {
        println!("verify-only: {}", report.verify_only.join(", "));
    }
    if !report.cycles.is_empty() {
        println!("WARNING dependency cycle (never ready): {}", report.cycles.join(", "));
    }
    for (task, dep) in &report.unknown_dependencies {
        println!("WARNING {task} depends on unknown task {dep} (treated as satisfied)");
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_run(
    db: Database,
    config: &OrchestratorConfig,
    project_dir: PathBuf,
    resume: bool,
    dry_run: bool,
) -> Result<ExitCode> {
    let project_dir = project_dir
        .canonicalize()
        .with_context(|| format!("resolve project dir {}", project_dir.display()))?;
    let collaborators = if dry_run {
        Collaborators::no_op()
    } else {
        collaborators_from_config(config, &project_dir)
    };

    let bus = EventBus::new();
    let metrics = MetricsCollector::spawn(&bus);
    let orchestrator = Orchestrator::new(db, config, collaborators, bus, project_dir)?;
    let result = orchestrator.run(resume).await?;
    let snapshot = metrics.finish();

    println!(
        "run {}: {} completed, {} failed, {} invocation(s), stopped: {}",
        result.run_id,
        result.tasks_completed,
        result.tasks_failed,
        result.total_invocations,
        result.stopped_reason
    );
    if let Some(gate) = &result.gate_failure {
        println!(
            "phase {} gate: {}",
            gate.phase,
            gate.reason.as_deref().unwrap_or("failed")
        );
    }
    for worker in &result.worker_stats {
        println!(
            "  {}: {} completed, {} failed, {} invocation(s)",
            worker.worker_id, worker.tasks_completed, worker.tasks_failed, worker.invocations
        );
    }
    info!(metrics = %serde_json::to_string(&snapshot)?, "run metrics");

    Ok(if result.stopped_reason.is_fatal() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

#[derive(Serialize)]
struct StatusView {
    stats: tdd_orchestrator::models::TaskStats,
    progress: tdd_orchestrator::models::Progress,
    latest_run: Option<tdd_orchestrator::models::ExecutionRun>,
    breakers: Vec<tdd_orchestrator::models::BreakerRecord>,
}

fn cmd_status(db: &Database, config: &OrchestratorConfig, json: bool) -> Result<ExitCode> {
    let breakers =
        CircuitBreakerRegistry::new(db.clone(), config.breakers.clone(), EventBus::new())?;
    let view = StatusView {
        stats: db.get_stats()?,
        progress: db.get_progress()?,
        latest_run: db.get_latest_run()?,
        breakers: breakers
            .snapshot()?
            .into_iter()
            .filter(|b| b.state != CircuitState::Closed)
            .collect(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(ExitCode::SUCCESS);
    }

    let p = &view.progress;
    println!(
        "{}/{} done ({:.1}%), {} failed, {} running, {} pending",
        p.completed, p.total, p.percent_complete, p.failed, p.in_progress, p.pending
    );
    let s = &view.stats;
    println!(
        "  complete {}  passing {}  blocked {}  blocked-static-review {}  failed {}",
        s.complete, s.passing, s.blocked, s.blocked_static_review, s.failed
    );
    if let Some(run) = &view.latest_run {
        println!(
            "latest run {} {} (validation: {})",
            run.id,
            run.status.as_str(),
            run.validation_status.as_deref().unwrap_or("-")
        );
    }
    for breaker in &view.breakers {
        println!(
            "breaker {}:{} {} (failures {})",
            breaker.level, breaker.identifier, breaker.state, breaker.failure_count
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_list(
    db: &Database,
    phase: Option<i64>,
    status: Option<String>,
    json: bool,
) -> Result<ExitCode> {
    let status = status
        .map(|s| s.parse::<TaskStatus>())
        .transpose()?;
    let tasks = db.list_tasks(&TaskFilter { phase, status })?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(ExitCode::SUCCESS);
    }
    for task in &tasks {
        println!(
            "{:<10} p{:<3} s{:<3} {:<8} {:<22} {}",
            task.task_key,
            task.phase,
            task.sequence,
            task.status.external_label(),
            task.status,
            task.title
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_reset_breaker(
    db: Database,
    config: &OrchestratorConfig,
    level: &str,
    identifier: Option<&str>,
) -> Result<ExitCode> {
    let level: BreakerLevel = level.parse()?;
    let breakers = CircuitBreakerRegistry::new(db, config.breakers.clone(), EventBus::new())?;
    match identifier {
        Some(id) => {
            if breakers.get(level, id)?.is_none() {
                bail!("no {level} breaker named '{id}'");
            }
            breakers.reset(level, id)?;
            println!("reset {level}:{id}");
        }
        None => {
            let count = breakers.reset_level(level)?;
            println!("reset {count} {level} breaker(s)");
        }
    }
    Ok(ExitCode::SUCCESS)
}
