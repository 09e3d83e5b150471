//! Phase-by-phase scheduler over a fixed pool of workers.
//!
//! `run_all_phases` walks the phases that still have work in ascending
//! order. Each phase is guarded by the phase gate and worked by
//! `max_workers` concurrent workers (`FuturesUnordered`, same task, so the
//! pipeline futures need not be `'static`). Run-level halts are reported as a
//! [`StopReason`], never as errors.

mod worker;

pub use worker::Worker;

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;
use tdd_orchestrator_sdk::{
    log_phase_complete, log_phase_start, EventBus, OrchestratorEvent, TaskStatus,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::PoolConfig;
use crate::database::Database;
use crate::error::OrchestratorError;
use crate::models::{RunStatus, TaskFilter};
use crate::phase_gate::{GateResult, PhaseGateValidator};
use crate::pipeline::{Collaborators, PipelineEngine};
use crate::validation::{RunValidator, ValidationReport};

/// Why a worker, phase or run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NoTasks,
    TaskFailure,
    InvocationLimit,
    GateFailure,
    CircuitOpen,
    ValidationFailure,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::NoTasks => "no_tasks",
            StopReason::TaskFailure => "task_failure",
            StopReason::InvocationLimit => "invocation_limit",
            StopReason::GateFailure => "gate_failure",
            StopReason::CircuitOpen => "circuit_open",
            StopReason::ValidationFailure => "validation_failure",
        }
    }

    /// Everything except `no_tasks` halts the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StopReason::NoTasks)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub invocations: u64,
}

impl WorkerStats {
    fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: i64,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub invocations: u64,
    pub stopped_reason: StopReason,
    pub worker_stats: Vec<WorkerStats>,
    /// Pending tasks left behind by a dependency that never finished.
    pub stranded_tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub total_invocations: u64,
    /// `no_tasks` when every phase ran to completion.
    pub stopped_reason: StopReason,
    pub phases_run: Vec<i64>,
    pub gate_failure: Option<GateResult>,
    pub validation: Option<ValidationReport>,
    /// Per-worker statistics of the final phase processed.
    pub worker_stats: Vec<WorkerStats>,
    pub stranded_tasks: Vec<String>,
}

impl RunResult {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            tasks_completed: 0,
            tasks_failed: 0,
            total_invocations: 0,
            stopped_reason: StopReason::NoTasks,
            phases_run: Vec::new(),
            gate_failure: None,
            validation: None,
            worker_stats: Vec::new(),
            stranded_tasks: Vec::new(),
        }
    }
}

/// State shared by the workers of one phase.
#[derive(Clone)]
pub(crate) struct PoolContext {
    pub(crate) db: Database,
    pub(crate) pipeline: Arc<PipelineEngine>,
    pub(crate) breakers: Arc<CircuitBreakerRegistry>,
    pub(crate) bus: EventBus,
    pub(crate) config: PoolConfig,
    pub(crate) run_id: Uuid,
    /// Set by the first worker that hits a fatal condition.
    pub(crate) halted: Arc<AtomicBool>,
    /// Workers currently inside a pipeline run.
    pub(crate) busy: Arc<AtomicUsize>,
    pub(crate) budget_warned: Arc<AtomicBool>,
}

pub struct WorkerPool {
    db: Database,
    pipeline: Arc<PipelineEngine>,
    breakers: Arc<CircuitBreakerRegistry>,
    gate: PhaseGateValidator,
    validator: RunValidator,
    bus: EventBus,
    config: PoolConfig,
    budget_warned: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(
        db: Database,
        pipeline: Arc<PipelineEngine>,
        breakers: Arc<CircuitBreakerRegistry>,
        collaborators: &Collaborators,
        bus: EventBus,
        config: PoolConfig,
    ) -> Self {
        Self {
            gate: PhaseGateValidator::new(db.clone(), collaborators.runner.clone()),
            validator: RunValidator::new(db.clone(), collaborators.runner.clone()),
            db,
            pipeline,
            breakers,
            bus,
            config,
            budget_warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run every phase with outstanding work, in ascending order.
    #[instrument(skip(self))]
    pub async fn run_all_phases(&self, resume: bool) -> Result<RunResult> {
        let run_id = self.db.start_run(self.config.max_workers)?;
        self.bus.publish(OrchestratorEvent::RunStarted {
            run_id: run_id.to_string(),
            max_workers: self.config.max_workers,
        });
        let mut result = RunResult::new(run_id);

        let phases = self.db.get_pending_phases()?;
        info!(phases = ?phases, "starting run");

        for (idx, &phase) in phases.iter().enumerate() {
            if idx == 0 && (resume || self.config.cleanup_stale_on_start) {
                let recovered = self
                    .db
                    .cleanup_stale_claims(self.config.heartbeat_timeout())?;
                if recovered > 0 {
                    self.bus
                        .publish(OrchestratorEvent::StaleClaimsRecovered { count: recovered });
                }
            }

            if self.config.enable_phase_gates {
                let gate = self.gate.validate_phase(phase).await?;
                if !gate.passed {
                    let reason = gate.reason.clone().unwrap_or_default();
                    warn!(
                        "{}",
                        OrchestratorError::PhaseGateFailure {
                            phase,
                            reason: reason.clone()
                        }
                    );
                    self.bus
                        .publish(OrchestratorEvent::PhaseGateFailed { phase, reason });
                    result.stopped_reason = StopReason::GateFailure;
                    result.gate_failure = Some(gate);
                    break;
                }
            }

            log_phase_start!(self.bus, phase, phases.len());
            let phase_result = self.run_parallel_phase(phase, run_id).await?;
            log_phase_complete!(
                self.bus,
                phase,
                phase_result.tasks_completed,
                phase_result.tasks_failed
            );

            result.phases_run.push(phase);
            result.tasks_completed += phase_result.tasks_completed;
            result.tasks_failed += phase_result.tasks_failed;
            result.worker_stats = phase_result.worker_stats;
            result.stranded_tasks.extend(phase_result.stranded_tasks);
            if phase_result.stopped_reason.is_fatal() {
                warn!(phase, reason = %phase_result.stopped_reason, "halting run");
                result.stopped_reason = phase_result.stopped_reason;
                break;
            }
        }

        if !result.stopped_reason.is_fatal() && self.config.run_end_validation {
            let report = self.validator.validate_run(run_id).await?;
            if !report.passed {
                warn!(
                    "{}",
                    OrchestratorError::ValidationFailure(report.failed_files.join(", "))
                );
                result.stopped_reason = StopReason::ValidationFailure;
            }
            result.validation = Some(report);
        }

        result.total_invocations = self.db.count_invocations(run_id)?;
        let status = if result.stopped_reason.is_fatal() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        self.db.complete_run(run_id, status)?;
        self.bus.publish(OrchestratorEvent::RunCompleted {
            run_id: run_id.to_string(),
            status: status.as_str().to_string(),
            stopped_reason: Some(result.stopped_reason.as_str().to_string()),
        });
        info!(
            completed = result.tasks_completed,
            failed = result.tasks_failed,
            invocations = result.total_invocations,
            reason = %result.stopped_reason,
            "run finished"
        );
        Ok(result)
    }

    /// Work one phase with `max_workers` concurrent workers.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn run_parallel_phase(&self, phase: i64, run_id: Uuid) -> Result<PhaseResult> {
        let ctx = PoolContext {
            db: self.db.clone(),
            pipeline: self.pipeline.clone(),
            breakers: self.breakers.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            run_id,
            halted: Arc::new(AtomicBool::new(false)),
            busy: Arc::new(AtomicUsize::new(0)),
            budget_warned: self.budget_warned.clone(),
        };

        let mut workers = FuturesUnordered::new();
        for n in 1..=self.config.max_workers {
            let mut worker = Worker::new(format!("worker-{n}"), ctx.clone());
            workers.push(async move {
                worker.start().await?;
                let reason = worker.run_phase(phase).await;
                worker.stop().await;
                reason.map(|reason| (reason, worker.stats().clone()))
            });
        }

        let mut result = PhaseResult {
            phase,
            tasks_completed: 0,
            tasks_failed: 0,
            invocations: 0,
            stopped_reason: StopReason::NoTasks,
            worker_stats: Vec::new(),
            stranded_tasks: Vec::new(),
        };
        let mut first_error = None;
        while let Some(outcome) = workers.next().await {
            match outcome {
                Ok((reason, stats)) => {
                    result.tasks_completed += stats.tasks_completed;
                    result.tasks_failed += stats.tasks_failed;
                    result.invocations += stats.invocations;
                    if reason.is_fatal() && !result.stopped_reason.is_fatal() {
                        result.stopped_reason = reason;
                    }
                    result.worker_stats.push(stats);
                }
                Err(e) => {
                    // let the other workers wind down before surfacing it
                    ctx.halted.store(true, std::sync::atomic::Ordering::SeqCst);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        result.worker_stats.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        if result.stopped_reason == StopReason::NoTasks {
            match self.report_stranded(phase) {
                Ok(keys) => result.stranded_tasks = keys,
                Err(e) => warn!(phase, "could not list stranded tasks: {e:#}"),
            }
        }
        Ok(result)
    }

    /// Pending tasks the phase drained without reaching because a
    /// dependency ended blocked or failed.
    fn report_stranded(&self, phase: i64) -> Result<Vec<String>> {
        let pending = self.db.list_tasks(&TaskFilter {
            phase: Some(phase),
            status: Some(TaskStatus::Pending),
        })?;
        let mut stranded = Vec::new();
        for task in pending {
            let unmet = self.db.unmet_dependencies(&task.task_key)?;
            if unmet.is_empty() {
                continue;
            }
            let err = OrchestratorError::DependencyUnmet {
                task_key: task.task_key.clone(),
                unmet,
            };
            warn!(phase, "{err}");
            stranded.push(task.task_key);
        }
        Ok(stranded)
    }
}
