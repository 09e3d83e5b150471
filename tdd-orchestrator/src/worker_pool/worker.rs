//! A single pool worker: heartbeat timer plus the claim -> pipeline -> update loop.

use anyhow::Result;
use std::sync::atomic::Ordering;
use tdd_orchestrator_sdk::{
    log_task_claimed, log_task_complete, log_task_failed, BreakerLevel, OrchestratorEvent,
    TaskStatus,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::{PoolContext, StopReason, WorkerStats};
use crate::circuit_breaker::SYSTEM_IDENTIFIER;
use crate::error::OrchestratorError;
use crate::pipeline::TaskOutcome;

pub struct Worker {
    id: String,
    ctx: PoolContext,
    heartbeat: Option<JoinHandle<()>>,
    stats: WorkerStats,
}

impl Worker {
    pub(crate) fn new(id: impl Into<String>, ctx: PoolContext) -> Self {
        let id = id.into();
        Self {
            stats: WorkerStats::new(&id),
            id,
            ctx,
            heartbeat: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Register with the store and start the heartbeat timer. The worker's
    /// branch is prepared by the pipeline at the start of every task.
    pub async fn start(&mut self) -> Result<()> {
        self.ctx.db.register_worker(&self.id, self.ctx.run_id)?;

        let db = self.ctx.db.clone();
        let id = self.id.clone();
        let period = self.ctx.config.heartbeat_interval();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick completes immediately; registration already stamped us
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = db.touch_worker_heartbeat(&id) {
                    warn!(worker_id = %id, "heartbeat failed: {e:#}");
                }
            }
        }));
        debug!(worker_id = %self.id, "worker started");
        Ok(())
    }

    /// Cancel the heartbeat timer and mark the worker idle.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(worker_id = %self.id, "heartbeat task ended abnormally: {e}"),
            }
        }
        if let Err(e) = self.ctx.db.set_worker_idle(&self.id) {
            warn!(worker_id = %self.id, "could not mark worker idle: {e:#}");
        }
    }

    /// Work `phase` until nothing is left or a halt condition is hit.
    #[instrument(skip(self), fields(worker_id = %self.id))]
    pub async fn run_phase(&mut self, phase: i64) -> Result<StopReason> {
        loop {
            if self.ctx.halted.load(Ordering::SeqCst) {
                return Ok(StopReason::NoTasks);
            }
            if let Some(reason) = self.check_halt_conditions()? {
                self.ctx.halted.store(true, Ordering::SeqCst);
                return Ok(reason);
            }

            let Some(task) = self.ctx.db.get_next_ready_task(Some(phase))? else {
                if self.ctx.busy.load(Ordering::SeqCst) == 0 {
                    return Ok(StopReason::NoTasks);
                }
                // peers may still unlock dependents
                tokio::time::sleep(self.ctx.config.idle_poll_interval()).await;
                continue;
            };

            self.ctx.busy.fetch_add(1, Ordering::SeqCst);
            let result = self.work_task(&task.task_key, phase).await;
            self.ctx.busy.fetch_sub(1, Ordering::SeqCst);

            match result? {
                Some(outcome) if !outcome.is_success() && self.ctx.config.halt_on_task_failure => {
                    self.ctx.halted.store(true, Ordering::SeqCst);
                    return Ok(StopReason::TaskFailure);
                }
                _ => {}
            }
        }
    }

    /// Budget and system breaker checks, made before every dispatch.
    fn check_halt_conditions(&self) -> Result<Option<StopReason>> {
        let ctx = &self.ctx;
        let budget = ctx.db.check_invocation_budget(
            ctx.run_id,
            ctx.config.max_invocations_per_session,
            ctx.config.budget_warning_threshold,
        )?;
        if budget.is_exhausted() {
            let err = OrchestratorError::BudgetExceeded {
                count: budget.count,
                limit: budget.limit,
            };
            warn!("{err}, halting");
            ctx.bus.publish(OrchestratorEvent::BudgetExhausted {
                run_id: ctx.run_id.to_string(),
                count: budget.count,
                limit: budget.limit,
            });
            return Ok(Some(StopReason::InvocationLimit));
        }
        if budget.is_warning && !ctx.budget_warned.swap(true, Ordering::SeqCst) {
            ctx.bus.publish(OrchestratorEvent::BudgetWarning {
                run_id: ctx.run_id.to_string(),
                count: budget.count,
                limit: budget.limit,
            });
        }

        if ctx
            .breakers
            .is_rejecting(BreakerLevel::System, SYSTEM_IDENTIFIER)?
        {
            warn!("system circuit open, halting");
            return Ok(Some(StopReason::CircuitOpen));
        }
        Ok(None)
    }

    /// Claim and run one task. `None` when another worker won the claim.
    async fn work_task(&mut self, task_key: &str, phase: i64) -> Result<Option<TaskOutcome>> {
        let ctx = self.ctx.clone();
        if !ctx.db.claim_task(task_key, &self.id)? {
            debug!("{}", OrchestratorError::ClaimConflict(task_key.to_string()));
            return Ok(None);
        }
        // re-read so the pipeline sees the claimed row
        let Some(task) = ctx.db.get_task(task_key)? else {
            return Err(OrchestratorError::TaskNotFound(task_key.to_string()).into());
        };
        log_task_claimed!(ctx.bus, task.task_key, self.id);
        ctx.db.update_worker_heartbeat(&self.id, Some(&task.task_key))?;
        info!(task_key = %task.task_key, phase, "task claimed");

        let outcome = match ctx.pipeline.run_task(&task, &self.id, ctx.run_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_key = %task.task_key, "pipeline error: {e:#}");
                TaskOutcome {
                    task_key: task.task_key.clone(),
                    status: TaskStatus::Failed,
                    reason: Some(format!("internal error: {e:#}")),
                    pre_implemented: false,
                    invocations: 0,
                }
            }
        };

        ctx.db.update_task_status(&task.task_key, outcome.status)?;
        ctx.db.update_worker_heartbeat(&self.id, None)?;

        self.stats.invocations += u64::from(outcome.invocations);
        if outcome.is_success() {
            self.stats.tasks_completed += 1;
            log_task_complete!(ctx.bus, task.task_key, self.id, outcome.status);
        } else {
            self.stats.tasks_failed += 1;
            let reason = outcome
                .reason
                .clone()
                .unwrap_or_else(|| outcome.status.to_string());
            log_task_failed!(ctx.bus, task.task_key, self.id, reason);
        }
        Ok(Some(outcome))
    }
}
