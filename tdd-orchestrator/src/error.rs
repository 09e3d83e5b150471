//! Error taxonomy for conditions callers branch on.
//!
//! Plumbing (SQL, filesystem, subprocess spawning) propagates as
//! `anyhow::Error` with context. The variants here are the orchestration-level
//! conditions an operator surface or the scheduler needs to tell apart.

use tdd_orchestrator_sdk::{BreakerLevel, TaskStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("task '{0}' not found")]
    TaskNotFound(String),

    /// `retry_task` on a task that is not in a failed terminal status.
    #[error("task '{task_key}' cannot be retried from status '{status}'")]
    RetryConflict { task_key: String, status: TaskStatus },

    #[error("task '{task_key}' has unmet dependencies: {}", .unmet.join(", "))]
    DependencyUnmet { task_key: String, unmet: Vec<String> },

    /// Another worker won the claim race. Recovered by re-querying.
    #[error("task '{0}' was claimed by another worker")]
    ClaimConflict(String),

    #[error("circuit open at {level} scope '{identifier}'")]
    CircuitOpen {
        level: BreakerLevel,
        identifier: String,
    },

    #[error("invocation budget exhausted ({count}/{limit})")]
    BudgetExceeded { count: u64, limit: u64 },

    #[error("phase gate failed for phase {phase}: {reason}")]
    PhaseGateFailure { phase: i64, reason: String },

    #[error("end-of-run validation failed: {0}")]
    ValidationFailure(String),

    #[error("stale claim on task '{task_key}' held by worker '{worker_id}'")]
    StaleClaim { task_key: String, worker_id: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
