//! Shared vocabulary for the TDD orchestrator.
//!
//! This crate holds everything the orchestration engine and its external
//! collaborators need to agree on:
//!
//! - Closed status/stage enums with explicit string mappings ([`TaskStatus`],
//!   [`TaskType`], [`Stage`], [`BreakerLevel`], [`CircuitState`])
//! - Collaborator traits ([`CodeAgent`], [`ProcessRunner`], [`StaticReviewer`],
//!   [`VcsCoordinator`]) and their no-op implementations
//! - Structured orchestration events ([`OrchestratorEvent`]) and the
//!   [`EventBus`] that carries them to observational sinks

pub mod collaborators;
pub mod events;

pub use collaborators::{
    AgentRequest, CodeAgent, Issue, NoOpAgent, NoOpReviewer, NoOpRunner, NoOpVcs,
    ProcessRunner, ReviewResult, RunOutcome, StaticReviewer, VcsCoordinator, VerifyResult,
    Violation,
};
pub use events::{EventBus, OrchestratorEvent};

// Re-export async trait for collaborator implementations
pub use async_trait::async_trait;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A string that does not name any variant of one of the closed enums below.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ============================================================================
// Task Status
// ============================================================================

/// Lifecycle status of a task.
///
/// Transitions are monotonic within a cycle:
/// `pending -> in_progress -> {passing | complete | blocked | blocked-static-review | failed}`.
/// Only an explicit retry moves a failed terminal status back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "passing")]
    Passing,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "blocked")]
    Blocked,
    #[serde(rename = "blocked-static-review")]
    BlockedStaticReview,
    #[serde(rename = "failed")]
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Passing,
        TaskStatus::Complete,
        TaskStatus::Blocked,
        TaskStatus::BlockedStaticReview,
        TaskStatus::Failed,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Passing => "passing",
            TaskStatus::Complete => "complete",
            TaskStatus::Blocked => "blocked",
            TaskStatus::BlockedStaticReview => "blocked-static-review",
            TaskStatus::Failed => "failed",
        }
    }

    /// Presentation vocabulary used by list/status surfaces.
    ///
    /// Total over every variant: adding a status without extending this match
    /// is a compile error.
    pub fn external_label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "running",
            TaskStatus::Passing | TaskStatus::Complete => "done",
            TaskStatus::Blocked | TaskStatus::BlockedStaticReview | TaskStatus::Failed => "failed",
        }
    }

    /// `complete` or `passing`: satisfies dependents and phase gates.
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Passing)
    }

    /// Failed terminal statuses; the only statuses `retry_task` accepts.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Blocked | TaskStatus::BlockedStaticReview | TaskStatus::Failed
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("task status", s))
    }
}

// ============================================================================
// Task Type / Complexity
// ============================================================================

/// How the pipeline enters a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    /// Full RED -> GREEN -> VERIFY pipeline.
    #[default]
    Implement,
    /// Implementation file overlaps an earlier task: start at VERIFY.
    VerifyOnly,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Implement => "implement",
            TaskType::VerifyOnly => "verify-only",
        }
    }
}

impl FromStr for TaskType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "implement" => Ok(TaskType::Implement),
            "verify-only" | "verify_only" => Ok(TaskType::VerifyOnly),
            other => Err(UnknownVariant::new("task type", other)),
        }
    }
}

/// Estimated complexity assigned during decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }
}

impl FromStr for Complexity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Complexity::Low),
            "medium" => Ok(Complexity::Medium),
            "high" => Ok(Complexity::High),
            other => Err(UnknownVariant::new("complexity", other)),
        }
    }
}

// ============================================================================
// Pipeline Stages
// ============================================================================

/// One step of the per-task pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Red,
    /// Static-review fix loop inside RED, before GREEN runs.
    RedFix,
    Green,
    Verify,
    Refactor,
    ReVerify,
    Fix,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Red,
        Stage::RedFix,
        Stage::Green,
        Stage::Verify,
        Stage::Refactor,
        Stage::ReVerify,
        Stage::Fix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Red => "red",
            Stage::RedFix => "red_fix",
            Stage::Green => "green",
            Stage::Verify => "verify",
            Stage::Refactor => "refactor",
            Stage::ReVerify => "re_verify",
            Stage::Fix => "fix",
        }
    }

    /// Whether this stage calls the code-generation agent.
    pub fn uses_agent(&self) -> bool {
        matches!(
            self,
            Stage::Red | Stage::RedFix | Stage::Green | Stage::Refactor | Stage::Fix
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("stage", s))
    }
}

// ============================================================================
// Circuit Breakers
// ============================================================================

/// Scope a circuit breaker guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerLevel {
    Stage,
    Worker,
    System,
}

impl BreakerLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerLevel::Stage => "stage",
            BreakerLevel::Worker => "worker",
            BreakerLevel::System => "system",
        }
    }
}

impl fmt::Display for BreakerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BreakerLevel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stage" => Ok(BreakerLevel::Stage),
            "worker" => Ok(BreakerLevel::Worker),
            "system" => Ok(BreakerLevel::System),
            other => Err(UnknownVariant::new("breaker level", other)),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" => Ok(CircuitState::HalfOpen),
            other => Err(UnknownVariant::new("circuit state", other)),
        }
    }
}

// ============================================================================
// Event helper macros
// ============================================================================
// Each macro builds an `OrchestratorEvent` and publishes it on the given bus.

#[macro_export]
macro_rules! log_phase_start {
    ($bus:expr, $phase:expr, $total:expr) => {
        $bus.publish($crate::OrchestratorEvent::PhaseStarted {
            phase: $phase,
            total_phases: $total,
        });
    };
}

#[macro_export]
macro_rules! log_phase_complete {
    ($bus:expr, $phase:expr, $completed:expr, $failed:expr) => {
        $bus.publish($crate::OrchestratorEvent::PhaseCompleted {
            phase: $phase,
            tasks_completed: $completed,
            tasks_failed: $failed,
        });
    };
}

#[macro_export]
macro_rules! log_task_claimed {
    ($bus:expr, $task_key:expr, $worker_id:expr) => {
        $bus.publish($crate::OrchestratorEvent::TaskClaimed {
            task_key: $task_key.to_string(),
            worker_id: $worker_id.to_string(),
        });
    };
}

#[macro_export]
macro_rules! log_task_complete {
    ($bus:expr, $task_key:expr, $worker_id:expr, $status:expr) => {
        $bus.publish($crate::OrchestratorEvent::TaskCompleted {
            task_key: $task_key.to_string(),
            worker_id: $worker_id.to_string(),
            status: $status,
        });
    };
}

#[macro_export]
macro_rules! log_task_failed {
    ($bus:expr, $task_key:expr, $worker_id:expr, $reason:expr) => {
        $bus.publish($crate::OrchestratorEvent::TaskFailed {
            task_key: $task_key.to_string(),
            worker_id: $worker_id.to_string(),
            reason: $reason.to_string(),
        });
    };
}

#[macro_export]
macro_rules! log_stage_start {
    ($bus:expr, $task_key:expr, $stage:expr, $attempt:expr) => {
        $bus.publish($crate::OrchestratorEvent::StageStarted {
            task_key: $task_key.to_string(),
            stage: $stage,
            attempt: $attempt,
        });
    };
}

#[macro_export]
macro_rules! log_stage_complete {
    ($bus:expr, $task_key:expr, $stage:expr, $attempt:expr, $success:expr, $duration_ms:expr) => {
        $bus.publish($crate::OrchestratorEvent::StageCompleted {
            task_key: $task_key.to_string(),
            stage: $stage,
            attempt: $attempt,
            success: $success,
            duration_ms: $duration_ms,
        });
    };
}
