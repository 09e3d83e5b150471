//! Records held by the task store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tdd_orchestrator_sdk::{BreakerLevel, CircuitState, Complexity, Stage, TaskStatus, TaskType};
use uuid::Uuid;

/// A unit of work in the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub task_key: String,
    pub title: String,
    pub goal: String,
    pub acceptance_criteria: Vec<String>,
    pub test_file: String,
    pub impl_file: Option<String>,
    pub status: TaskStatus,
    pub phase: i64,
    pub sequence: i64,
    pub depends_on: Vec<String>,
    pub complexity: Complexity,
    pub task_type: TaskType,
    pub module_exports: Vec<String>,
    pub retry_count: u32,
    pub claimed_by: Option<String>,
}

/// Insertable form of a task (ingestion output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_key: String,
    pub title: String,
    pub goal: String,
    pub acceptance_criteria: Vec<String>,
    pub test_file: String,
    pub impl_file: Option<String>,
    pub phase: i64,
    pub sequence: i64,
    pub depends_on: Vec<String>,
    pub complexity: Complexity,
    pub task_type: TaskType,
    pub module_exports: Vec<String>,
}

impl NewTask {
    /// Minimal task with the given ordering keys; remaining fields defaulted.
    pub fn new(task_key: impl Into<String>, phase: i64, sequence: i64) -> Self {
        let task_key = task_key.into();
        Self {
            title: task_key.clone(),
            goal: String::new(),
            acceptance_criteria: Vec::new(),
            test_file: format!("tests/test_{}.py", task_key.to_lowercase().replace('-', "_")),
            impl_file: None,
            phase,
            sequence,
            depends_on: Vec::new(),
            complexity: Complexity::default(),
            task_type: TaskType::default(),
            module_exports: Vec::new(),
            task_key,
        }
    }

    pub fn depends_on(mut self, keys: &[&str]) -> Self {
        self.depends_on = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn impl_file(mut self, path: impl Into<String>) -> Self {
        self.impl_file = Some(path.into());
        self
    }

    pub fn test_file(mut self, path: impl Into<String>) -> Self {
        self.test_file = path.into();
        self
    }

    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }
}

/// Orchestration session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// One orchestration session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub max_workers: usize,
    pub validation_status: Option<String>,
    pub validation_details: Option<String>,
}

/// Append-only log row for one stage invocation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAttempt {
    pub task_key: String,
    pub stage: Stage,
    pub attempt_number: u32,
    pub success: bool,
    pub error_message: Option<String>,
    pub output: Option<String>,
    pub test_exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
}

/// Worker status as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Idle,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Idle => "idle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(WorkerStatus::Active),
            "idle" => Some(WorkerStatus::Idle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub current_task: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub run_id: Uuid,
}

/// Immutable record of one stage invocation; the unit of budget accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub run_id: Uuid,
    pub stage: Stage,
    pub worker_id: String,
    pub task_key: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Persisted circuit breaker row, one per (level, identifier).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub level: BreakerLevel,
    pub identifier: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub consecutive_opens: u32,
    pub last_state_change: DateTime<Utc>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Invocation budget snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub count: u64,
    pub limit: u64,
    pub is_warning: bool,
}

impl BudgetStatus {
    pub fn is_exhausted(&self) -> bool {
        self.count >= self.limit
    }
}

/// Task counts per status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub passing: usize,
    pub complete: usize,
    pub blocked: usize,
    pub blocked_static_review: usize,
    pub failed: usize,
}

impl TaskStats {
    pub fn add(&mut self, status: TaskStatus, count: usize) {
        self.total += count;
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::InProgress => &mut self.in_progress,
            TaskStatus::Passing => &mut self.passing,
            TaskStatus::Complete => &mut self.complete,
            TaskStatus::Blocked => &mut self.blocked,
            TaskStatus::BlockedStaticReview => &mut self.blocked_static_review,
            TaskStatus::Failed => &mut self.failed,
        };
        *slot += count;
    }
}

/// Overall progress derived from [`TaskStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub percent_complete: f64,
}

impl From<&TaskStats> for Progress {
    fn from(stats: &TaskStats) -> Self {
        let completed = stats.complete + stats.passing;
        let failed = stats.blocked + stats.blocked_static_review + stats.failed;
        let percent_complete = if stats.total == 0 {
            0.0
        } else {
            completed as f64 * 100.0 / stats.total as f64
        };
        Self {
            total: stats.total,
            completed,
            failed,
            in_progress: stats.in_progress,
            pending: stats.pending,
            percent_complete,
        }
    }
}

/// Filter for `Database::list_tasks`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub phase: Option<i64>,
    pub status: Option<TaskStatus>,
}
