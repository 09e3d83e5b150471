//! Structured orchestration events and the bus that carries them.
//!
//! Events are purely observational: metrics collectors and notification sinks
//! subscribe to an [`EventBus`], and nothing in the engine depends on anyone
//! listening. The bus is constructed once at process start and handed to each
//! component that publishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{BreakerLevel, CircuitState, Stage, TaskStatus};

/// Default broadcast capacity; slow subscribers observe `Lagged` rather than
/// blocking publishers.
const DEFAULT_CAPACITY: usize = 1024;

/// Structured events emitted by the scheduler, pipeline and circuit breakers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    RunStarted {
        run_id: String,
        max_workers: usize,
    },
    RunCompleted {
        run_id: String,
        status: String,
        stopped_reason: Option<String>,
    },
    PhaseStarted {
        phase: i64,
        total_phases: usize,
    },
    PhaseCompleted {
        phase: i64,
        tasks_completed: usize,
        tasks_failed: usize,
    },
    PhaseGateFailed {
        phase: i64,
        reason: String,
    },
    TaskClaimed {
        task_key: String,
        worker_id: String,
    },
    TaskCompleted {
        task_key: String,
        worker_id: String,
        status: TaskStatus,
    },
    TaskFailed {
        task_key: String,
        worker_id: String,
        reason: String,
    },
    StageStarted {
        task_key: String,
        stage: Stage,
        attempt: u32,
    },
    StageCompleted {
        task_key: String,
        stage: Stage,
        attempt: u32,
        success: bool,
        duration_ms: u64,
    },
    /// Stage invocation refused by an open circuit breaker.
    StageSkipped {
        task_key: String,
        stage: Stage,
        reason: String,
    },
    InvocationRecorded {
        run_id: String,
        stage: Stage,
        worker_id: String,
        task_key: String,
    },
    BudgetWarning {
        run_id: String,
        count: u64,
        limit: u64,
    },
    BudgetExhausted {
        run_id: String,
        count: u64,
        limit: u64,
    },
    CircuitStateChanged {
        level: BreakerLevel,
        identifier: String,
        old_state: CircuitState,
        new_state: CircuitState,
        failure_count: u32,
        at: DateTime<Utc>,
    },
    StaleClaimsRecovered {
        count: usize,
    },
}

impl OrchestratorEvent {
    /// Log this event as JSON under the `tdd_orchestrator::events` target.
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            tracing::info!(target: "tdd_orchestrator::events", "{}", json);
        }
    }
}

/// Fan-out channel for [`OrchestratorEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Log the event and deliver it to current subscribers.
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, event: OrchestratorEvent) {
        event.emit();
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
