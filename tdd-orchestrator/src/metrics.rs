//! Event-bus metrics sink
//!
//! Observational only: the engine behaves identically with or without a
//! collector subscribed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tdd_orchestrator_sdk::{BreakerLevel, CircuitState, EventBus, OrchestratorEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerTransition {
    pub level: BreakerLevel,
    pub identifier: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Keyed by stage name.
    pub invocations_by_stage: BTreeMap<String, u64>,
    pub stage_failures: BTreeMap<String, u64>,
    pub stages_skipped: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub breaker_transitions: Vec<BreakerTransition>,
    pub budget_warnings: u64,
    pub budget_exhausted: bool,
    pub gate_failures: u64,
    pub stale_claims_recovered: u64,
    /// Events dropped because the collector fell behind.
    pub lagged: u64,
}

impl MetricsSnapshot {
    pub fn total_invocations(&self) -> u64 {
        self.invocations_by_stage.values().sum()
    }

    pub fn record(&mut self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::InvocationRecorded { stage, .. } => {
                *self
                    .invocations_by_stage
                    .entry(stage.as_str().to_string())
                    .or_insert(0) += 1;
            }
            OrchestratorEvent::StageCompleted {
                stage,
                success: false,
                ..
            } => {
                *self
                    .stage_failures
                    .entry(stage.as_str().to_string())
                    .or_insert(0) += 1;
            }
            OrchestratorEvent::StageSkipped { .. } => self.stages_skipped += 1,
            OrchestratorEvent::TaskCompleted { .. } => self.tasks_completed += 1,
            OrchestratorEvent::TaskFailed { .. } => self.tasks_failed += 1,
            OrchestratorEvent::CircuitStateChanged {
                level,
                identifier,
                old_state,
                new_state,
                ..
            } => self.breaker_transitions.push(BreakerTransition {
                level: *level,
                identifier: identifier.clone(),
                from: *old_state,
                to: *new_state,
            }),
            OrchestratorEvent::BudgetWarning { .. } => self.budget_warnings += 1,
            OrchestratorEvent::BudgetExhausted { .. } => self.budget_exhausted = true,
            OrchestratorEvent::PhaseGateFailed { .. } => self.gate_failures += 1,
            OrchestratorEvent::StaleClaimsRecovered { count } => {
                self.stale_claims_recovered += *count as u64
            }
            _ => {}
        }
    }
}

/// Background subscriber folding bus events into a [`MetricsSnapshot`].
pub struct MetricsCollector {
    state: Arc<Mutex<MetricsSnapshot>>,
    handle: JoinHandle<()>,
}

impl MetricsCollector {
    /// Subscribe to `bus`. Only events published after this call are seen.
    pub fn spawn(bus: &EventBus) -> Self {
        let state = Arc::new(Mutex::new(MetricsSnapshot::default()));
        let mut rx = bus.subscribe();
        let sink = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let mut snapshot = sink.lock().unwrap_or_else(|p| p.into_inner());
                        snapshot.record(&event);
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("metrics collector lagged by {n} events");
                        let mut snapshot = sink.lock().unwrap_or_else(|p| p.into_inner());
                        snapshot.lagged += n;
                    }
                    Err(RecvError::Closed) => {
                        debug!("event bus closed, metrics collector exiting");
                        break;
                    }
                }
            }
        });
        Self { state, handle }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Stop collecting and return the final snapshot.
    pub fn finish(self) -> MetricsSnapshot {
        self.handle.abort();
        self.snapshot()
    }
}
