//! Phase gate validation
//!
//! Before phase N runs, every task in phases < N must be terminal-success and
//! their test files must still pass. Regression files run as one batch; on a
//! batch failure each file is re-run alone so the report names the files that
//! actually fail.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tdd_orchestrator_sdk::ProcessRunner;
use tracing::{info, instrument, warn};

use crate::database::Database;

/// Outcome of a batch-then-bisect regression run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegressionOutcome {
    pub passed: bool,
    pub failed_files: Vec<String>,
    /// Runner invocations made: the batch plus any per-file re-runs.
    pub runs: usize,
}

/// Run `files` as one batch, re-running each file alone if the batch fails.
///
/// Passes only if the batch passes or every individual re-run passes.
pub async fn run_regression(runner: &dyn ProcessRunner, files: &[String]) -> RegressionOutcome {
    if files.is_empty() {
        return RegressionOutcome {
            passed: true,
            ..Default::default()
        };
    }

    let batch = runner.run_test_batch(files).await;
    if batch.passed {
        return RegressionOutcome {
            passed: true,
            failed_files: Vec::new(),
            runs: 1,
        };
    }

    warn!(files = files.len(), "regression batch failed, re-running files individually");
    let mut failed_files = Vec::new();
    for file in files {
        let outcome = runner.run_tests(file).await;
        if !outcome.passed {
            failed_files.push(file.clone());
        }
    }
    RegressionOutcome {
        passed: failed_files.is_empty(),
        failed_files,
        runs: 1 + files.len(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub phase: i64,
    pub passed: bool,
    pub reason: Option<String>,
    /// Earlier-phase tasks that are not complete/passing.
    pub incomplete_tasks: Vec<String>,
    pub failed_files: Vec<String>,
    pub regression_runs: usize,
}

impl GateResult {
    fn pass(phase: i64, regression_runs: usize) -> Self {
        Self {
            phase,
            passed: true,
            reason: None,
            incomplete_tasks: Vec::new(),
            failed_files: Vec::new(),
            regression_runs,
        }
    }
}

pub struct PhaseGateValidator {
    db: Database,
    runner: Arc<dyn ProcessRunner>,
}

impl PhaseGateValidator {
    pub fn new(db: Database, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { db, runner }
    }

    #[instrument(skip(self))]
    pub async fn validate_phase(&self, phase: i64) -> Result<GateResult> {
        if phase == 0 {
            return Ok(GateResult::pass(phase, 0));
        }
        let earlier = self.db.get_tasks_in_phases_before(phase)?;
        if earlier.is_empty() {
            return Ok(GateResult::pass(phase, 0));
        }

        let incomplete: Vec<String> = earlier
            .iter()
            .filter(|t| !t.status.is_terminal_success())
            .map(|t| t.task_key.clone())
            .collect();
        if !incomplete.is_empty() {
            let reason = format!(
                "{} task(s) from earlier phases not complete: {}",
                incomplete.len(),
                incomplete.join(", ")
            );
            warn!("{reason}");
            return Ok(GateResult {
                phase,
                passed: false,
                reason: Some(reason),
                incomplete_tasks: incomplete,
                failed_files: Vec::new(),
                regression_runs: 0,
            });
        }

        let files = self.db.get_test_files_from_phases_before(phase)?;
        let regression = run_regression(self.runner.as_ref(), &files).await;
        if regression.passed {
            info!(files = files.len(), runs = regression.runs, "phase gate passed");
            return Ok(GateResult::pass(phase, regression.runs));
        }

        let reason = format!(
            "regression failures in {} file(s): {}",
            regression.failed_files.len(),
            regression.failed_files.join(", ")
        );
        warn!("{reason}");
        Ok(GateResult {
            phase,
            passed: false,
            reason: Some(reason),
            incomplete_tasks: Vec::new(),
            failed_files: regression.failed_files,
            regression_runs: regression.runs,
        })
    }
}
