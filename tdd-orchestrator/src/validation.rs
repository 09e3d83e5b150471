//! End-of-run validation: re-run every finished task's tests once more.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tdd_orchestrator_sdk::ProcessRunner;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::database::Database;
use crate::phase_gate::run_regression;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub files_checked: usize,
    pub failed_files: Vec<String>,
    pub runs: usize,
}

impl ValidationReport {
    pub fn status(&self) -> &'static str {
        if self.passed {
            "passed"
        } else {
            "failed"
        }
    }
}

pub struct RunValidator {
    db: Database,
    runner: Arc<dyn ProcessRunner>,
}

impl RunValidator {
    pub fn new(db: Database, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { db, runner }
    }

    /// Run the regression batch over all complete/passing tasks and store
    /// the verdict on the run row.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn validate_run(&self, run_id: Uuid) -> Result<ValidationReport> {
        let files = self.db.get_completed_test_files()?;
        let regression = run_regression(self.runner.as_ref(), &files).await;
        let report = ValidationReport {
            passed: regression.passed,
            files_checked: files.len(),
            failed_files: regression.failed_files,
            runs: regression.runs,
        };

        let details = serde_json::to_string(&report).context("serialize validation report")?;
        self.db
            .record_run_validation(run_id, report.status(), &details)?;

        if report.passed {
            info!(files = report.files_checked, "run validation passed");
        } else {
            warn!(failed = ?report.failed_files, "run validation failed");
        }
        Ok(report)
    }
}
