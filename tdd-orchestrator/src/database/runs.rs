//! Execution runs, worker registry, stage attempts and invocation accounting.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::time::Duration;
use tdd_orchestrator_sdk::Stage;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{conversion_err, format_ts, now_ts, parse_opt_ts, parse_ts, Database};
use crate::error::OrchestratorError;
use crate::models::{
    BudgetStatus, ExecutionRun, Invocation, RunStatus, StageAttempt, WorkerRecord, WorkerStatus,
};

impl Database {
    // ========================================================================
    // Runs
    // ========================================================================

    /// Start a new execution run and return its id
    pub fn start_run(&self, max_workers: usize) -> Result<Uuid> {
        let conn = self.lock()?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO runs (id, status, started_at, max_workers) VALUES (?1, ?2, ?3, ?4)",
            params![
                id.to_string(),
                RunStatus::Running.as_str(),
                now_ts(),
                max_workers as i64
            ],
        )?;
        info!(run_id = %id, max_workers, "execution run started");
        Ok(id)
    }

    pub fn complete_run(&self, run_id: Uuid, status: RunStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET status = ?2, completed_at = ?3 WHERE id = ?1",
            params![run_id.to_string(), status.as_str(), now_ts()],
        )?;
        Ok(())
    }

    /// Record the end-of-run validation result on the run row
    pub fn record_run_validation(&self, run_id: Uuid, status: &str, details: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET validation_status = ?2, validation_details = ?3 WHERE id = ?1",
            params![run_id.to_string(), status, details],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: Uuid) -> Result<Option<ExecutionRun>> {
        let conn = self.lock()?;
        let run = conn
            .query_row(
                r#"
                SELECT id, status, started_at, completed_at, max_workers,
                       validation_status, validation_details
                FROM runs WHERE id = ?1
                "#,
                params![run_id.to_string()],
                map_run_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Most recently started run, if any
    pub fn get_latest_run(&self) -> Result<Option<ExecutionRun>> {
        let conn = self.lock()?;
        let run = conn
            .query_row(
                r#"
                SELECT id, status, started_at, completed_at, max_workers,
                       validation_status, validation_details
                FROM runs ORDER BY started_at DESC LIMIT 1
                "#,
                [],
                map_run_row,
            )
            .optional()?;
        Ok(run)
    }

    // ========================================================================
    // Workers
    // ========================================================================

    /// Register (or re-activate) a worker for `run_id` with a fresh heartbeat
    pub fn register_worker(&self, worker_id: &str, run_id: Uuid) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO workers (worker_id, status, current_task, last_heartbeat, run_id)
            VALUES (?1, 'active', NULL, ?2, ?3)
            ON CONFLICT(worker_id) DO UPDATE SET
                status = 'active',
                current_task = NULL,
                last_heartbeat = excluded.last_heartbeat,
                run_id = excluded.run_id
            "#,
            params![worker_id, now_ts(), run_id.to_string()],
        )?;
        Ok(())
    }

    /// Refresh the heartbeat and record which task the worker holds
    pub fn update_worker_heartbeat(
        &self,
        worker_id: &str,
        current_task: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE workers SET last_heartbeat = ?2, current_task = ?3 WHERE worker_id = ?1",
            params![worker_id, now_ts(), current_task],
        )?;
        Ok(())
    }

    /// Refresh only the heartbeat timestamp (timer tick)
    pub fn touch_worker_heartbeat(&self, worker_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE workers SET last_heartbeat = ?2 WHERE worker_id = ?1",
            params![worker_id, now_ts()],
        )?;
        Ok(())
    }

    pub fn set_worker_idle(&self, worker_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE workers SET status = 'idle', current_task = NULL WHERE worker_id = ?1",
            params![worker_id],
        )?;
        Ok(())
    }

    pub fn get_workers(&self, run_id: Uuid) -> Result<Vec<WorkerRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT worker_id, status, current_task, last_heartbeat, run_id
            FROM workers WHERE run_id = ?1 ORDER BY worker_id
            "#,
        )?;
        let workers = stmt
            .query_map(params![run_id.to_string()], |row| {
                let status: String = row.get(1)?;
                let run_id: String = row.get(4)?;
                Ok(WorkerRecord {
                    worker_id: row.get(0)?,
                    status: WorkerStatus::parse(&status).unwrap_or(WorkerStatus::Idle),
                    current_task: row.get(2)?,
                    last_heartbeat: parse_opt_ts(row.get(3)?)?,
                    run_id: Uuid::parse_str(&run_id).map_err(|e| conversion_err(4, e))?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(workers)
    }

    /// Reset `in_progress` tasks whose owner is presumed dead back to `pending`.
    ///
    /// An owner is dead when it has no worker row, no heartbeat, or a
    /// heartbeat older than `heartbeat_timeout`. Returns the number reclaimed.
    #[instrument(skip(self))]
    pub fn cleanup_stale_claims(&self, heartbeat_timeout: Duration) -> Result<usize> {
        let timeout = ChronoDuration::from_std(heartbeat_timeout)
            .context("heartbeat timeout out of range")?;
        let cutoff = format_ts(Utc::now() - timeout);

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let stale: Vec<(String, Option<String>)> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT t.task_key, t.claimed_by FROM tasks t
                WHERE t.status = 'in_progress'
                  AND NOT EXISTS (
                      SELECT 1 FROM workers w
                      WHERE w.worker_id = t.claimed_by
                        AND w.last_heartbeat IS NOT NULL
                        AND w.last_heartbeat >= ?1
                  )
                "#,
            )?;
            let rows = stmt
                .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        for (task_key, worker_id) in &stale {
            let claim = OrchestratorError::StaleClaim {
                task_key: task_key.clone(),
                worker_id: worker_id.clone().unwrap_or_default(),
            };
            warn!("{claim}; resetting to pending");
            tx.execute(
                r#"
                UPDATE tasks
                SET status = 'pending', claimed_by = NULL, claimed_at = NULL, updated_at = ?2
                WHERE task_key = ?1 AND status = 'in_progress'
                "#,
                params![task_key, now_ts()],
            )?;
        }

        tx.commit()?;
        Ok(stale.len())
    }

    // ========================================================================
    // Stage attempts
    // ========================================================================

    pub fn record_stage_attempt(&self, attempt: &StageAttempt) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO stage_attempts (
                task_key, stage, attempt_number, success, error_message,
                output, test_exit_code, started_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                attempt.task_key,
                attempt.stage.as_str(),
                attempt.attempt_number,
                attempt.success,
                attempt.error_message,
                attempt.output,
                attempt.test_exit_code,
                format_ts(attempt.started_at),
            ],
        )?;
        debug!(
            task_key = %attempt.task_key,
            stage = %attempt.stage,
            attempt = attempt.attempt_number,
            success = attempt.success,
            "stage attempt recorded"
        );
        Ok(())
    }

    /// Attempt log for a task, oldest first
    pub fn get_stage_attempts(&self, task_key: &str) -> Result<Vec<StageAttempt>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT task_key, stage, attempt_number, success, error_message,
                   output, test_exit_code, started_at
            FROM stage_attempts WHERE task_key = ?1 ORDER BY id
            "#,
        )?;
        let attempts = stmt
            .query_map(params![task_key], map_attempt_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(attempts)
    }

    // ========================================================================
    // Invocations / budget
    // ========================================================================

    pub fn record_invocation(&self, invocation: &Invocation) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO invocations (run_id, stage, worker_id, task_key, duration_ms, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                invocation.run_id.to_string(),
                invocation.stage.as_str(),
                invocation.worker_id,
                invocation.task_key,
                invocation.duration_ms as i64,
                format_ts(invocation.timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn count_invocations(&self, run_id: Uuid) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM invocations WHERE run_id = ?1",
            params![run_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Invocations per stage for a run
    pub fn count_invocations_by_stage(&self, run_id: Uuid) -> Result<Vec<(Stage, u64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT stage, COUNT(*) FROM invocations
            WHERE run_id = ?1
            GROUP BY stage ORDER BY stage
            "#,
        )?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| {
                let stage: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((
                    stage.parse().map_err(|e| conversion_err(0, e))?,
                    count as u64,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Budget snapshot: `is_warning` once `count / limit >= warning_threshold`
    pub fn check_invocation_budget(
        &self,
        run_id: Uuid,
        limit: u64,
        warning_threshold: f64,
    ) -> Result<BudgetStatus> {
        let count = self.count_invocations(run_id)?;
        let is_warning = limit == 0 || count as f64 / limit as f64 >= warning_threshold;
        Ok(BudgetStatus {
            count,
            limit,
            is_warning,
        })
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn map_run_row(row: &Row) -> rusqlite::Result<ExecutionRun> {
    let id: String = row.get(0)?;
    let status: String = row.get(1)?;
    let started_at: String = row.get(2)?;
    let max_workers: i64 = row.get(4)?;
    Ok(ExecutionRun {
        id: Uuid::parse_str(&id).map_err(|e| conversion_err(0, e))?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        started_at: parse_ts(&started_at)?,
        completed_at: parse_opt_ts(row.get(3)?)?,
        max_workers: max_workers.max(0) as usize,
        validation_status: row.get(5)?,
        validation_details: row.get(6)?,
    })
}

fn map_attempt_row(row: &Row) -> rusqlite::Result<StageAttempt> {
    let stage: String = row.get(1)?;
    let started_at: String = row.get(7)?;
    Ok(StageAttempt {
        task_key: row.get(0)?,
        stage: stage.parse().map_err(|e| conversion_err(1, e))?,
        attempt_number: row.get(2)?,
        success: row.get(3)?,
        error_message: row.get(4)?,
        output: row.get(5)?,
        test_exit_code: row.get(6)?,
        started_at: parse_ts(&started_at)?,
    })
}
