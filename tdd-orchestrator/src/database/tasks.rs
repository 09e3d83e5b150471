//! Task graph queries: ingestion, ready-task selection, claims and status.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tdd_orchestrator_sdk::TaskStatus;
use tracing::{debug, instrument};

use super::{conversion_err, from_json_list, now_ts, to_json_list, Database};
use crate::error::OrchestratorError;
use crate::models::{NewTask, Progress, Task, TaskFilter, TaskStats};

const TASK_COLUMNS: &str = "id, task_key, title, goal, acceptance_criteria, test_file, impl_file, \
     status, phase, sequence, complexity, task_type, module_exports, retry_count, claimed_by";

impl Database {
    /// Insert a batch of tasks (and their dependency edges) in one transaction.
    ///
    /// Insertion order is preserved in `id`, which breaks (phase, sequence) ties.
    #[instrument(skip_all, fields(count = tasks.len()))]
    pub fn insert_tasks(&self, tasks: &[NewTask]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_ts();

        for task in tasks {
            tx.execute(
                r#"
                INSERT INTO tasks (
                    task_key, title, goal, acceptance_criteria, test_file, impl_file,
                    status, phase, sequence, complexity, task_type, module_exports,
                    retry_count, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?9, ?10, ?11, 0, ?12, ?12)
                "#,
                params![
                    task.task_key,
                    task.title,
                    task.goal,
                    to_json_list(&task.acceptance_criteria)?,
                    task.test_file,
                    task.impl_file,
                    task.phase,
                    task.sequence,
                    task.complexity.as_str(),
                    task.task_type.as_str(),
                    to_json_list(&task.module_exports)?,
                    now,
                ],
            )
            .with_context(|| format!("insert task {}", task.task_key))?;

            for dep in &task.depends_on {
                tx.execute(
                    r#"
                    INSERT OR IGNORE INTO task_dependencies (task_key, depends_on)
                    VALUES (?1, ?2)
                    "#,
                    params![task.task_key, dep],
                )?;
            }
        }

        tx.commit()?;
        debug!(count = tasks.len(), "tasks inserted");
        Ok(tasks.len())
    }

    /// Get a single task by key
    pub fn get_task(&self, task_key: &str) -> Result<Option<Task>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_key = ?1");
        let task = conn
            .query_row(&sql, params![task_key], map_task_row)
            .optional()?;
        task.map(|t| with_dependencies(&conn, t)).transpose()
    }

    /// List tasks in (phase, sequence, insertion) order with optional filters
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE (?1 IS NULL OR phase = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY phase, sequence, id
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(
                params![filter.phase, filter.status.map(|s| s.as_str())],
                map_task_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        tasks
            .into_iter()
            .map(|t| with_dependencies(&conn, t))
            .collect()
    }

    /// Lowest (phase, sequence) pending task whose dependencies are all
    /// `complete` or `passing`, optionally restricted to one phase.
    ///
    /// A dependency key with no matching task row is treated as satisfied.
    #[instrument(skip(self))]
    pub fn get_next_ready_task(&self, phase: Option<i64>) -> Result<Option<Task>> {
        let conn = self.lock()?;
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks t
            WHERE t.status = 'pending'
              AND (?1 IS NULL OR t.phase = ?1)
              AND NOT EXISTS (
                  SELECT 1 FROM task_dependencies d
                  JOIN tasks dep ON dep.task_key = d.depends_on
                  WHERE d.task_key = t.task_key
                    AND dep.status NOT IN ('complete', 'passing')
              )
            ORDER BY t.phase, t.sequence, t.id
            LIMIT 1
            "#
        );
        let task = conn
            .query_row(&sql, params![phase], map_task_row)
            .optional()?;
        task.map(|t| with_dependencies(&conn, t)).transpose()
    }

    /// Dependency keys of `task_key` that exist and are not terminal-success.
    pub fn unmet_dependencies(&self, task_key: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT d.depends_on FROM task_dependencies d
            JOIN tasks dep ON dep.task_key = d.depends_on
            WHERE d.task_key = ?1 AND dep.status NOT IN ('complete', 'passing')
            ORDER BY d.rowid
            "#,
        )?;
        let keys = stmt
            .query_map(params![task_key], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Atomic compare-and-set `pending -> in_progress`.
    ///
    /// Returns `false` when another claimant won; the caller re-queries.
    #[instrument(skip(self))]
    pub fn claim_task(&self, task_key: &str, worker_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let now = now_ts();
        let changed = conn.execute(
            r#"
            UPDATE tasks
            SET status = 'in_progress', claimed_by = ?2, claimed_at = ?3, updated_at = ?3
            WHERE task_key = ?1 AND status = 'pending'
            "#,
            params![task_key, worker_id, now],
        )?;
        debug!(claimed = changed == 1, "claim attempt");
        Ok(changed == 1)
    }

    /// Set a task's status; leaving `in_progress` releases the claim.
    #[instrument(skip(self), fields(status = %status))]
    pub fn update_task_status(&self, task_key: &str, status: TaskStatus) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE tasks
            SET status = ?2,
                updated_at = ?3,
                claimed_by = CASE WHEN ?2 = 'in_progress' THEN claimed_by ELSE NULL END,
                claimed_at = CASE WHEN ?2 = 'in_progress' THEN claimed_at ELSE NULL END
            WHERE task_key = ?1
            "#,
            params![task_key, status.as_str(), now_ts()],
        )?;
        if changed == 0 {
            return Err(OrchestratorError::TaskNotFound(task_key.to_string()).into());
        }
        Ok(())
    }

    /// Reset a failed terminal task (`blocked`, `blocked-static-review`,
    /// `failed`) to `pending` and bump its retry count.
    pub fn retry_task(&self, task_key: &str) -> Result<Task, OrchestratorError> {
        {
            let conn = self.lock()?;
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM tasks WHERE task_key = ?1",
                    params![task_key],
                    |row| row.get(0),
                )
                .optional()?;
            let current = current
                .ok_or_else(|| OrchestratorError::TaskNotFound(task_key.to_string()))?;
            let status: TaskStatus = current
                .parse()
                .map_err(|e| conversion_err(0, e))?;
            if !status.is_retryable() {
                return Err(OrchestratorError::RetryConflict {
                    task_key: task_key.to_string(),
                    status,
                });
            }

            // CAS on the status we just read so a concurrent transition wins cleanly
            let changed = conn.execute(
                r#"
                UPDATE tasks
                SET status = 'pending', retry_count = retry_count + 1,
                    claimed_by = NULL, claimed_at = NULL, updated_at = ?3
                WHERE task_key = ?1 AND status = ?2
                "#,
                params![task_key, status.as_str(), now_ts()],
            )?;
            if changed == 0 {
                return Err(OrchestratorError::RetryConflict {
                    task_key: task_key.to_string(),
                    status,
                });
            }
        }

        self.get_task(task_key)?
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_key.to_string()))
    }

    /// Ascending phase numbers with at least one non-terminal task.
    pub fn get_pending_phases(&self) -> Result<Vec<i64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT phase FROM tasks
            WHERE status IN ('pending', 'in_progress')
            ORDER BY phase
            "#,
        )?;
        let phases = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(phases)
    }

    /// Every task in phases strictly below `phase`.
    pub fn get_tasks_in_phases_before(&self, phase: i64) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE phase < ?1 ORDER BY phase, sequence, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(params![phase], map_task_row)?
            .collect::<Result<Vec<_>, _>>()?;
        tasks
            .into_iter()
            .map(|t| with_dependencies(&conn, t))
            .collect()
    }

    /// Distinct test files of tasks in phases below `phase`, in task order.
    pub fn get_test_files_from_phases_before(&self, phase: i64) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT test_file FROM tasks
            WHERE phase < ?1 AND test_file <> ''
            GROUP BY test_file
            ORDER BY MIN(phase), MIN(sequence), MIN(id)
            "#,
        )?;
        let files = stmt
            .query_map(params![phase], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(files)
    }

    /// Distinct test files of every terminal-success task.
    pub fn get_completed_test_files(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT test_file FROM tasks
            WHERE status IN ('complete', 'passing') AND test_file <> ''
            GROUP BY test_file
            ORDER BY MIN(phase), MIN(sequence), MIN(id)
            "#,
        )?;
        let files = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(files)
    }

    /// Task counts per status
    pub fn get_stats(&self) -> Result<TaskStats> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((status, count))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = TaskStats::default();
        for (status, count) in rows {
            let status: TaskStatus = status
                .parse()
                .with_context(|| "unexpected status in tasks table")?;
            stats.add(status, count as usize);
        }
        Ok(stats)
    }

    pub fn get_progress(&self) -> Result<Progress> {
        Ok(Progress::from(&self.get_stats()?))
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn map_task_row(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get(7)?;
    let complexity: String = row.get(10)?;
    let task_type: String = row.get(11)?;
    let acceptance: String = row.get(4)?;
    let exports: String = row.get(12)?;
    let retry_count: i64 = row.get(13)?;

    Ok(Task {
        id: row.get(0)?,
        task_key: row.get(1)?,
        title: row.get(2)?,
        goal: row.get(3)?,
        acceptance_criteria: from_json_list(4, &acceptance)?,
        test_file: row.get(5)?,
        impl_file: row.get(6)?,
        status: status.parse().map_err(|e| conversion_err(7, e))?,
        phase: row.get(8)?,
        sequence: row.get(9)?,
        depends_on: Vec::new(),
        complexity: complexity.parse().map_err(|e| conversion_err(10, e))?,
        task_type: task_type.parse().map_err(|e| conversion_err(11, e))?,
        module_exports: from_json_list(12, &exports)?,
        retry_count: retry_count.max(0) as u32,
        claimed_by: row.get(14)?,
    })
}

fn with_dependencies(conn: &Connection, mut task: Task) -> Result<Task> {
    let mut stmt = conn.prepare_cached(
        "SELECT depends_on FROM task_dependencies WHERE task_key = ?1 ORDER BY rowid",
    )?;
    task.depends_on = stmt
        .query_map(params![task.task_key], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(task)
}
