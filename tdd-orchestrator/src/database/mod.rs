//! SQLite task store for the orchestration engine
//!
//! Holds every piece of shared mutable state the engine has: tasks and their
//! dependencies, execution runs, workers, the stage-attempt log, invocation
//! records and circuit breaker rows. Every status transition is a single
//! statement (or a single transaction), so a crash never leaves a partially
//! applied transition behind.
//!
//! # Database Schema
//!
//! 1. **tasks** - task graph nodes (status, phase, sequence, claim owner)
//! 2. **task_dependencies** - `depends_on` edges keyed by task_key
//! 3. **runs** - one row per orchestration session
//! 4. **workers** - worker registry with heartbeats
//! 5. **stage_attempts** - append-only per-stage attempt log
//! 6. **invocations** - append-only stage invocation log (budget accounting)
//! 7. **circuit_breakers** - one row per (level, identifier)
//! 8. **schema_version** - migrations
//!
//! # Concurrency
//!
//! The connection sits behind a mutex that is held for exactly one store
//! operation. Claims are compare-and-set updates (`WHERE status = 'pending'`),
//! so at most one claimant wins even across processes sharing the file.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use tdd_orchestrator::database::Database;
//! use tdd_orchestrator::models::NewTask;
//!
//! # fn main() -> anyhow::Result<()> {
//! let db = Database::open_in_memory()?;
//! db.insert_tasks(&[NewTask::new("TDD-00", 0, 0)])?;
//!
//! if let Some(task) = db.get_next_ready_task(None)? {
//!     if db.claim_task(&task.task_key, "w1")? {
//!         // run the pipeline
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod breakers;
mod runs;
mod tasks;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// Database wrapper shared by every worker.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open database {}", path.display()))?;

        // WAL lets readers proceed while a worker writes
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    /// In-memory database with the schema applied.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    /// Initialize database schema with all tables and indexes
    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_key TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                goal TEXT NOT NULL DEFAULT '',
                acceptance_criteria TEXT NOT NULL DEFAULT '[]',
                test_file TEXT NOT NULL,
                impl_file TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                phase INTEGER NOT NULL DEFAULT 0,
                sequence INTEGER NOT NULL DEFAULT 0,
                complexity TEXT NOT NULL DEFAULT 'medium',
                task_type TEXT NOT NULL DEFAULT 'implement',
                module_exports TEXT NOT NULL DEFAULT '[]',
                retry_count INTEGER NOT NULL DEFAULT 0,
                claimed_by TEXT,
                claimed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_ready ON tasks(status, phase, sequence, id);

            CREATE TABLE IF NOT EXISTS task_dependencies (
                task_key TEXT NOT NULL,
                depends_on TEXT NOT NULL,
                PRIMARY KEY (task_key, depends_on),
                FOREIGN KEY(task_key) REFERENCES tasks(task_key) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_deps_depends_on ON task_dependencies(depends_on);
            "#,
        )?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                max_workers INTEGER NOT NULL,
                validation_status TEXT,
                validation_details TEXT
            );

            CREATE TABLE IF NOT EXISTS workers (
                worker_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                current_task TEXT,
                last_heartbeat TEXT,
                run_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS stage_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_key TEXT NOT NULL,
                stage TEXT NOT NULL,
                attempt_number INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT,
                output TEXT,
                test_exit_code INTEGER,
                started_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_attempts_task ON stage_attempts(task_key, id);

            CREATE TABLE IF NOT EXISTS invocations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                worker_id TEXT NOT NULL,
                task_key TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_invocations_run ON invocations(run_id);

            CREATE TABLE IF NOT EXISTS circuit_breakers (
                level TEXT NOT NULL,
                identifier TEXT NOT NULL,
                state TEXT NOT NULL,
                failure_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                consecutive_opens INTEGER NOT NULL DEFAULT 0,
                last_state_change TEXT NOT NULL,
                cooldown_until TEXT,
                PRIMARY KEY (level, identifier)
            );

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Get current schema version
    pub fn get_schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;
        let version: i32 =
            conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
        Ok(version)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Timestamp format used in every column: fixed-width UTC with millisecond
/// precision, so lexical order equals chronological order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn now_ts() -> String {
    format_ts(Utc::now())
}

pub(crate) fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Map a closed-enum parse failure into a row conversion error.
pub(crate) fn conversion_err<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn to_json_list(items: &[String]) -> Result<String> {
    Ok(serde_json::to_string(items)?)
}

pub(crate) fn from_json_list(column: usize, raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| conversion_err(column, e))
}
