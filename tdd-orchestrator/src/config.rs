//! Orchestrator configuration stored as TOML.
//!
//! Every section is `#[serde(default)]`, so a partial file (or no file at all)
//! yields working defaults. CLI flags override individual fields after load.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tdd_orchestrator_sdk::BreakerLevel;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Database path; `None` means `~/.tdd-orchestrator/orchestrator.db`.
    pub db_path: Option<PathBuf>,
    pub pool: PoolConfig,
    pub pipeline: PipelineConfig,
    pub runner: RunnerConfig,
    pub agent: AgentConfig,
    pub git: GitConfig,
    pub breakers: BreakersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub heartbeat_interval_secs: u64,
    /// A claim whose owner has not heartbeated for this long is stale.
    pub heartbeat_timeout_secs: u64,
    pub max_invocations_per_session: u64,
    pub budget_warning_threshold: f64,
    pub halt_on_task_failure: bool,
    pub enable_phase_gates: bool,
    /// Reclaim stale claims before the first phase even without `--resume`.
    pub cleanup_stale_on_start: bool,
    pub idle_poll_interval_ms: u64,
    pub run_end_validation: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 300,
            max_invocations_per_session: 200,
            budget_warning_threshold: 0.8,
            halt_on_task_failure: true,
            enable_phase_gates: true,
            cleanup_stale_on_start: false,
            idle_poll_interval_ms: 500,
            run_end_validation: true,
        }
    }
}

impl PoolConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_green_attempts: u32,
    /// Model used from the second GREEN attempt onwards.
    pub escalation_model: Option<String>,
    pub max_fix_attempts: u32,
    pub fix_timeout_secs: u64,
    pub auto_lint_fix: bool,
    pub static_review: bool,
    pub refactor: RefactorThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_green_attempts: 2,
            escalation_model: Some("opus".to_string()),
            max_fix_attempts: 2,
            fix_timeout_secs: 1800,
            auto_lint_fix: true,
            static_review: true,
            refactor: RefactorThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RefactorThresholds {
    pub soft_max_lines: usize,
    pub hard_max_lines: usize,
    pub max_function_lines: usize,
    pub max_class_methods: usize,
}

impl Default for RefactorThresholds {
    fn default() -> Self {
        Self {
            soft_max_lines: 400,
            hard_max_lines: 800,
            max_function_lines: 50,
            max_class_methods: 16,
        }
    }
}

/// Commands used by the process runner.
///
/// `{file}` is replaced with the target path; `{files}` with every path of a
/// batch, space separated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    pub test_command: Vec<String>,
    pub batch_test_command: Vec<String>,
    pub type_check_command: Vec<String>,
    pub lint_command: Vec<String>,
    pub lint_fix_command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            test_command: argv(&["pytest", "-q", "{file}"]),
            batch_test_command: argv(&["pytest", "-q", "{files}"]),
            type_check_command: argv(&["mypy", "{file}"]),
            lint_command: argv(&["ruff", "check", "{file}"]),
            lint_fix_command: argv(&["ruff", "check", "--fix", "{file}"]),
            working_dir: None,
            timeout_secs: 300,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub program: String,
    pub model: Option<String>,
    pub extra_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            model: Some("sonnet".to_string()),
            extra_args: argv(&["--dangerously-skip-permissions"]),
            working_dir: None,
            timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BranchMode {
    /// One branch per worker, each checked out in its own worktree; workers
    /// write concurrently and finished tasks are merged into the main branch.
    #[default]
    PerWorker,
    /// Every worker commits on the main branch; commits are serialized.
    Single,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub enabled: bool,
    pub branch_mode: BranchMode,
    pub main_branch: String,
    pub repo_dir: Option<PathBuf>,
    /// Parent of the per-worker worktrees. Defaults to `<repo>.worktrees`
    /// beside the repository.
    pub worktrees_dir: Option<PathBuf>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            branch_mode: BranchMode::default(),
            main_branch: "main".to_string(),
            repo_dir: None,
            worktrees_dir: None,
        }
    }
}

/// Settings for one circuit breaker scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    /// Cooldown multiplier applied per consecutive re-open.
    pub backoff_multiplier: f64,
    pub max_cooldown_secs: u64,
    /// When set, the breaker also opens once failures / (failures + successes)
    /// reaches this rate after `min_samples` outcomes.
    pub failure_rate: Option<f64>,
    pub min_samples: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 300,
            backoff_multiplier: 2.0,
            max_cooldown_secs: 3600,
            failure_rate: None,
            min_samples: 10,
        }
    }
}

impl BreakerSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    fn validate(&self, scope: &str) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(anyhow!("breakers.{scope}.failure_threshold must be > 0"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow!("breakers.{scope}.backoff_multiplier must be >= 1.0"));
        }
        if self.max_cooldown_secs < self.cooldown_secs {
            return Err(anyhow!(
                "breakers.{scope}.max_cooldown_secs must be >= cooldown_secs"
            ));
        }
        if let Some(rate) = self.failure_rate {
            if !(0.0..=1.0).contains(&rate) || rate == 0.0 {
                return Err(anyhow!("breakers.{scope}.failure_rate must be in (0, 1]"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakersConfig {
    pub stage: BreakerSettings,
    pub worker: BreakerSettings,
    pub system: BreakerSettings,
}

impl Default for BreakersConfig {
    fn default() -> Self {
        Self {
            stage: BreakerSettings {
                failure_threshold: 3,
                cooldown_secs: 300,
                ..Default::default()
            },
            worker: BreakerSettings {
                failure_threshold: 5,
                cooldown_secs: 600,
                ..Default::default()
            },
            system: BreakerSettings {
                failure_threshold: 10,
                cooldown_secs: 900,
                failure_rate: Some(0.5),
                ..Default::default()
            },
        }
    }
}

impl BreakersConfig {
    pub fn for_level(&self, level: BreakerLevel) -> &BreakerSettings {
        match level {
            BreakerLevel::Stage => &self.stage,
            BreakerLevel::Worker => &self.worker,
            BreakerLevel::System => &self.system,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;
        if pool.max_workers == 0 {
            return Err(anyhow!("pool.max_workers must be > 0"));
        }
        if pool.max_invocations_per_session == 0 {
            return Err(anyhow!("pool.max_invocations_per_session must be > 0"));
        }
        if !(0.0..=1.0).contains(&pool.budget_warning_threshold) {
            return Err(anyhow!("pool.budget_warning_threshold must be within [0, 1]"));
        }
        if pool.heartbeat_interval_secs == 0 {
            return Err(anyhow!("pool.heartbeat_interval_secs must be > 0"));
        }
        if pool.heartbeat_timeout_secs <= pool.heartbeat_interval_secs {
            return Err(anyhow!(
                "pool.heartbeat_timeout_secs must exceed pool.heartbeat_interval_secs"
            ));
        }
        if self.pipeline.max_green_attempts == 0 {
            return Err(anyhow!("pipeline.max_green_attempts must be > 0"));
        }
        let refactor = &self.pipeline.refactor;
        if refactor.hard_max_lines < refactor.soft_max_lines {
            return Err(anyhow!(
                "pipeline.refactor.hard_max_lines must be >= soft_max_lines"
            ));
        }
        if self.runner.timeout_secs == 0 {
            return Err(anyhow!("runner.timeout_secs must be > 0"));
        }
        if self.runner.output_limit_bytes == 0 {
            return Err(anyhow!("runner.output_limit_bytes must be > 0"));
        }
        for (name, cmd) in [
            ("test_command", &self.runner.test_command),
            ("batch_test_command", &self.runner.batch_test_command),
            ("type_check_command", &self.runner.type_check_command),
            ("lint_command", &self.runner.lint_command),
        ] {
            if cmd.first().map_or(true, |c| c.trim().is_empty()) {
                return Err(anyhow!("runner.{name} must be a non-empty array"));
            }
        }
        if self.agent.program.trim().is_empty() {
            return Err(anyhow!("agent.program must not be empty"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        self.breakers.stage.validate("stage")?;
        self.breakers.worker.validate("worker")?;
        self.breakers.system.validate("system")?;
        Ok(())
    }

    /// Configured database path, or the per-user default.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => default_db_path(),
        }
    }
}

/// `~/.tdd-orchestrator`
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".tdd-orchestrator"))
        .ok_or_else(|| anyhow!("could not determine home directory"))
}

pub fn default_db_path() -> Result<PathBuf> {
    Ok(default_data_dir()?.join("orchestrator.db"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}
