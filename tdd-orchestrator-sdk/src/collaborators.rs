//! Interfaces to the external collaborators the pipeline drives.
//!
//! The engine never generates code, executes tests or touches version control
//! itself. It calls these traits, and every implementation reports failures as
//! values: a failing or timed-out command is a [`RunOutcome`] with
//! `passed == false`, not an `Err`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::Stage;

// ============================================================================
// Value types
// ============================================================================

/// One outstanding problem reported by verification or static review.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Issue {
    /// Rule or failure kind (e.g. `F401`, `arg-type`, `test_failure`).
    pub pattern: String,
    /// Where it occurs (e.g. `src/calc.py:12`).
    pub location: String,
    #[serde(default)]
    pub message: String,
}

impl Issue {
    pub fn new(
        pattern: impl Into<String>,
        location: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            location: location.into(),
            message: message.into(),
        }
    }

    /// `pattern:location`, the unit of fix-loop fingerprints.
    pub fn key(&self) -> String {
        format!("{}:{}", self.pattern, self.location)
    }
}

/// Result of a single process-runner call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunOutcome {
    pub passed: bool,
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    #[serde(default)]
    pub issues: Vec<Issue>,
}

impl RunOutcome {
    pub fn pass(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            output: output.into(),
            exit_code: Some(0),
            timed_out: false,
            issues: Vec::new(),
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
            exit_code: Some(1),
            timed_out: false,
            issues: Vec::new(),
        }
    }

    pub fn timeout(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
            exit_code: None,
            timed_out: true,
            issues: Vec::new(),
        }
    }

    pub fn with_issues(mut self, issues: Vec<Issue>) -> Self {
        self.issues = issues;
        self
    }
}

/// Aggregate of tests, type check and lint for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VerifyResult {
    pub tests: RunOutcome,
    pub types: RunOutcome,
    pub lint: RunOutcome,
}

impl VerifyResult {
    pub fn passed(&self) -> bool {
        self.tests.passed && self.types.passed && self.lint.passed
    }

    /// All issues across the three checks, in check order.
    pub fn issues(&self) -> Vec<Issue> {
        self.tests
            .issues
            .iter()
            .chain(self.types.issues.iter())
            .chain(self.lint.issues.iter())
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> String {
        let mark = |ok: bool| if ok { "pass" } else { "FAIL" };
        format!(
            "tests={} types={} lint={}",
            mark(self.tests.passed),
            mark(self.types.passed),
            mark(self.lint.passed)
        )
    }

    pub fn combined_output(&self) -> String {
        format!(
            "## tests\n{}\n## types\n{}\n## lint\n{}",
            self.tests.output, self.types.output, self.lint.output
        )
    }
}

/// A single static-review finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub pattern: String,
    pub location: String,
    pub message: String,
    pub blocking: bool,
}

impl Violation {
    pub fn as_issue(&self) -> Issue {
        Issue::new(&self.pattern, &self.location, &self.message)
    }
}

/// Outcome of `StaticReviewer::check_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReviewResult {
    pub violations: Vec<Violation>,
    pub is_blocking: bool,
}

impl ReviewResult {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn from_violations(violations: Vec<Violation>) -> Self {
        let is_blocking = violations.iter().any(|v| v.blocking);
        Self {
            violations,
            is_blocking,
        }
    }

    pub fn issues(&self) -> Vec<Issue> {
        self.violations.iter().map(Violation::as_issue).collect()
    }
}

/// Everything the code-generation agent receives for one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub stage: Stage,
    pub task_key: String,
    /// Rendered prompt context for this stage.
    pub prompt: String,
    /// Stronger model/agent configuration for escalated attempts.
    pub model_override: Option<String>,
    pub attempt: u32,
}

// ============================================================================
// Traits
// ============================================================================

/// LLM-driven code-generation agent.
#[async_trait]
pub trait CodeAgent: Send + Sync {
    /// Run one stage; returns the agent's narrative output.
    async fn generate(&self, request: &AgentRequest) -> Result<String>;

    /// The same agent working in `dir`; `None` when it has no working
    /// directory to move.
    fn in_workspace(&self, _dir: &Path) -> Option<Arc<dyn CodeAgent>> {
        None
    }
}

/// Test/type/lint process runner.
///
/// Implementations must enforce their own per-call timeout and report it as a
/// failed [`RunOutcome`] with `timed_out == true`.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run_tests(&self, file: &str) -> RunOutcome;

    async fn check_types(&self, file: &str) -> RunOutcome;

    async fn lint(&self, file: &str) -> RunOutcome;

    /// The same runner with commands started in `dir`.
    fn in_workspace(&self, _dir: &Path) -> Option<Arc<dyn ProcessRunner>> {
        None
    }

    /// Apply automatic lint fixes. Defaults to a no-op.
    async fn lint_fix(&self, _file: &str) -> RunOutcome {
        RunOutcome::pass("")
    }

    /// Run several test files as one batch.
    ///
    /// The default runs them one by one and fails if any fails.
    async fn run_test_batch(&self, files: &[String]) -> RunOutcome {
        let mut passed = true;
        let mut output = String::new();
        let mut issues = Vec::new();
        for file in files {
            let outcome = self.run_tests(file).await;
            passed &= outcome.passed;
            output.push_str(&outcome.output);
            output.push('\n');
            issues.extend(outcome.issues);
        }
        RunOutcome {
            passed,
            output,
            exit_code: Some(if passed { 0 } else { 1 }),
            timed_out: false,
            issues,
        }
    }

    /// Tests on `test_file`, then type check and lint on the implementation
    /// (or the test file when no implementation is set).
    async fn verify_all(&self, test_file: &str, impl_file: Option<&str>) -> VerifyResult {
        let target = impl_file.unwrap_or(test_file);
        VerifyResult {
            tests: self.run_tests(test_file).await,
            types: self.check_types(target).await,
            lint: self.lint(target).await,
        }
    }
}

/// Static source-quality review of generated tests.
#[async_trait]
pub trait StaticReviewer: Send + Sync {
    async fn check_file(&self, file: &str) -> Result<ReviewResult>;

    /// The same reviewer resolving files under `dir`.
    fn in_workspace(&self, _dir: &Path) -> Option<Arc<dyn StaticReviewer>> {
        None
    }
}

/// Version-control operations the pipeline calls.
///
/// Every operation is scoped to one worker. Coordinators that isolate workers
/// report the worker's checkout through [`VcsCoordinator::workspace_dir`];
/// the pipeline then runs that worker's agent, runner and reviewer there.
#[async_trait]
pub trait VcsCoordinator: Send + Sync {
    /// Create (or reuse) the branch a worker commits on and bring it up to
    /// date with the main line; returns its name.
    async fn create_worker_branch(&self, worker_id: &str) -> Result<String>;

    /// Commit the worker's pending changes; `None` when there was nothing to
    /// commit.
    async fn commit_changes(&self, worker_id: &str, message: &str) -> Result<Option<String>>;

    /// Discard the worker's unfinished work and return to the main line.
    async fn rollback_to_main(&self, worker_id: &str) -> Result<()>;

    async fn has_uncommitted_changes(&self, worker_id: &str) -> Result<bool>;

    /// Directory holding the worker's private checkout, if it has one.
    fn workspace_dir(&self, _worker_id: &str) -> Option<PathBuf> {
        None
    }

    /// Land the worker's finished task on the main line.
    async fn integrate(&self, _worker_id: &str) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// No-op implementations (dry-run and tests)
// ============================================================================

/// Agent that generates nothing.
#[derive(Debug, Clone, Default)]
pub struct NoOpAgent;

#[async_trait]
impl CodeAgent for NoOpAgent {
    async fn generate(&self, request: &AgentRequest) -> Result<String> {
        Ok(format!(
            "dry-run: skipped {} for {}",
            request.stage, request.task_key
        ))
    }
}

/// Runner whose every check passes.
#[derive(Debug, Clone, Default)]
pub struct NoOpRunner;

#[async_trait]
impl ProcessRunner for NoOpRunner {
    async fn run_tests(&self, file: &str) -> RunOutcome {
        RunOutcome::pass(format!("dry-run: tests skipped for {file}"))
    }

    async fn check_types(&self, file: &str) -> RunOutcome {
        RunOutcome::pass(format!("dry-run: type check skipped for {file}"))
    }

    async fn lint(&self, file: &str) -> RunOutcome {
        RunOutcome::pass(format!("dry-run: lint skipped for {file}"))
    }
}

/// Reviewer that never reports violations.
#[derive(Debug, Clone, Default)]
pub struct NoOpReviewer;

#[async_trait]
impl StaticReviewer for NoOpReviewer {
    async fn check_file(&self, _file: &str) -> Result<ReviewResult> {
        Ok(ReviewResult::clean())
    }
}

/// Version control that records nothing.
#[derive(Debug, Clone, Default)]
pub struct NoOpVcs;

#[async_trait]
impl VcsCoordinator for NoOpVcs {
    async fn create_worker_branch(&self, worker_id: &str) -> Result<String> {
        Ok(format!("tdd/{worker_id}"))
    }

    async fn commit_changes(&self, _worker_id: &str, _message: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn rollback_to_main(&self, _worker_id: &str) -> Result<()> {
        Ok(())
    }

    async fn has_uncommitted_changes(&self, _worker_id: &str) -> Result<bool> {
        Ok(false)
    }
}
