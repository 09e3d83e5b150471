//! Shared fixtures and scripted collaborators for orchestrator tests

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tdd_orchestrator::circuit_breaker::CircuitBreakerRegistry;
use tdd_orchestrator::config::{BreakersConfig, OrchestratorConfig, PipelineConfig};
use tdd_orchestrator::database::Database;
use tdd_orchestrator::pipeline::{Collaborators, PipelineEngine};
use tdd_orchestrator::Orchestrator;
use tdd_orchestrator_sdk::{
    async_trait, AgentRequest, CodeAgent, EventBus, NoOpReviewer, OrchestratorEvent,
    ProcessRunner, ReviewResult, RunOutcome, Stage, StaticReviewer, VcsCoordinator, VerifyResult,
    Violation,
};
use tokio::sync::broadcast;

// ============================================================================
// Scripted process runner
// ============================================================================

/// Runner whose results are queued per test file.
///
/// With `fail_first_run`, the first `run_tests` call for a file with nothing
/// queued fails (the RED run) and later calls pass.
#[derive(Default)]
pub struct ScriptedRunner {
    tests: Mutex<HashMap<String, VecDeque<RunOutcome>>>,
    verify: Mutex<VecDeque<VerifyResult>>,
    seen: Mutex<HashSet<String>>,
    failing_batch_files: Mutex<HashSet<String>>,
    pub fail_first_run: bool,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tests fail on their first run and pass afterwards.
    pub fn red_then_green() -> Self {
        Self {
            fail_first_run: true,
            ..Self::default()
        }
    }

    pub fn queue_tests(&self, file: &str, outcome: RunOutcome) {
        self.tests
            .lock()
            .unwrap()
            .entry(file.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn queue_verify(&self, result: VerifyResult) {
        self.verify.lock().unwrap().push_back(result);
    }

    /// `file` fails in batches and when run alone.
    pub fn break_file(&self, file: &str) {
        self.failing_batch_files
            .lock()
            .unwrap()
            .insert(file.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run_tests(&self, file: &str) -> RunOutcome {
        self.record(format!("tests:{file}"));
        if let Some(outcome) = self
            .tests
            .lock()
            .unwrap()
            .get_mut(file)
            .and_then(|q| q.pop_front())
        {
            return outcome;
        }
        if self.failing_batch_files.lock().unwrap().contains(file) {
            return RunOutcome::fail(format!("{file}: 1 failed"));
        }
        let first = self.seen.lock().unwrap().insert(file.to_string());
        if self.fail_first_run && first {
            RunOutcome::fail(format!("{file}: 1 failed"))
        } else {
            RunOutcome::pass(format!("{file}: 1 passed"))
        }
    }

    async fn check_types(&self, file: &str) -> RunOutcome {
        self.record(format!("types:{file}"));
        RunOutcome::pass("")
    }

    async fn lint(&self, file: &str) -> RunOutcome {
        self.record(format!("lint:{file}"));
        RunOutcome::pass("")
    }

    async fn run_test_batch(&self, files: &[String]) -> RunOutcome {
        self.record(format!("batch:{}", files.join(",")));
        let broken = self.failing_batch_files.lock().unwrap();
        if files.iter().any(|f| broken.contains(f)) {
            RunOutcome::fail("batch failed")
        } else {
            RunOutcome::pass("batch passed")
        }
    }

    async fn verify_all(&self, test_file: &str, _impl_file: Option<&str>) -> VerifyResult {
        self.record(format!("verify:{test_file}"));
        self.verify
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(passing_verify)
    }
}

pub fn passing_verify() -> VerifyResult {
    VerifyResult {
        tests: RunOutcome::pass("ok"),
        types: RunOutcome::pass("ok"),
        lint: RunOutcome::pass("ok"),
    }
}

// ============================================================================
// Recording agent
// ============================================================================

/// Agent that records every request and can fail or write files per stage.
#[derive(Default)]
pub struct RecordingAgent {
    pub requests: Mutex<Vec<AgentRequest>>,
    failing: Mutex<HashMap<Stage, usize>>,
    writes: Mutex<HashMap<Stage, (PathBuf, String)>>,
}

impl RecordingAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` requests for `stage` fail.
    pub fn fail_stage(&self, stage: Stage, times: usize) {
        self.failing.lock().unwrap().insert(stage, times);
    }

    /// Write `contents` to `path` whenever `stage` runs.
    pub fn write_on(&self, stage: Stage, path: &Path, contents: &str) {
        self.writes
            .lock()
            .unwrap()
            .insert(stage, (path.to_path_buf(), contents.to_string()));
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.requests().iter().map(|r| r.stage).collect()
    }
}

#[async_trait]
impl CodeAgent for RecordingAgent {
    async fn generate(&self, request: &AgentRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        {
            let mut failing = self.failing.lock().unwrap();
            if let Some(left) = failing.get_mut(&request.stage) {
                if *left > 0 {
                    *left -= 1;
                    return Err(anyhow!("agent refused {}", request.stage));
                }
            }
        }
        if let Some((path, contents)) = self.writes.lock().unwrap().get(&request.stage) {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, contents)?;
        }
        Ok(format!("{} done for {}", request.stage, request.task_key))
    }
}

// ============================================================================
// Reviewer / VCS fakes
// ============================================================================

/// Reviewer that blocks a fixed number of times, then reports clean.
pub struct BlockingReviewer {
    remaining: Mutex<usize>,
}

impl BlockingReviewer {
    pub fn times(n: usize) -> Self {
        Self {
            remaining: Mutex::new(n),
        }
    }
}

#[async_trait]
impl StaticReviewer for BlockingReviewer {
    async fn check_file(&self, file: &str) -> Result<ReviewResult> {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining == 0 {
            return Ok(ReviewResult::clean());
        }
        *remaining -= 1;
        Ok(ReviewResult::from_violations(vec![Violation {
            pattern: "test_without_assertion".into(),
            location: format!("{file}:1"),
            message: "test asserts nothing".into(),
            blocking: true,
        }]))
    }
}

#[derive(Default)]
pub struct RecordingVcs {
    pub branches: Mutex<Vec<String>>,
    pub commits: Mutex<Vec<String>>,
    pub rollbacks: Mutex<Vec<String>>,
}

impl RecordingVcs {
    pub fn commits(&self) -> Vec<String> {
        self.commits.lock().unwrap().clone()
    }

    pub fn rollbacks(&self) -> Vec<String> {
        self.rollbacks.lock().unwrap().clone()
    }
}

#[async_trait]
impl VcsCoordinator for RecordingVcs {
    async fn create_worker_branch(&self, worker_id: &str) -> Result<String> {
        let branch = format!("tdd/{worker_id}");
        self.branches.lock().unwrap().push(branch.clone());
        Ok(branch)
    }

    async fn commit_changes(&self, _worker_id: &str, message: &str) -> Result<Option<String>> {
        let mut commits = self.commits.lock().unwrap();
        commits.push(message.to_string());
        Ok(Some(format!("{:07x}", commits.len())))
    }

    async fn rollback_to_main(&self, worker_id: &str) -> Result<()> {
        self.rollbacks.lock().unwrap().push(worker_id.to_string());
        Ok(())
    }

    async fn has_uncommitted_changes(&self, _worker_id: &str) -> Result<bool> {
        Ok(true)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Fakes {
    pub agent: Arc<RecordingAgent>,
    pub runner: Arc<ScriptedRunner>,
    pub vcs: Arc<RecordingVcs>,
    pub reviewer: Arc<dyn StaticReviewer>,
}

impl Fakes {
    pub fn new(runner: ScriptedRunner) -> Self {
        Self {
            agent: Arc::new(RecordingAgent::new()),
            runner: Arc::new(runner),
            vcs: Arc::new(RecordingVcs::default()),
            reviewer: Arc::new(NoOpReviewer),
        }
    }

    pub fn with_reviewer(mut self, reviewer: impl StaticReviewer + 'static) -> Self {
        self.reviewer = Arc::new(reviewer);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            agent: self.agent.clone(),
            runner: self.runner.clone(),
            reviewer: self.reviewer.clone(),
            vcs: self.vcs.clone(),
        }
    }
}

/// Pipeline settings with no lint autofix and no escalation surprises.
pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        auto_lint_fix: false,
        ..PipelineConfig::default()
    }
}

pub struct PipelineHarness {
    pub db: Database,
    pub bus: EventBus,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub engine: PipelineEngine,
    pub project: tempfile::TempDir,
}

pub fn pipeline_harness(fakes: &Fakes, config: PipelineConfig) -> PipelineHarness {
    pipeline_harness_with_breakers(fakes, config, BreakersConfig::default())
}

pub fn pipeline_harness_with_breakers(
    fakes: &Fakes,
    config: PipelineConfig,
    breakers: BreakersConfig,
) -> PipelineHarness {
    let db = Database::open_in_memory().unwrap();
    let bus = EventBus::new();
    let project = tempfile::tempdir().unwrap();
    let breakers =
        Arc::new(CircuitBreakerRegistry::new(db.clone(), breakers, bus.clone()).unwrap());
    let engine = PipelineEngine::new(
        db.clone(),
        breakers.clone(),
        fakes.collaborators(),
        bus.clone(),
        config,
        project.path().to_path_buf(),
    );
    PipelineHarness {
        db,
        bus,
        breakers,
        engine,
        project,
    }
}

/// Fast pool settings for tests.
pub fn orchestrator_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.pool.max_workers = 2;
    config.pool.idle_poll_interval_ms = 10;
    config.pool.heartbeat_interval_secs = 1;
    config.pool.heartbeat_timeout_secs = 60;
    config.pipeline = pipeline_config();
    config
}

pub fn orchestrator(
    db: &Database,
    config: &OrchestratorConfig,
    fakes: &Fakes,
    project_dir: &Path,
) -> Orchestrator {
    Orchestrator::new(
        db.clone(),
        config,
        fakes.collaborators(),
        EventBus::new(),
        project_dir.to_path_buf(),
    )
    .unwrap()
}

/// Everything published so far on a subscribed receiver.
pub fn drain(rx: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}
