//! Per-task pipeline engine
//!
//! Drives one claimed task through its stage state machine:
//!
//! ```text
//! implement:   RED -> [static review -> RED_FIX*] -> GREEN (skipped if pre-implemented)
//!                  -> VERIFY -> [FIX -> RE_VERIFY]*
//!                  -> [REFACTOR -> RE_VERIFY -> [FIX -> RE_VERIFY]*]
//! verify-only: VERIFY -> [FIX -> RE_VERIFY]*
//! ```
//!
//! Before every stage the stage, worker and system circuit breakers are
//! consulted; a rejected stage is recorded as a failed attempt and never
//! reaches a collaborator. Every executed stage is appended to the attempt
//! log, counted as one invocation against the run budget, and reported to
//! the breakers. Successful stages are followed by an optional lint autofix
//! and a commit. A task that succeeds is integrated into the main line; one
//! that does not is rolled back.
//!
//! When the version-control coordinator gives a worker its own checkout, the
//! whole task runs there: agent, runner, reviewer and file checks included.

pub mod prompts;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tdd_orchestrator_sdk::{
    log_stage_complete, log_stage_start, AgentRequest, CodeAgent, EventBus, Issue, NoOpAgent,
    NoOpReviewer, NoOpRunner, NoOpVcs, OrchestratorEvent, ProcessRunner, ReviewResult, RunOutcome,
    Stage, StaticReviewer, TaskStatus, TaskType, VcsCoordinator, VerifyResult,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::circuit_breaker::{Acquire, CircuitBreakerRegistry, Scope};
use crate::collaborators::process::truncate_output;
use crate::config::PipelineConfig;
use crate::database::Database;
use crate::error::OrchestratorError;
use crate::fix_tracker::RedFixAttemptTracker;
use crate::models::{Invocation, StageAttempt, Task};
use crate::refactor_check::check_needs_refactor;

/// Stage output kept in the attempt log.
const ATTEMPT_OUTPUT_LIMIT: usize = 20_000;

/// The external collaborators a pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn CodeAgent>,
    pub runner: Arc<dyn ProcessRunner>,
    pub reviewer: Arc<dyn StaticReviewer>,
    pub vcs: Arc<dyn VcsCoordinator>,
}

impl Collaborators {
    /// Dry-run collaborators: every check passes, nothing is written.
    pub fn no_op() -> Self {
        Self {
            agent: Arc::new(NoOpAgent),
            runner: Arc::new(NoOpRunner),
            reviewer: Arc::new(NoOpReviewer),
            vcs: Arc::new(NoOpVcs),
        }
    }

    /// The same collaborators working in `dir`. Collaborators with nothing to
    /// move are shared as they are.
    pub fn in_workspace(&self, dir: &Path) -> Self {
        Self {
            agent: self
                .agent
                .in_workspace(dir)
                .unwrap_or_else(|| self.agent.clone()),
            runner: self
                .runner
                .in_workspace(dir)
                .unwrap_or_else(|| self.runner.clone()),
            reviewer: self
                .reviewer
                .in_workspace(dir)
                .unwrap_or_else(|| self.reviewer.clone()),
            vcs: self.vcs.clone(),
        }
    }
}

/// Outcome of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub issues: Vec<Issue>,
    /// Rejected by a circuit breaker; no collaborator was called.
    pub skipped: bool,
    /// RED only: tests already pass against an existing implementation.
    pub pre_implemented: bool,
}

impl StageResult {
    pub fn ok(stage: Stage, output: impl Into<String>) -> Self {
        Self {
            stage,
            success: true,
            output: output.into(),
            error: None,
            exit_code: None,
            issues: Vec::new(),
            skipped: false,
            pre_implemented: false,
        }
    }

    pub fn failed(stage: Stage, output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::ok(stage, output)
        }
    }

    fn skipped(stage: Stage, reason: String) -> Self {
        Self {
            skipped: true,
            ..Self::failed(stage, "", reason)
        }
    }

    fn from_run(stage: Stage, outcome: RunOutcome, failure: &str) -> Self {
        let mut result = if outcome.passed {
            Self::ok(stage, outcome.output)
        } else if outcome.timed_out {
            Self::failed(stage, outcome.output, format!("{failure} (timed out)"))
        } else {
            Self::failed(stage, outcome.output, failure)
        };
        result.exit_code = outcome.exit_code;
        result.issues = outcome.issues;
        result
    }

    fn from_verify(stage: Stage, verify: VerifyResult) -> Self {
        let passed = verify.passed();
        Self {
            stage,
            success: passed,
            output: verify.combined_output(),
            error: (!passed).then(|| format!("verification failed: {}", verify.summary())),
            exit_code: verify.tests.exit_code,
            issues: verify.issues(),
            skipped: false,
            pre_implemented: false,
        }
    }

    pub fn reason(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("{} failed", self.stage))
    }
}

/// Classify the RED test run.
///
/// Failing tests are the expected RED outcome. Passing tests are only
/// accepted when an implementation already exists; otherwise the test is a
/// false positive.
pub fn evaluate_red(
    outcome: RunOutcome,
    impl_file: Option<&str>,
    impl_exists: bool,
) -> StageResult {
    if !outcome.passed {
        let mut result = StageResult::ok(Stage::Red, outcome.output);
        result.exit_code = outcome.exit_code;
        return result;
    }
    if impl_exists {
        let mut result = StageResult::ok(Stage::Red, outcome.output);
        result.exit_code = outcome.exit_code;
        result.pre_implemented = true;
        return result;
    }
    let detail = match impl_file {
        Some(file) => format!("implementation file {file} does not exist"),
        None => "no implementation file is specified".to_string(),
    };
    StageResult {
        exit_code: outcome.exit_code,
        ..StageResult::failed(
            Stage::Red,
            outcome.output,
            format!(
                "tests pass but {detail}; a test that passes against nothing is a false positive"
            ),
        )
    }
}

/// Final result of running one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_key: String,
    pub status: TaskStatus,
    pub reason: Option<String>,
    pub pre_implemented: bool,
    /// Stage invocations this task consumed.
    pub invocations: u32,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_terminal_success()
    }
}

struct Ending {
    status: TaskStatus,
    reason: Option<String>,
    pre_implemented: bool,
}

impl Ending {
    fn success(pre_implemented: bool) -> Self {
        Self {
            status: if pre_implemented {
                TaskStatus::Passing
            } else {
                TaskStatus::Complete
            },
            reason: None,
            pre_implemented,
        }
    }

    fn blocked(result: &StageResult) -> Self {
        Self {
            status: TaskStatus::Blocked,
            reason: Some(format!("{}: {}", result.stage, result.reason())),
            pre_implemented: false,
        }
    }
}

/// Mutable per-task bookkeeping.
struct TaskRun<'a> {
    task: &'a Task,
    worker_id: &'a str,
    run_id: Uuid,
    attempts: HashMap<Stage, u32>,
    invocations: u32,
}

impl<'a> TaskRun<'a> {
    fn next_attempt(&mut self, stage: Stage) -> u32 {
        let n = self.attempts.entry(stage).or_insert(0);
        *n += 1;
        *n
    }
}

pub struct PipelineEngine {
    db: Database,
    breakers: Arc<CircuitBreakerRegistry>,
    collaborators: Collaborators,
    bus: EventBus,
    config: PipelineConfig,
    project_dir: PathBuf,
}

impl PipelineEngine {
    pub fn new(
        db: Database,
        breakers: Arc<CircuitBreakerRegistry>,
        collaborators: Collaborators,
        bus: EventBus,
        config: PipelineConfig,
        project_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            breakers,
            collaborators,
            bus,
            config,
            project_dir,
        }
    }

    /// This engine with its collaborators and file checks rooted at `dir`.
    fn in_workspace(&self, dir: PathBuf) -> Self {
        Self {
            db: self.db.clone(),
            breakers: self.breakers.clone(),
            collaborators: self.collaborators.in_workspace(&dir),
            bus: self.bus.clone(),
            config: self.config.clone(),
            project_dir: dir,
        }
    }

    /// Run a claimed task to a terminal status.
    ///
    /// Stage failures are values in the returned outcome; `Err` means the
    /// store itself failed.
    #[instrument(skip_all, fields(task_key = %task.task_key, worker_id = %worker_id))]
    pub async fn run_task(
        &self,
        task: &Task,
        worker_id: &str,
        run_id: Uuid,
    ) -> Result<TaskOutcome> {
        let vcs = &self.collaborators.vcs;
        if let Err(e) = vcs.create_worker_branch(worker_id).await {
            let reason = format!("workspace: {e:#}");
            warn!("could not prepare worker branch: {e:#}");
            return Ok(TaskOutcome {
                task_key: task.task_key.clone(),
                status: TaskStatus::Failed,
                reason: Some(reason),
                pre_implemented: false,
                invocations: 0,
            });
        }

        match vcs.workspace_dir(worker_id) {
            Some(dir) if dir != self.project_dir => {
                debug!(workspace = %dir.display(), "running in worker checkout");
                self.in_workspace(dir)
                    .run_in_place(task, worker_id, run_id)
                    .await
            }
            _ => self.run_in_place(task, worker_id, run_id).await,
        }
    }

    async fn run_in_place(
        &self,
        task: &Task,
        worker_id: &str,
        run_id: Uuid,
    ) -> Result<TaskOutcome> {
        let mut run = TaskRun {
            task,
            worker_id,
            run_id,
            attempts: HashMap::new(),
            invocations: 0,
        };

        let mut ending = match task.task_type {
            TaskType::Implement => self.run_implement(&mut run).await?,
            TaskType::VerifyOnly => self.run_verify_only(&mut run).await?,
        };

        let vcs = &self.collaborators.vcs;
        if ending.status.is_terminal_success() {
            if let Err(e) = vcs.integrate(worker_id).await {
                warn!("integration into the main line failed: {e:#}");
                ending = Ending {
                    status: TaskStatus::Blocked,
                    reason: Some(format!("integrate: {e:#}")),
                    pre_implemented: ending.pre_implemented,
                };
            }
        }
        if !ending.status.is_terminal_success() {
            if let Err(e) = vcs.rollback_to_main(worker_id).await {
                warn!("rollback after failed task did not complete: {e:#}");
            }
        }

        info!(
            status = %ending.status,
            invocations = run.invocations,
            reason = ending.reason.as_deref().unwrap_or(""),
            "task finished"
        );
        Ok(TaskOutcome {
            task_key: task.task_key.clone(),
            status: ending.status,
            reason: ending.reason,
            pre_implemented: ending.pre_implemented,
            invocations: run.invocations,
        })
    }

    async fn run_implement(&self, run: &mut TaskRun<'_>) -> Result<Ending> {
        let red = self.red_stage(run).await?;
        if !red.success {
            return Ok(Ending::blocked(&red));
        }
        let pre_implemented = red.pre_implemented;

        if let Some(reason) = self.static_review_gate(run).await? {
            return Ok(Ending {
                status: TaskStatus::BlockedStaticReview,
                reason: Some(reason),
                pre_implemented,
            });
        }

        if pre_implemented {
            info!("implementation already present, skipping GREEN");
        } else {
            let green = self.green_stage(run).await?;
            if !green.success {
                return Ok(Ending::blocked(&green));
            }
        }

        let verify = self.verify_stage(run, Stage::Verify).await?;
        let verify = self.fix_loop(run, verify).await?;
        if !verify.success {
            return Ok(Ending::blocked(&verify));
        }

        if let Some(ending) = self.refactor_stage(run).await? {
            return Ok(ending);
        }

        Ok(Ending::success(pre_implemented))
    }

    async fn run_verify_only(&self, run: &mut TaskRun<'_>) -> Result<Ending> {
        let verify = self.verify_stage(run, Stage::Verify).await?;
        let verify = self.fix_loop(run, verify).await?;
        if !verify.success {
            return Ok(Ending::blocked(&verify));
        }
        Ok(Ending::success(true))
    }

    // ========================================================================
    // Stages
    // ========================================================================

    async fn red_stage(&self, run: &mut TaskRun<'_>) -> Result<StageResult> {
        let task = run.task;
        let attempt = run.next_attempt(Stage::Red);
        let request = self.request(task, Stage::Red, prompts::red_prompt(task), None, attempt);
        let agent = self.collaborators.agent.clone();
        let runner = self.collaborators.runner.clone();
        let impl_path = task.impl_file.as_ref().map(|f| self.project_dir.join(f));

        let work = async move {
            if let Err(e) = agent.generate(&request).await {
                return StageResult::failed(Stage::Red, "", format!("agent error: {e:#}"));
            }
            let outcome = runner.run_tests(&task.test_file).await;
            let impl_exists = impl_path.as_ref().is_some_and(|p| p.exists());
            evaluate_red(outcome, task.impl_file.as_deref(), impl_exists)
        };
        self.invoke(run, Stage::Red, attempt, work).await
    }

    /// `Some(reason)` when static review still blocks after the fix loop.
    async fn static_review_gate(&self, run: &mut TaskRun<'_>) -> Result<Option<String>> {
        if !self.config.static_review {
            return Ok(None);
        }
        let task = run.task;
        let Some(mut review) = self.review(&task.test_file).await else {
            return Ok(None);
        };
        if !review.is_blocking {
            return Ok(None);
        }

        let mut tracker = self.fix_tracker();
        loop {
            let (allowed, why) = tracker.can_attempt();
            if !allowed {
                let listed: Vec<String> = review.issues().iter().map(Issue::key).collect();
                return Ok(Some(format!(
                    "static review blocking ({}): {why}",
                    listed.join(", ")
                )));
            }
            tracker.record_attempt(&review.issues());

            let attempt = run.next_attempt(Stage::RedFix);
            let request = self.request(
                task,
                Stage::RedFix,
                prompts::red_fix_prompt(task, &review.violations),
                None,
                attempt,
            );
            let fix = self
                .invoke(run, Stage::RedFix, attempt, self.agent_work(request))
                .await?;
            if fix.skipped {
                return Ok(Some(format!("static review blocking: {}", fix.reason())));
            }

            match self.review(&task.test_file).await {
                Some(next) if next.is_blocking => review = next,
                _ => return Ok(None),
            }
        }
    }

    async fn green_stage(&self, run: &mut TaskRun<'_>) -> Result<StageResult> {
        let task = run.task;
        let mut last: Option<StageResult> = None;

        for n in 1..=self.config.max_green_attempts {
            let attempt = run.next_attempt(Stage::Green);
            let model_override = if n >= 2 {
                self.config.escalation_model.clone()
            } else {
                None
            };
            let previous_output = last.as_ref().map(|r| r.output.as_str()).unwrap_or("");
            let request = self.request(
                task,
                Stage::Green,
                prompts::green_prompt(task, previous_output, n),
                model_override,
                attempt,
            );
            let agent = self.collaborators.agent.clone();
            let runner = self.collaborators.runner.clone();

            let work = async move {
                if let Err(e) = agent.generate(&request).await {
                    return StageResult::failed(Stage::Green, "", format!("agent error: {e:#}"));
                }
                let outcome = runner.run_tests(&task.test_file).await;
                StageResult::from_run(Stage::Green, outcome, "tests still failing")
            };
            let result = self.invoke(run, Stage::Green, attempt, work).await?;
            if result.success {
                return Ok(result);
            }
            debug!(attempt = n, "GREEN attempt failed");
            last = Some(result);
        }

        let attempts = self.config.max_green_attempts;
        Ok(match last {
            Some(mut result) => {
                result.error = Some(format!(
                    "{} after {attempts} attempt(s)",
                    result.reason()
                ));
                result
            }
            None => StageResult::failed(Stage::Green, "", "no GREEN attempts configured"),
        })
    }

    async fn verify_stage(&self, run: &mut TaskRun<'_>, stage: Stage) -> Result<StageResult> {
        let task = run.task;
        let attempt = run.next_attempt(stage);
        let runner = self.collaborators.runner.clone();
        let work = async move {
            let verify = runner
                .verify_all(&task.test_file, task.impl_file.as_deref())
                .await;
            StageResult::from_verify(stage, verify)
        };
        self.invoke(run, stage, attempt, work).await
    }

    /// FIX -> RE_VERIFY until verification passes or the tracker stops it.
    async fn fix_loop(&self, run: &mut TaskRun<'_>, mut last: StageResult) -> Result<StageResult> {
        let task = run.task;
        let mut tracker = self.fix_tracker();
        loop {
            if last.success || last.skipped {
                return Ok(last);
            }
            if last.issues.is_empty() {
                last.error = Some(format!("{}; no issues to fix", last.reason()));
                return Ok(last);
            }
            let (allowed, why) = tracker.can_attempt();
            if !allowed {
                last.error = Some(format!("{}; {why}", last.reason()));
                return Ok(last);
            }
            tracker.record_attempt(&last.issues);

            let attempt = run.next_attempt(Stage::Fix);
            let request = self.request(
                task,
                Stage::Fix,
                prompts::fix_prompt(task, &last.issues, &last.output),
                None,
                attempt,
            );
            let fix = self
                .invoke(run, Stage::Fix, attempt, self.agent_work(request))
                .await?;
            if !fix.success {
                return Ok(fix);
            }
            last = self.verify_stage(run, Stage::ReVerify).await?;
        }
    }

    /// Advisory refactor. Only a failed re-verification after it blocks.
    async fn refactor_stage(&self, run: &mut TaskRun<'_>) -> Result<Option<Ending>> {
        let task = run.task;
        let Some(impl_file) = task.impl_file.as_deref() else {
            return Ok(None);
        };
        let path = self.project_dir.join(impl_file);
        let check = match check_needs_refactor(&path, &self.config.refactor) {
            Ok(check) => check,
            Err(e) => {
                warn!("refactor check failed: {e:#}");
                return Ok(None);
            }
        };
        if !check.needs_refactor {
            return Ok(None);
        }

        let attempt = run.next_attempt(Stage::Refactor);
        let request = self.request(
            task,
            Stage::Refactor,
            prompts::refactor_prompt(task, &check),
            None,
            attempt,
        );
        let refactor = self
            .invoke(run, Stage::Refactor, attempt, self.agent_work(request))
            .await?;
        if refactor.skipped {
            return Ok(None);
        }
        if !refactor.success {
            warn!(reason = %refactor.reason(), "refactor failed, continuing");
        }

        let reverify = self.verify_stage(run, Stage::ReVerify).await?;
        let reverify = self.fix_loop(run, reverify).await?;
        if reverify.success {
            Ok(None)
        } else {
            Ok(Some(Ending::blocked(&reverify)))
        }
    }

    // ========================================================================
    // Invocation plumbing
    // ========================================================================

    /// Guard `work` with the breakers, then log, count and report it.
    async fn invoke<F>(
        &self,
        run: &mut TaskRun<'_>,
        stage: Stage,
        attempt: u32,
        work: F,
    ) -> Result<StageResult>
    where
        F: Future<Output = StageResult>,
    {
        let task = run.task;
        let scopes = Scope::for_stage(stage, run.worker_id);
        let started_at = Utc::now();

        // dropped on any early return, which frees a half-open probe slot
        let admission = match self.breakers.try_acquire(&scopes)? {
            Acquire::Admitted(admission) => admission,
            Acquire::Rejected(scope) => {
                let reason = OrchestratorError::CircuitOpen {
                    level: scope.level,
                    identifier: scope.identifier,
                }
                .to_string();
                warn!(stage = %stage, "{reason}, skipping stage");
                self.bus.publish(OrchestratorEvent::StageSkipped {
                    task_key: task.task_key.clone(),
                    stage,
                    reason: reason.clone(),
                });
                let result = StageResult::skipped(stage, reason);
                self.record_attempt(task, &result, attempt, started_at)?;
                return Ok(result);
            }
        };

        log_stage_start!(self.bus, task.task_key, stage, attempt);
        let clock = Instant::now();
        let result = work.await;
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.db.record_invocation(&Invocation {
            run_id: run.run_id,
            stage,
            worker_id: run.worker_id.to_string(),
            task_key: task.task_key.clone(),
            duration_ms,
            timestamp: Utc::now(),
        })?;
        run.invocations += 1;
        self.bus.publish(OrchestratorEvent::InvocationRecorded {
            run_id: run.run_id.to_string(),
            stage,
            worker_id: run.worker_id.to_string(),
            task_key: task.task_key.clone(),
        });

        self.record_attempt(task, &result, attempt, started_at)?;
        admission.record(result.success)?;
        log_stage_complete!(self.bus, task.task_key, stage, attempt, result.success, duration_ms);

        if result.success {
            self.after_success(task, run.worker_id, stage).await;
        }
        Ok(result)
    }

    /// Lint autofix and commit. Failures here never fail the stage.
    async fn after_success(&self, task: &Task, worker_id: &str, stage: Stage) {
        if self.config.auto_lint_fix && stage.uses_agent() {
            let targets = task.impl_file.iter().chain(std::iter::once(&task.test_file));
            for file in targets {
                let outcome = self.collaborators.runner.lint_fix(file).await;
                if !outcome.passed {
                    debug!(file = %file, "lint autofix left issues");
                }
            }
        }

        let vcs = &self.collaborators.vcs;
        match vcs.has_uncommitted_changes(worker_id).await {
            Ok(true) => {
                let message = format!("{stage}: {} {}", task.task_key, task.title);
                if let Err(e) = vcs.commit_changes(worker_id, &message).await {
                    warn!("commit after {stage} failed: {e:#}");
                }
            }
            Ok(false) => {}
            Err(e) => warn!("could not inspect working tree: {e:#}"),
        }
    }

    fn record_attempt(
        &self,
        task: &Task,
        result: &StageResult,
        attempt: u32,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        self.db.record_stage_attempt(&StageAttempt {
            task_key: task.task_key.clone(),
            stage: result.stage,
            attempt_number: attempt,
            success: result.success,
            error_message: result.error.clone(),
            output: (!result.output.is_empty())
                .then(|| truncate_output(&result.output, ATTEMPT_OUTPUT_LIMIT)),
            test_exit_code: result.exit_code,
            started_at,
        })
    }

    fn request(
        &self,
        task: &Task,
        stage: Stage,
        prompt: String,
        model_override: Option<String>,
        attempt: u32,
    ) -> AgentRequest {
        AgentRequest {
            stage,
            task_key: task.task_key.clone(),
            prompt,
            model_override,
            attempt,
        }
    }

    fn agent_work(
        &self,
        request: AgentRequest,
    ) -> impl Future<Output = StageResult> + Send + 'static {
        let agent = self.collaborators.agent.clone();
        async move {
            match agent.generate(&request).await {
                Ok(output) => StageResult::ok(request.stage, output),
                Err(e) => StageResult::failed(request.stage, "", format!("agent error: {e:#}")),
            }
        }
    }

    async fn review(&self, test_file: &str) -> Option<ReviewResult> {
        match self.collaborators.reviewer.check_file(test_file).await {
            Ok(review) => Some(review),
            Err(e) => {
                warn!("static review unavailable: {e:#}");
                None
            }
        }
    }

    fn fix_tracker(&self) -> RedFixAttemptTracker {
        RedFixAttemptTracker::new(
            self.config.max_fix_attempts,
            Duration::from_secs(self.config.fix_timeout_secs),
        )
    }
}
