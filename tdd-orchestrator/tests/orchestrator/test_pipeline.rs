//! Per-task stage machine with scripted collaborators

use super::common::*;
use tdd_orchestrator::models::{NewTask, Task};
use tdd_orchestrator_sdk::{Issue, RunOutcome, Stage, TaskStatus, TaskType, VerifyResult};
use uuid::Uuid;

const TEST_FILE: &str = "tests/test_calc.py";
const IMPL_FILE: &str = "src/calc.py";

fn insert(h: &PipelineHarness, task: NewTask) -> Task {
    let key = task.task_key.clone();
    h.db.insert_tasks(&[task]).unwrap();
    h.db.get_task(&key).unwrap().unwrap()
}

fn calc_task() -> NewTask {
    NewTask::new("TDD-00", 0, 0)
        .test_file(TEST_FILE)
        .impl_file(IMPL_FILE)
}

fn failing_types(location: &str) -> VerifyResult {
    VerifyResult {
        tests: RunOutcome::pass("1 passed"),
        types: RunOutcome::fail("error: incompatible type")
            .with_issues(vec![Issue::new("arg-type", location, "incompatible type")]),
        lint: RunOutcome::pass(""),
    }
}

fn attempt_stages(h: &PipelineHarness, key: &str) -> Vec<Stage> {
    h.db.get_stage_attempts(key)
        .unwrap()
        .into_iter()
        .map(|a| a.stage)
        .collect()
}

#[tokio::test]
async fn test_red_green_verify_completes() {
    let fakes = Fakes::new(ScriptedRunner::red_then_green());
    let h = pipeline_harness(&fakes, pipeline_config());
    let task = insert(&h, calc_task());
    let run_id = Uuid::new_v4();

    let outcome = h.engine.run_task(&task, "worker-1", run_id).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Complete);
    assert!(outcome.is_success());
    assert!(!outcome.pre_implemented);
    assert_eq!(outcome.invocations, 3);
    assert_eq!(fakes.agent.stages(), vec![Stage::Red, Stage::Green]);
    assert_eq!(
        attempt_stages(&h, "TDD-00"),
        vec![Stage::Red, Stage::Green, Stage::Verify]
    );
    assert_eq!(h.db.count_invocations(run_id).unwrap(), 3);

    let commits = fakes.vcs.commits();
    assert_eq!(commits.len(), 3);
    assert!(commits[0].starts_with("red: TDD-00"));
    assert!(fakes.vcs.rollbacks().is_empty());
}

#[tokio::test]
async fn test_existing_implementation_skips_green() {
    let fakes = Fakes::new(ScriptedRunner::new());
    let h = pipeline_harness(&fakes, pipeline_config());
    let impl_path = h.project.path().join(IMPL_FILE);
    std::fs::create_dir_all(impl_path.parent().unwrap()).unwrap();
    std::fs::write(&impl_path, "def add(a, b):\n    return a + b\n").unwrap();
    let task = insert(&h, calc_task());

    let outcome = h
        .engine
        .run_task(&task, "worker-1", Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Passing);
    assert!(outcome.pre_implemented);
    assert_eq!(fakes.agent.stages(), vec![Stage::Red]);
    assert_eq!(
        attempt_stages(&h, "TDD-00"),
        vec![Stage::Red, Stage::Verify]
    );
}

#[tokio::test]
async fn test_passing_red_without_implementation_blocks() {
    let fakes = Fakes::new(ScriptedRunner::new());
    let h = pipeline_harness(&fakes, pipeline_config());
    let task = insert(&h, calc_task());

    let outcome = h
        .engine
        .run_task(&task, "worker-1", Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Blocked);
    let reason = outcome.reason.unwrap();
    assert!(reason.starts_with("red:"), "{reason}");
    assert!(reason.contains("false positive"), "{reason}");
    assert_eq!(outcome.invocations, 1);
    assert_eq!(fakes.vcs.rollbacks(), vec!["worker-1".to_string()]);
}

#[tokio::test]
async fn test_second_green_attempt_escalates_model() {
    let runner = ScriptedRunner::new();
    runner.queue_tests(TEST_FILE, RunOutcome::fail("1 failed"));
    runner.queue_tests(TEST_FILE, RunOutcome::fail("still 1 failed"));
    let fakes = Fakes::new(runner);
    let h = pipeline_harness(&fakes, pipeline_config());
    let task = insert(&h, calc_task());

    let outcome = h
        .engine
        .run_task(&task, "worker-1", Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(outcome.status, TaskStatus::Complete);

    let green: Vec<_> = fakes
        .agent
        .requests()
        .into_iter()
        .filter(|r| r.stage == Stage::Green)
        .collect();
    assert_eq!(green.len(), 2);
    assert_eq!(green[0].model_override, None);
    assert_eq!(green[1].model_override.as_deref(), Some("opus"));
    assert_eq!(green[1].attempt, 2);
    assert!(green[1].prompt.contains("still 1 failed"));
}

#[tokio::test]
async fn test_green_exhaustion_blocks() {
    let runner = ScriptedRunner::new();
    for _ in 0..3 {
        runner.queue_tests(TEST_FILE, RunOutcome::fail("1 failed"));
    }
    let fakes = Fakes::new(runner);
    let h = pipeline_harness(&fakes, pipeline_config());
    let task = insert(&h, calc_task());

    let outcome = h
        .engine
        .run_task(&task, "worker-1", Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Blocked);
    assert!(outcome.reason.unwrap().contains("after 2 attempt(s)"));
    assert_eq!(outcome.invocations, 3);
    assert_eq!(fakes.vcs.rollbacks().len(), 1);
}

#[tokio::test]
async fn test_verify_failure_is_fixed_and_reverified() {
    let runner = ScriptedRunner::red_then_green();
    runner.queue_verify(failing_types("src/calc.py:3"));
    let fakes = Fakes::new(runner);
    let h = pipeline_harness(&fakes, pipeline_config());
    let task = insert(&h, calc_task());

    let outcome = h
        .engine
        .run_task(&task, "worker-1", Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Complete);
    assert_eq!(
        fakes.agent.stages(),
        vec![Stage::Red, Stage::Green, Stage::Fix]
    );
    assert_eq!(
        attempt_stages(&h, "TDD-00"),
        vec![
            Stage::Red,
            Stage::Green,
            Stage::Verify,
            Stage::Fix,
            Stage::ReVerify
        ]
    );
    let fix = fakes
        .agent
        .requests()
        .into_iter()
        .find(|r| r.stage == Stage::Fix)
        .unwrap();
    assert!(fix.prompt.contains("src/calc.py:3"));
}

#[tokio::test]
async fn test_repeating_verify_issues_stop_the_fix_loop() {
    let runner = ScriptedRunner::red_then_green();
    for _ in 0..3 {
        runner.queue_verify(failing_types("src/calc.py:3"));
    }
    let fakes = Fakes::new(runner);
    let h = pipeline_harness(&fakes, pipeline_config());
    let task = insert(&h, calc_task());

    let outcome = h
        .engine
        .run_task(&task, "worker-1", Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Blocked);
    assert!(outcome.reason.unwrap().contains("Oscillation detected"));
    let fixes = fakes
        .agent
        .stages()
        .into_iter()
        .filter(|s| *s == Stage::Fix)
        .count();
    assert_eq!(fixes, 2);
}

#[tokio::test]
async fn test_fix_loop_stops_at_max_attempts() {
    let runner = ScriptedRunner::red_then_green();
    runner.queue_verify(failing_types("src/calc.py:3"));
    runner.queue_verify(failing_types("src/calc.py:7"));
    runner.queue_verify(failing_types("src/calc.py:9"));
    let fakes = Fakes::new(runner);
    let h = pipeline_harness(&fakes, pipeline_config());
    let task = insert(&h, calc_task());

    let outcome = h
        .engine
        .run_task(&task, "worker-1", Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Blocked);
    let reason = outcome.reason.unwrap();
    assert!(reason.starts_with("re_verify:"), "{reason}");
    assert!(reason.contains("Max fix attempts exceeded (2)"), "{reason}");
}

#[tokio::test]
async fn test_verify_failure_without_issues_blocks() {
    let runner = ScriptedRunner::red_then_green();
    runner.queue_verify(VerifyResult {
        tests: RunOutcome::fail("collection error"),
        types: RunOutcome::pass(""),
        lint: RunOutcome::pass(""),
    });
    let fakes = Fakes::new(runner);
    let h = pipeline_harness(&fakes, pipeline_config());
    let task = insert(&h, calc_task());

    let outcome = h
        .engine
        .run_task(&task, "worker-1", Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Blocked);
    assert!(outcome.reason.unwrap().contains("no issues to fix"));
    assert!(!fakes.agent.stages().contains(&Stage::Fix));
}

#[tokio::test]
async fn test_verify_only_task_never_calls_the_agent() {
    let fakes = Fakes::new(ScriptedRunner::new());
    let h = pipeline_harness(&fakes, pipeline_config());
    let task = insert(&h, calc_task().task_type(TaskType::VerifyOnly));

    let outcome = h
        .engine
        .run_task(&task, "worker-1", Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Passing);
    assert_eq!(outcome.invocations, 1);
    assert!(fakes.agent.requests().is_empty());
    assert_eq!(fakes.runner.calls(), vec![format!("verify:{TEST_FILE}")]);
}

#[tokio::test]
async fn test_persistent_static_review_blocks_before_green() {
    let fakes =
        Fakes::new(ScriptedRunner::red_then_green()).with_reviewer(BlockingReviewer::times(5));
    let h = pipeline_harness(&fakes, pipeline_config());
    let task = insert(&h, calc_task());

    let outcome = h
        .engine
        .run_task(&task, "worker-1", Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::BlockedStaticReview);
    let reason = outcome.reason.unwrap();
    assert!(reason.contains("test_without_assertion"), "{reason}");
    assert_eq!(
        fakes.agent.stages(),
        vec![Stage::Red, Stage::RedFix, Stage::RedFix]
    );
    assert_eq!(fakes.vcs.rollbacks().len(), 1);
}

#[tokio::test]
async fn test_static_review_fixed_once_continues() {
    let fakes =
        Fakes::new(ScriptedRunner::red_then_green()).with_reviewer(BlockingReviewer::times(1));
    let h = pipeline_harness(&fakes, pipeline_config());
    let task = insert(&h, calc_task());

    let outcome = h
        .engine
        .run_task(&task, "worker-1", Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Complete);
    assert_eq!(
        fakes.agent.stages(),
        vec![Stage::Red, Stage::RedFix, Stage::Green]
    );
}

#[tokio::test]
async fn test_large_implementation_gets_refactored() {
    let fakes = Fakes::new(ScriptedRunner::red_then_green());
    let h = pipeline_harness(&fakes, pipeline_config());
    fakes.agent.write_on(
        Stage::Green,
        &h.project.path().join(IMPL_FILE),
        &"TOTAL = 1\n".repeat(450),
    );
    let task = insert(&h, calc_task());

    let outcome = h
        .engine
        .run_task(&task, "worker-1", Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Complete);
    assert_eq!(
        fakes.agent.stages(),
        vec![Stage::Red, Stage::Green, Stage::Refactor]
    );
    assert_eq!(
        attempt_stages(&h, "TDD-00"),
        vec![
            Stage::Red,
            Stage::Green,
            Stage::Verify,
            Stage::Refactor,
            Stage::ReVerify
        ]
    );
}

#[tokio::test]
async fn test_failed_refactor_does_not_block() {
    let fakes = Fakes::new(ScriptedRunner::red_then_green());
    let h = pipeline_harness(&fakes, pipeline_config());
    fakes.agent.write_on(
        Stage::Green,
        &h.project.path().join(IMPL_FILE),
        &"TOTAL = 1\n".repeat(450),
    );
    fakes.agent.fail_stage(Stage::Refactor, 1);
    let task = insert(&h, calc_task());

    let outcome = h
        .engine
        .run_task(&task, "worker-1", Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Complete);
    assert!(fakes.vcs.rollbacks().is_empty());
}
