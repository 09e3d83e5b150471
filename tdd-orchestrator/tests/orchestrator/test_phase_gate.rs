//! Phase gates between phases, driven through the worker pool

use super::common::*;
use tdd_orchestrator::database::Database;
use tdd_orchestrator::models::NewTask;
use tdd_orchestrator::phase_gate::PhaseGateValidator;
use tdd_orchestrator::worker_pool::StopReason;
use tdd_orchestrator_sdk::{OrchestratorEvent, RunOutcome, TaskStatus};

fn two_phase_batch() -> Vec<NewTask> {
    vec![
        NewTask::new("TDD-00", 0, 0)
            .test_file("tests/test_models.py")
            .impl_file("src/models.py"),
        NewTask::new("TDD-01", 1, 0)
            .test_file("tests/test_service.py")
            .impl_file("src/service.py"),
    ]
}

#[tokio::test]
async fn test_blocked_earlier_task_fails_the_next_gate() {
    let runner = ScriptedRunner::red_then_green();
    // RED passes with no implementation on disk: false positive
    runner.queue_tests("tests/test_models.py", RunOutcome::pass("1 passed"));
    let fakes = Fakes::new(runner);
    let db = Database::open_in_memory().unwrap();
    db.insert_tasks(&two_phase_batch()).unwrap();
    let project = tempfile::tempdir().unwrap();

    let mut config = orchestrator_config();
    config.pool.halt_on_task_failure = false;
    let orch = orchestrator(&db, &config, &fakes, project.path());
    let mut rx = orch.bus().subscribe();

    let result = orch.run(false).await.unwrap();

    assert_eq!(result.stopped_reason, StopReason::GateFailure);
    assert_eq!(result.phases_run, vec![0]);
    let gate = result.gate_failure.unwrap();
    assert_eq!(gate.phase, 1);
    assert_eq!(gate.incomplete_tasks, vec!["TDD-00".to_string()]);
    assert_eq!(gate.regression_runs, 0);

    assert_eq!(
        db.get_task("TDD-00").unwrap().unwrap().status,
        TaskStatus::Blocked
    );
    assert_eq!(
        db.get_task("TDD-01").unwrap().unwrap().status,
        TaskStatus::Pending
    );
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::PhaseGateFailed { phase: 1, .. })));
}

#[tokio::test]
async fn test_regression_in_earlier_phase_names_the_failing_file() {
    let runner = ScriptedRunner::new();
    runner.break_file("tests/test_models.py");
    let fakes = Fakes::new(runner);
    let db = Database::open_in_memory().unwrap();
    let mut batch = two_phase_batch();
    batch.push(
        NewTask::new("TDD-02", 0, 1)
            .test_file("tests/test_repo.py")
            .impl_file("src/repo.py"),
    );
    db.insert_tasks(&batch).unwrap();
    db.update_task_status("TDD-00", TaskStatus::Complete).unwrap();
    db.update_task_status("TDD-02", TaskStatus::Passing).unwrap();
    let project = tempfile::tempdir().unwrap();

    let orch = orchestrator(&db, &orchestrator_config(), &fakes, project.path());
    let result = orch.run(false).await.unwrap();

    assert_eq!(result.stopped_reason, StopReason::GateFailure);
    assert!(result.phases_run.is_empty());
    let gate = result.gate_failure.unwrap();
    assert_eq!(gate.failed_files, vec!["tests/test_models.py".to_string()]);
    // one batch plus one re-run per file
    assert_eq!(gate.regression_runs, 3);
    assert!(fakes.agent.requests().is_empty());
}

#[tokio::test]
async fn test_validator_passes_once_earlier_phases_are_green() {
    let fakes = Fakes::new(ScriptedRunner::new());
    let db = Database::open_in_memory().unwrap();
    db.insert_tasks(&two_phase_batch()).unwrap();
    db.update_task_status("TDD-00", TaskStatus::Complete).unwrap();

    let gate = PhaseGateValidator::new(db.clone(), fakes.runner.clone());
    let result = gate.validate_phase(1).await.unwrap();

    assert!(result.passed);
    assert_eq!(result.regression_runs, 1);
    assert_eq!(fakes.runner.calls(), vec!["batch:tests/test_models.py"]);
}

#[tokio::test]
async fn test_disabled_gates_let_later_phases_run() {
    let runner = ScriptedRunner::red_then_green();
    runner.queue_tests("tests/test_models.py", RunOutcome::pass("1 passed"));
    let fakes = Fakes::new(runner);
    let db = Database::open_in_memory().unwrap();
    db.insert_tasks(&two_phase_batch()).unwrap();
    let project = tempfile::tempdir().unwrap();

    let mut config = orchestrator_config();
    config.pool.halt_on_task_failure = false;
    config.pool.enable_phase_gates = false;
    let orch = orchestrator(&db, &config, &fakes, project.path());

    let result = orch.run(false).await.unwrap();

    assert_eq!(result.stopped_reason, StopReason::NoTasks);
    assert_eq!(result.phases_run, vec![0, 1]);
    assert_eq!(result.tasks_completed, 1);
    assert_eq!(result.tasks_failed, 1);
    assert_eq!(
        db.get_task("TDD-01").unwrap().unwrap().status,
        TaskStatus::Complete
    );
}
