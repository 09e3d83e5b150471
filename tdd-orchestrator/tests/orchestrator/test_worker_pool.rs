//! Worker pool runs: phases, halts, budgets and stale-claim recovery

use super::common::*;
use tdd_orchestrator::database::Database;
use tdd_orchestrator::models::{NewTask, RunStatus, WorkerStatus};
use tdd_orchestrator::worker_pool::StopReason;
use tdd_orchestrator_sdk::{OrchestratorEvent, RunOutcome, TaskStatus};

fn task(key: &str, phase: i64, sequence: i64) -> NewTask {
    let stem = key.to_lowercase().replace('-', "_");
    NewTask::new(key, phase, sequence)
        .test_file(format!("tests/test_{stem}.py"))
        .impl_file(format!("src/{stem}.py"))
}

#[tokio::test]
async fn test_run_completes_every_phase() {
    let fakes = Fakes::new(ScriptedRunner::red_then_green());
    let db = Database::open_in_memory().unwrap();
    db.insert_tasks(&[
        task("TDD-00", 0, 0),
        task("TDD-01", 0, 1).depends_on(&["TDD-00"]),
        task("TDD-02", 1, 0),
    ])
    .unwrap();
    let project = tempfile::tempdir().unwrap();
    let orch = orchestrator(&db, &orchestrator_config(), &fakes, project.path());
    let mut rx = orch.bus().subscribe();

    let result = orch.run(false).await.unwrap();

    assert_eq!(result.stopped_reason, StopReason::NoTasks);
    assert_eq!(result.phases_run, vec![0, 1]);
    assert_eq!(result.tasks_completed, 3);
    assert_eq!(result.tasks_failed, 0);
    assert_eq!(result.total_invocations, 9);
    assert!(result.stranded_tasks.is_empty());
    assert!(result.gate_failure.is_none());

    let validation = result.validation.unwrap();
    assert!(validation.passed);
    assert_eq!(validation.files_checked, 3);

    // stats describe the last phase only
    let last_phase: usize = result.worker_stats.iter().map(|w| w.tasks_completed).sum();
    assert_eq!(last_phase, 1);
    assert_eq!(result.worker_stats.len(), 2);

    let run = db.get_latest_run().unwrap().unwrap();
    assert_eq!(run.id, result.run_id);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.validation_status.as_deref(), Some("passed"));

    let workers = db.get_workers(result.run_id).unwrap();
    assert_eq!(workers.len(), 2);
    assert!(workers
        .iter()
        .all(|w| w.status == WorkerStatus::Idle && w.current_task.is_none()));

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(OrchestratorEvent::RunStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(OrchestratorEvent::RunCompleted { status, .. }) if status == "completed"
    ));
    for key in ["TDD-00", "TDD-01", "TDD-02"] {
        assert_eq!(
            db.get_task(key).unwrap().unwrap().status,
            TaskStatus::Complete
        );
    }
}

#[tokio::test]
async fn test_dependency_is_finished_before_dependent_starts() {
    let fakes = Fakes::new(ScriptedRunner::red_then_green());
    let db = Database::open_in_memory().unwrap();
    db.insert_tasks(&[
        task("TDD-00", 0, 0),
        task("TDD-01", 0, 1).depends_on(&["TDD-00"]),
    ])
    .unwrap();
    let project = tempfile::tempdir().unwrap();
    let orch = orchestrator(&db, &orchestrator_config(), &fakes, project.path());

    orch.run(false).await.unwrap();

    let keys: Vec<String> = fakes
        .agent
        .requests()
        .into_iter()
        .map(|r| r.task_key)
        .collect();
    let last_parent = keys.iter().rposition(|k| k == "TDD-00").unwrap();
    let first_child = keys.iter().position(|k| k == "TDD-01").unwrap();
    assert!(last_parent < first_child, "{keys:?}");
}

#[tokio::test]
async fn test_task_failure_halts_the_run() {
    let runner = ScriptedRunner::red_then_green();
    runner.queue_tests("tests/test_tdd_00.py", RunOutcome::pass("1 passed"));
    let fakes = Fakes::new(runner);
    let db = Database::open_in_memory().unwrap();
    db.insert_tasks(&[task("TDD-00", 0, 0), task("TDD-01", 0, 1), task("TDD-02", 1, 0)])
        .unwrap();
    let project = tempfile::tempdir().unwrap();
    let mut config = orchestrator_config();
    config.pool.max_workers = 1;
    let orch = orchestrator(&db, &config, &fakes, project.path());

    let result = orch.run(false).await.unwrap();

    assert_eq!(result.stopped_reason, StopReason::TaskFailure);
    assert_eq!(result.phases_run, vec![0]);
    assert_eq!(result.tasks_failed, 1);
    assert!(result.validation.is_none());
    assert_eq!(
        db.get_task("TDD-00").unwrap().unwrap().status,
        TaskStatus::Blocked
    );
    assert_eq!(
        db.get_task("TDD-01").unwrap().unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(
        db.get_latest_run().unwrap().unwrap().status,
        RunStatus::Failed
    );
}

#[tokio::test]
async fn test_dependents_of_blocked_task_stay_pending() {
    let runner = ScriptedRunner::red_then_green();
    runner.queue_tests("tests/test_tdd_00.py", RunOutcome::pass("1 passed"));
    let fakes = Fakes::new(runner);
    let db = Database::open_in_memory().unwrap();
    db.insert_tasks(&[
        task("TDD-00", 0, 0),
        task("TDD-01", 0, 1).depends_on(&["TDD-00"]),
        task("TDD-02", 0, 2),
    ])
    .unwrap();
    let project = tempfile::tempdir().unwrap();
    let mut config = orchestrator_config();
    config.pool.halt_on_task_failure = false;
    config.pool.enable_phase_gates = false;
    let orch = orchestrator(&db, &config, &fakes, project.path());

    let result = orch.run(false).await.unwrap();

    assert_eq!(result.stopped_reason, StopReason::NoTasks);
    assert_eq!(result.tasks_completed, 1);
    assert_eq!(result.tasks_failed, 1);
    assert_eq!(
        db.get_task("TDD-01").unwrap().unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(db.unmet_dependencies("TDD-01").unwrap(), vec!["TDD-00"]);
    assert_eq!(result.stranded_tasks, vec!["TDD-01".to_string()]);
}

#[tokio::test]
async fn test_invocation_budget_stops_dispatch() {
    let fakes = Fakes::new(ScriptedRunner::red_then_green());
    let db = Database::open_in_memory().unwrap();
    db.insert_tasks(&[task("TDD-00", 0, 0), task("TDD-01", 0, 1)])
        .unwrap();
    let project = tempfile::tempdir().unwrap();
    let mut config = orchestrator_config();
    config.pool.max_workers = 1;
    config.pool.max_invocations_per_session = 2;
    let orch = orchestrator(&db, &config, &fakes, project.path());
    let mut rx = orch.bus().subscribe();

    let result = orch.run(false).await.unwrap();

    assert_eq!(result.stopped_reason, StopReason::InvocationLimit);
    assert_eq!(result.tasks_completed, 1);
    // the budget is checked between tasks, so the running task finishes
    assert_eq!(result.total_invocations, 3);
    assert_eq!(
        db.get_task("TDD-01").unwrap().unwrap().status,
        TaskStatus::Pending
    );
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        OrchestratorEvent::BudgetExhausted {
            count: 3,
            limit: 2,
            ..
        }
    )));
}

#[tokio::test]
async fn test_resume_reclaims_abandoned_claim() {
    let fakes = Fakes::new(ScriptedRunner::red_then_green());
    let db = Database::open_in_memory().unwrap();
    db.insert_tasks(&[task("TDD-00", 0, 0)]).unwrap();
    assert!(db.claim_task("TDD-00", "worker-from-crashed-session").unwrap());
    let project = tempfile::tempdir().unwrap();
    let orch = orchestrator(&db, &orchestrator_config(), &fakes, project.path());

    // without resume the claim is left alone
    let result = orch.run(false).await.unwrap();
    assert_eq!(result.tasks_completed, 0);
    assert_eq!(
        db.get_task("TDD-00").unwrap().unwrap().status,
        TaskStatus::InProgress
    );

    let mut rx = orch.bus().subscribe();
    let result = orch.run(true).await.unwrap();

    assert_eq!(result.stopped_reason, StopReason::NoTasks);
    assert_eq!(result.tasks_completed, 1);
    let task = db.get_task("TDD-00").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::StaleClaimsRecovered { count: 1 })));
}

#[tokio::test]
async fn test_worker_stats_account_for_every_task() {
    let fakes = Fakes::new(ScriptedRunner::red_then_green());
    let db = Database::open_in_memory().unwrap();
    let batch: Vec<NewTask> = (0..6).map(|n| task(&format!("TDD-{n:02}"), 0, n)).collect();
    db.insert_tasks(&batch).unwrap();
    let project = tempfile::tempdir().unwrap();
    let mut config = orchestrator_config();
    config.pool.max_workers = 3;
    let orch = orchestrator(&db, &config, &fakes, project.path());

    let result = orch.run(false).await.unwrap();

    assert_eq!(result.tasks_completed, 6);
    let ids: Vec<&str> = result.worker_stats.iter().map(|w| w.worker_id.as_str()).collect();
    assert_eq!(ids, vec!["worker-1", "worker-2", "worker-3"]);
    let completed: usize = result.worker_stats.iter().map(|w| w.tasks_completed).sum();
    let invocations: u64 = result.worker_stats.iter().map(|w| w.invocations).sum();
    assert_eq!(completed, 6);
    assert_eq!(invocations, result.total_invocations);
    assert_eq!(invocations, 18);
}
