//! Circuit breakers across tasks, runs and restarts

use super::common::*;
use tdd_orchestrator::circuit_breaker::{CircuitBreakerRegistry, Scope};
use tdd_orchestrator::config::{BreakerSettings, BreakersConfig};
use tdd_orchestrator::database::Database;
use tdd_orchestrator::models::NewTask;
use tdd_orchestrator::worker_pool::StopReason;
use tdd_orchestrator_sdk::{
    BreakerLevel, CircuitState, EventBus, OrchestratorEvent, RunOutcome, Stage, TaskStatus,
};

fn hair_trigger() -> BreakerSettings {
    BreakerSettings {
        failure_threshold: 1,
        failure_rate: None,
        ..BreakerSettings::default()
    }
}

#[tokio::test]
async fn test_open_stage_breaker_skips_stage_for_later_tasks() {
    let runner = ScriptedRunner::red_then_green();
    runner.queue_tests("tests/test_a.py", RunOutcome::fail("1 failed"));
    runner.queue_tests("tests/test_a.py", RunOutcome::fail("1 failed"));
    let fakes = Fakes::new(runner);
    let db = Database::open_in_memory().unwrap();
    db.insert_tasks(&[
        NewTask::new("TDD-00", 0, 0)
            .test_file("tests/test_a.py")
            .impl_file("src/a.py"),
        NewTask::new("TDD-01", 0, 1)
            .test_file("tests/test_b.py")
            .impl_file("src/b.py"),
    ])
    .unwrap();
    let project = tempfile::tempdir().unwrap();

    let mut config = orchestrator_config();
    config.pool.max_workers = 1;
    config.pool.halt_on_task_failure = false;
    config.pipeline.max_green_attempts = 1;
    config.breakers.stage = hair_trigger();
    let orch = orchestrator(&db, &config, &fakes, project.path());
    let mut rx = orch.bus().subscribe();

    let result = orch.run(false).await.unwrap();

    assert_eq!(result.tasks_failed, 2);
    let second = db.get_task("TDD-01").unwrap().unwrap();
    assert_eq!(second.status, TaskStatus::Blocked);

    // GREEN ran once (TDD-00); TDD-01 never reached the agent for it
    let green_requests = fakes
        .agent
        .requests()
        .into_iter()
        .filter(|r| r.stage == Stage::Green)
        .count();
    assert_eq!(green_requests, 1);

    let attempts = db.get_stage_attempts("TDD-01").unwrap();
    let skipped = attempts.iter().find(|a| a.stage == Stage::Green).unwrap();
    assert!(!skipped.success);
    assert!(skipped
        .error_message
        .as_deref()
        .unwrap()
        .contains("circuit open at stage scope 'green'"));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::StageSkipped {
            task_key,
            stage: Stage::Green,
            ..
        } if task_key == "TDD-01"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::CircuitStateChanged {
            level: BreakerLevel::Stage,
            new_state: CircuitState::Open,
            ..
        }
    )));
    // skipped stages are not invocations: 2 for TDD-00, RED only for TDD-01
    assert_eq!(result.total_invocations, 3);
}

#[test]
fn test_open_breaker_survives_restart_until_reset() {
    let db = Database::open_in_memory().unwrap();
    let config = BreakersConfig {
        stage: hair_trigger(),
        ..BreakersConfig::default()
    };

    let first = CircuitBreakerRegistry::new(db.clone(), config.clone(), EventBus::new()).unwrap();
    first
        .record_outcome(&Scope::for_stage(Stage::Green, "worker-1"), false)
        .unwrap();
    assert!(first.is_rejecting(BreakerLevel::Stage, "green").unwrap());

    let second = CircuitBreakerRegistry::new(db.clone(), config.clone(), EventBus::new()).unwrap();
    assert!(second.is_rejecting(BreakerLevel::Stage, "green").unwrap());
    assert!(!second.is_rejecting(BreakerLevel::Worker, "worker-1").unwrap());
    let record = second.get(BreakerLevel::Stage, "green").unwrap().unwrap();
    assert_eq!(record.state, CircuitState::Open);
    assert!(record.cooldown_until.is_some());

    second.reset(BreakerLevel::Stage, "green").unwrap();
    let third = CircuitBreakerRegistry::new(db, config, EventBus::new()).unwrap();
    assert!(!third.is_rejecting(BreakerLevel::Stage, "green").unwrap());
    assert_eq!(
        third.get(BreakerLevel::Stage, "green").unwrap().unwrap().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_open_system_breaker_halts_before_dispatch() {
    let fakes = Fakes::new(ScriptedRunner::red_then_green());
    let db = Database::open_in_memory().unwrap();
    db.insert_tasks(&[NewTask::new("TDD-00", 0, 0).impl_file("src/a.py")])
        .unwrap();
    let project = tempfile::tempdir().unwrap();

    let mut config = orchestrator_config();
    config.breakers.system = hair_trigger();
    let tripped =
        CircuitBreakerRegistry::new(db.clone(), config.breakers.clone(), EventBus::new()).unwrap();
    tripped.record_outcome(&[Scope::system()], false).unwrap();

    let orch = orchestrator(&db, &config, &fakes, project.path());
    let result = orch.run(false).await.unwrap();

    assert_eq!(result.stopped_reason, StopReason::CircuitOpen);
    assert_eq!(result.tasks_completed + result.tasks_failed, 0);
    assert!(fakes.agent.requests().is_empty());
    assert_eq!(
        db.get_task("TDD-00").unwrap().unwrap().status,
        TaskStatus::Pending
    );
}
