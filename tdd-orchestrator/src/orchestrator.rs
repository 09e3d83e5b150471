//! Wiring: builds the breakers, pipeline and pool from one configuration.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tdd_orchestrator_sdk::{EventBus, NoOpVcs, VcsCoordinator};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::collaborators::{AssertionReviewer, ClaudeCliAgent, CommandRunner, GitCoordinator};
use crate::config::OrchestratorConfig;
use crate::database::Database;
use crate::pipeline::{Collaborators, PipelineEngine};
use crate::worker_pool::{RunResult, WorkerPool};

/// Real collaborators rooted at `project_dir`.
///
/// Relative runner/agent working directories default to the project; git is
/// replaced by a no-op when disabled.
pub fn collaborators_from_config(config: &OrchestratorConfig, project_dir: &Path) -> Collaborators {
    let mut runner = config.runner.clone();
    runner
        .working_dir
        .get_or_insert_with(|| project_dir.to_path_buf());
    let mut agent = config.agent.clone();
    agent
        .working_dir
        .get_or_insert_with(|| project_dir.to_path_buf());

    let vcs: Arc<dyn VcsCoordinator> = if config.git.enabled {
        let repo = config
            .git
            .repo_dir
            .clone()
            .unwrap_or_else(|| project_dir.to_path_buf());
        Arc::new(GitCoordinator::new(repo, config.git.clone()))
    } else {
        Arc::new(NoOpVcs)
    };

    Collaborators {
        agent: Arc::new(ClaudeCliAgent::new(agent)),
        runner: Arc::new(CommandRunner::new(runner)),
        reviewer: Arc::new(AssertionReviewer::new(Some(project_dir.to_path_buf()))),
        vcs,
    }
}

pub struct Orchestrator {
    db: Database,
    breakers: Arc<CircuitBreakerRegistry>,
    pool: WorkerPool,
    bus: EventBus,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        config: &OrchestratorConfig,
        collaborators: Collaborators,
        bus: EventBus,
        project_dir: PathBuf,
    ) -> Result<Self> {
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            db.clone(),
            config.breakers.clone(),
            bus.clone(),
        )?);
        let pipeline = Arc::new(PipelineEngine::new(
            db.clone(),
            breakers.clone(),
            collaborators.clone(),
            bus.clone(),
            config.pipeline.clone(),
            project_dir,
        ));
        let pool = WorkerPool::new(
            db.clone(),
            pipeline,
            breakers.clone(),
            &collaborators,
            bus.clone(),
            config.pool.clone(),
        );
        Ok(Self {
            db,
            breakers,
            pool,
            bus,
        })
    }

    pub async fn run(&self, resume: bool) -> Result<RunResult> {
        self.pool.run_all_phases(resume).await
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}
