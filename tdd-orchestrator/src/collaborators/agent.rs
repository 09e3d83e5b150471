//! `CodeAgent` that shells out to the `claude` CLI in print mode.

use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tdd_orchestrator_sdk::{async_trait, AgentRequest, CodeAgent};
use tracing::{info, instrument};

use super::process::run_command;
use crate::config::AgentConfig;

/// Agent output beyond this is truncated before it reaches the attempt log.
const AGENT_OUTPUT_LIMIT: usize = 200_000;

pub struct ClaudeCliAgent {
    config: AgentConfig,
}

impl ClaudeCliAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Full argv for one request.
    pub fn command_for(&self, request: &AgentRequest) -> Vec<String> {
        let mut argv = vec![
            self.config.program.clone(),
            "-p".to_string(),
            request.prompt.clone(),
        ];
        if let Some(model) = request
            .model_override
            .as_ref()
            .or(self.config.model.as_ref())
        {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }
        argv.extend(self.config.extra_args.iter().cloned());
        argv
    }
}

#[async_trait]
impl CodeAgent for ClaudeCliAgent {
    #[instrument(
        skip_all,
        fields(task_key = %request.task_key, stage = %request.stage, attempt = request.attempt)
    )]
    async fn generate(&self, request: &AgentRequest) -> Result<String> {
        let argv = self.command_for(request);
        let output = run_command(
            &argv,
            self.config.working_dir.as_deref(),
            Duration::from_secs(self.config.timeout_secs),
            AGENT_OUTPUT_LIMIT,
        )
        .await?;

        if output.timed_out {
            return Err(anyhow!(
                "agent timed out after {}s",
                self.config.timeout_secs
            ));
        }
        if !output.success {
            return Err(anyhow!(
                "agent exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            ));
        }

        info!(bytes = output.stdout.len(), "agent finished");
        Ok(output.stdout)
    }

    fn in_workspace(&self, dir: &Path) -> Option<Arc<dyn CodeAgent>> {
        let mut config = self.config.clone();
        config.working_dir = Some(dir.to_path_buf());
        Some(Arc::new(Self::new(config)))
    }
}
