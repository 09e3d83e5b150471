//! `ProcessRunner` backed by configurable test/type/lint commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tdd_orchestrator_sdk::{async_trait, Issue, ProcessRunner, RunOutcome};
use tracing::{debug, warn};

use super::process::run_command;
use crate::config::RunnerConfig;

pub struct CommandRunner {
    config: RunnerConfig,
}

impl CommandRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn run(&self, template: &[String], files: &[String]) -> RunOutcome {
        let argv = render_command(template, files);
        let cwd: Option<PathBuf> = self.config.working_dir.clone();
        let limit = self.config.output_limit_bytes;

        match run_command(&argv, cwd.as_deref(), self.timeout(), limit).await {
            Ok(output) if output.timed_out => RunOutcome::timeout(output.combined()),
            Ok(output) => {
                let text = output.combined();
                let issues = if output.success {
                    Vec::new()
                } else {
                    parse_issues(&text)
                };
                debug!(
                    command = %argv.join(" "),
                    passed = output.success,
                    issues = issues.len(),
                    "command finished"
                );
                RunOutcome {
                    passed: output.success,
                    output: text,
                    exit_code: output.exit_code,
                    timed_out: false,
                    issues,
                }
            }
            Err(e) => {
                warn!(command = %argv.join(" "), "command could not start: {e:#}");
                RunOutcome {
                    passed: false,
                    output: format!("{e:#}"),
                    exit_code: None,
                    timed_out: false,
                    issues: Vec::new(),
                }
            }
        }
    }
}

#[async_trait]
impl ProcessRunner for CommandRunner {
    async fn run_tests(&self, file: &str) -> RunOutcome {
        self.run(&self.config.test_command, &[file.to_string()]).await
    }

    async fn check_types(&self, file: &str) -> RunOutcome {
        self.run(&self.config.type_check_command, &[file.to_string()])
            .await
    }

    async fn lint(&self, file: &str) -> RunOutcome {
        self.run(&self.config.lint_command, &[file.to_string()]).await
    }

    fn in_workspace(&self, dir: &Path) -> Option<Arc<dyn ProcessRunner>> {
        let mut config = self.config.clone();
        config.working_dir = Some(dir.to_path_buf());
        Some(Arc::new(Self::new(config)))
    }

    async fn lint_fix(&self, file: &str) -> RunOutcome {
        if self.config.lint_fix_command.is_empty() {
            return RunOutcome::pass("");
        }
        self.run(&self.config.lint_fix_command, &[file.to_string()])
            .await
    }

    async fn run_test_batch(&self, files: &[String]) -> RunOutcome {
        if files.is_empty() {
            return RunOutcome::pass("no test files");
        }
        self.run(&self.config.batch_test_command, files).await
    }
}

/// Substitute `{file}` (first file) inside arguments and expand a bare
/// `{files}` argument into one argument per file.
pub fn render_command(template: &[String], files: &[String]) -> Vec<String> {
    let first = files.first().map(String::as_str).unwrap_or("");
    let mut argv = Vec::with_capacity(template.len() + files.len());
    for part in template {
        if part == "{files}" {
            argv.extend(files.iter().cloned());
        } else {
            argv.push(part.replace("{file}", first));
        }
    }
    argv
}

/// Extract structured issues from tool output.
///
/// Understands `path:line[:col]: message` diagnostics (mypy, ruff, flake8)
/// and pytest `FAILED path::test - reason` summary lines.
pub fn parse_issues(output: &str) -> Vec<Issue> {
    output
        .lines()
        .filter_map(|line| parse_pytest_failure(line).or_else(|| parse_diagnostic(line)))
        .collect()
}

fn parse_pytest_failure(line: &str) -> Option<Issue> {
    let rest = line.trim().strip_prefix("FAILED ")?;
    let (location, message) = match rest.split_once(" - ") {
        Some((loc, msg)) => (loc.trim(), msg.trim()),
        None => (rest.trim(), ""),
    };
    Some(Issue::new("test_failure", location, message))
}

fn parse_diagnostic(line: &str) -> Option<Issue> {
    let (path, rest) = line.split_once(':')?;
    let path = path.trim_start();
    if path.is_empty() || path.contains(char::is_whitespace) {
        return None;
    }
    let (line_no, rest) = rest.split_once(':')?;
    if line_no.is_empty() || !line_no.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    // Optional column
    let rest = match rest.split_once(':') {
        Some((col, tail)) if !col.is_empty() && col.chars().all(|c| c.is_ascii_digit()) => tail,
        _ => rest,
    };
    let message = rest.trim();
    if message.is_empty() {
        return None;
    }

    Some(Issue::new(
        diagnostic_code(message),
        format!("{path}:{line_no}"),
        message,
    ))
}

/// `[code]` suffix (mypy) or leading rule id (ruff/flake8).
fn diagnostic_code(message: &str) -> String {
    if let Some(code) = message
        .strip_suffix(']')
        .and_then(|m| m.rsplit_once('['))
        .map(|(_, code)| code)
    {
        if !code.is_empty() && !code.contains(' ') {
            return code.to_string();
        }
    }
    let first = message.split_whitespace().next().unwrap_or("");
    if !first.is_empty()
        && first.chars().any(|c| c.is_ascii_digit())
        && first.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return first.to_string();
    }
    "diagnostic".to_string()
}
