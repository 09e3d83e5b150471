//! Subprocess execution with a timeout and bounded output.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    /// stdout followed by stderr, as a single log.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Run `argv` to completion, killing it after `timeout`.
///
/// Only a spawn failure is an `Err`; non-zero exits and timeouts are reported
/// in the returned [`CommandOutput`].
#[instrument(skip_all, fields(program = argv.first().map(String::as_str).unwrap_or("")))]
pub async fn run_command(
    argv: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
    output_limit: usize,
) -> Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    debug!(args = ?args, "spawning");
    let child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", argv.join(" ")))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output.with_context(|| format!("wait for {program}"))?;
            Ok(CommandOutput {
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout: truncate_output(&String::from_utf8_lossy(&output.stdout), output_limit),
                stderr: truncate_output(&String::from_utf8_lossy(&output.stderr), output_limit),
                timed_out: false,
            })
        }
        Err(_) => {
            // Dropping the wait future drops the child, which kills it
            warn!(timeout_secs = timeout.as_secs(), "command timed out");
            Ok(CommandOutput {
                success: false,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("{program} timed out after {}s", timeout.as_secs()),
                timed_out: true,
            })
        }
    }
}

/// Keep at most `limit` bytes (on a char boundary) with a truncation marker.
pub fn truncate_output(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n[truncated {} bytes]\n",
        &text[..cut],
        text.len() - cut
    )
}
