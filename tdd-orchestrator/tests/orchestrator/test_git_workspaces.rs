//! Two workers against a real git repository in per-worker branch mode

use super::common::*;
use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tdd_orchestrator::collaborators::GitCoordinator;
use tdd_orchestrator::config::GitConfig;
use tdd_orchestrator::database::Database;
use tdd_orchestrator::models::NewTask;
use tdd_orchestrator::pipeline::Collaborators;
use tdd_orchestrator::worker_pool::StopReason;
use tdd_orchestrator::Orchestrator;
use tdd_orchestrator_sdk::{
    async_trait, AgentRequest, CodeAgent, EventBus, NoOpReviewer, Stage, TaskStatus,
};

/// Agent that writes each task's files into whatever directory it works in.
#[derive(Clone)]
struct WorkspaceAgent {
    root: Option<PathBuf>,
    files: Arc<HashMap<String, (String, String)>>,
    refuse_green: Arc<HashSet<String>>,
}

impl WorkspaceAgent {
    fn write(&self, relative: &str, contents: &str) -> Result<()> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| anyhow!("agent has no workspace"))?;
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[async_trait]
impl CodeAgent for WorkspaceAgent {
    async fn generate(&self, request: &AgentRequest) -> Result<String> {
        let (test_file, impl_file) = self
            .files
            .get(&request.task_key)
            .ok_or_else(|| anyhow!("unknown task {}", request.task_key))?;
        match request.stage {
            Stage::Red => self.write(test_file, "def test_it():\n    assert it() == 1\n")?,
            Stage::Green if self.refuse_green.contains(&request.task_key) => {
                return Err(anyhow!("cannot implement {}", request.task_key))
            }
            Stage::Green => self.write(impl_file, "def it():\n    return 1\n")?,
            _ => {}
        }
        Ok(format!("{} done", request.stage))
    }

    fn in_workspace(&self, dir: &Path) -> Option<Arc<dyn CodeAgent>> {
        Some(Arc::new(Self {
            root: Some(dir.to_path_buf()),
            ..self.clone()
        }))
    }
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn seeded_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-q"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir, &["config", "user.email", "ci@example.com"]);
    git(dir, &["config", "user.name", "ci"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    std::fs::write(dir.join("README.md"), "seed\n").unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", "seed"]);
}

#[tokio::test]
async fn test_failed_task_rollback_spares_the_peer_worker() {
    if !git_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let repo = root.path().join("repo");
    seeded_repo(&repo);

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

    let files: HashMap<String, (String, String)> = [
        ("TDD-00", "tests/test_a.py", "src/a.py"),
        ("TDD-01", "tests/test_b.py", "src/b.py"),
    ]
    .into_iter()
    .map(|(key, test, imp)| (key.to_string(), (test.to_string(), imp.to_string())))
    .collect();
    let agent = WorkspaceAgent {
        root: None,
        files: Arc::new(files),
        refuse_green: Arc::new(HashSet::from(["TDD-01".to_string()])),
    };
    let vcs = GitCoordinator::new(
        &repo,
        GitConfig {
            worktrees_dir: Some(root.path().join("worktrees")),
            ..GitConfig::default()
        },
    );
    let collaborators = Collaborators {
        agent: Arc::new(agent),
        runner: Arc::new(ScriptedRunner::red_then_green()),
        reviewer: Arc::new(NoOpReviewer),
        vcs: Arc::new(vcs),
    };

    let mut config = orchestrator_config();
    config.pool.max_workers = 2;
    config.pool.halt_on_task_failure = false;
    let orch = Orchestrator::new(db.clone(), &config, collaborators, EventBus::new(), repo.clone())
        .unwrap();

    let result = orch.run(false).await.unwrap();

    assert_eq!(result.stopped_reason, StopReason::NoTasks);
    assert_eq!(result.tasks_completed, 1);
    assert_eq!(result.tasks_failed, 1);
    assert_eq!(
        db.get_task("TDD-00").unwrap().unwrap().status,
        TaskStatus::Complete
    );
    let failed = db.get_task("TDD-01").unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Blocked);

    // the finished task landed on main; the failed one left nothing behind
    assert!(repo.join("tests/test_a.py").exists());
    assert!(repo.join("src/a.py").exists());
    assert!(!repo.join("tests/test_b.py").exists());
    assert!(!repo.join("src/b.py").exists());
    assert!(git(&repo, &["status", "--porcelain"]).trim().is_empty());

    let subjects = git(&repo, &["log", "--format=%s", "main"]);
    assert!(subjects.lines().any(|s| s.starts_with("red: TDD-00")), "{subjects}");
    assert!(subjects.lines().any(|s| s.starts_with("green: TDD-00")), "{subjects}");
    assert!(subjects.lines().any(|s| s.starts_with("merge tdd/worker-")), "{subjects}");
    assert!(!subjects.contains("TDD-01"), "{subjects}");

    // every stage commit carries only its own task's files
    let log = git(&repo, &["log", "--format=%H %s", "main"]);
    for line in log.lines() {
        let (sha, subject) = line.split_once(' ').unwrap();
        if !(subject.starts_with("red:") || subject.starts_with("green:")) {
            continue;
        }
        let changed = git(&repo, &["show", "--name-only", "--format=", sha]);
        for file in changed.lines().filter(|l| !l.is_empty()) {
            assert!(
                file == "tests/test_a.py" || file == "src/a.py",
                "{subject} committed {file}"
            );
        }
    }
}
