//! Task ingestion from decomposition output
//!
//! Accepts a YAML batch (either a bare list or a `tasks:` mapping, optionally
//! wrapped in a markdown code fence) and inserts it in one transaction. The
//! scheduler never re-derives dependencies, so everything it needs to know is
//! settled here:
//!
//! - a task whose `impl_file` an earlier task already owns becomes
//!   `verify-only` unless it sets `task_type` explicitly
//! - dependency cycles are detected eagerly and reported (or rejected)
//! - dependencies on unknown keys are reported and kept; at runtime they
//!   count as satisfied

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use tdd_orchestrator_sdk::{Complexity, TaskType};
use tracing::{info, instrument, warn};

use crate::database::Database;
use crate::models::{NewTask, TaskFilter};

/// One task as written by the decomposition step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_key: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub test_file: String,
    #[serde(default)]
    pub impl_file: Option<String>,
    #[serde(default)]
    pub phase: i64,
    /// Position within the phase; defaults to file order.
    #[serde(default)]
    pub sequence: Option<i64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    /// Explicit type; inferred when absent.
    #[serde(default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub module_exports: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<TaskSpec>),
    Wrapped { tasks: Vec<TaskSpec> },
}

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Fail instead of warning when the batch contains a dependency cycle.
    pub reject_cycles: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub inserted: usize,
    /// Keys ingested as `verify-only` because their implementation file overlaps.
    pub verify_only: Vec<String>,
    /// Keys on a dependency cycle; these will never become ready.
    pub cycles: Vec<String>,
    /// `(task_key, missing dependency)` pairs.
    pub unknown_dependencies: Vec<(String, String)>,
}

/// Strip a surrounding markdown code fence, if any.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

pub fn parse_task_specs(text: &str) -> Result<Vec<TaskSpec>> {
    let yaml = strip_fence(text).trim_start_matches("---").trim();
    let file: TaskFile = serde_yaml::from_str(yaml).context("parse task YAML")?;
    Ok(match file {
        TaskFile::List(tasks) | TaskFile::Wrapped { tasks } => tasks,
    })
}

pub fn load_task_file(path: &Path) -> Result<Vec<TaskSpec>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_task_specs(&text).with_context(|| format!("load tasks from {}", path.display()))
}

/// Keys that sit on a dependency cycle among `specs`.
///
/// Kahn's algorithm removes every node reachable from a root; the same pass
/// over reversed edges then drops nodes that merely depend on a cycle.
pub fn find_cycles(specs: &[TaskSpec]) -> Vec<String> {
    let keys: HashSet<&str> = specs.iter().map(|s| s.task_key.as_str()).collect();
    let edges: Vec<(&str, &str)> = specs
        .iter()
        .flat_map(|s| {
            s.depends_on
                .iter()
                .filter(|d| keys.contains(d.as_str()))
                .map(move |d| (d.as_str(), s.task_key.as_str()))
        })
        .collect();

    let remaining = kahn_remaining(&keys, edges.iter().copied());
    let reversed = edges
        .iter()
        .filter(|(a, b)| remaining.contains(a) && remaining.contains(b))
        .map(|&(a, b)| (b, a));
    let on_cycle = kahn_remaining(&remaining, reversed);

    on_cycle
        .into_iter()
        .map(String::from)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Nodes left after repeatedly removing nodes with no incoming edge.
fn kahn_remaining<'a>(
    nodes: &HashSet<&'a str>,
    edges: impl Iterator<Item = (&'a str, &'a str)>,
) -> HashSet<&'a str> {
    let mut indegree: HashMap<&str, usize> = nodes.iter().map(|n| (*n, 0)).collect();
    let mut out: HashMap<&str, Vec<&str>> = HashMap::new();
    for (from, to) in edges {
        *indegree.entry(to).or_insert(0) += 1;
        out.entry(from).or_default().push(to);
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    while let Some(node) = queue.pop_front() {
        indegree.remove(node);
        for next in out.get(node).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }
    indegree.into_keys().collect()
}

/// Validate, classify and insert `specs` in file order.
#[instrument(skip_all, fields(count = specs.len()))]
pub fn ingest_tasks(
    db: &Database,
    specs: &[TaskSpec],
    options: &IngestOptions,
) -> Result<IngestReport> {
    let mut seen = HashSet::new();
    for spec in specs {
        if spec.task_key.trim().is_empty() {
            bail!("task with empty task_key");
        }
        if !seen.insert(spec.task_key.as_str()) {
            bail!("duplicate task_key '{}'", spec.task_key);
        }
        if db.get_task(&spec.task_key)?.is_some() {
            bail!("task '{}' already exists", spec.task_key);
        }
    }

    let mut report = IngestReport {
        cycles: find_cycles(specs),
        ..Default::default()
    };
    if !report.cycles.is_empty() {
        if options.reject_cycles {
            return Err(anyhow!(
                "dependency cycle among: {}",
                report.cycles.join(", ")
            ));
        }
        warn!(tasks = ?report.cycles, "dependency cycle; these tasks will never become ready");
    }

    let existing = db.list_tasks(&TaskFilter::default())?;
    let mut owned_impls: HashSet<String> =
        existing.iter().filter_map(|t| t.impl_file.clone()).collect();
    let known_keys: HashSet<&str> = existing
        .iter()
        .map(|t| t.task_key.as_str())
        .chain(specs.iter().map(|s| s.task_key.as_str()))
        .collect();

    let mut tasks = Vec::with_capacity(specs.len());
    for (idx, spec) in specs.iter().enumerate() {
        for dep in &spec.depends_on {
            if !known_keys.contains(dep.as_str()) {
                warn!(
                    task_key = %spec.task_key,
                    dependency = %dep,
                    "unknown dependency treated as satisfied"
                );
                report
                    .unknown_dependencies
                    .push((spec.task_key.clone(), dep.clone()));
            }
        }

        let overlaps = spec
            .impl_file
            .as_ref()
            .is_some_and(|f| !owned_impls.insert(f.clone()));
        let task_type = match spec.task_type {
            Some(explicit) => explicit,
            None if overlaps => TaskType::VerifyOnly,
            None => TaskType::Implement,
        };
        if task_type == TaskType::VerifyOnly {
            report.verify_only.push(spec.task_key.clone());
        }

        tasks.push(NewTask {
            task_key: spec.task_key.clone(),
            title: spec.title.clone().unwrap_or_else(|| spec.task_key.clone()),
            goal: spec.goal.clone(),
            acceptance_criteria: spec.acceptance_criteria.clone(),
            test_file: spec.test_file.clone(),
            impl_file: spec.impl_file.clone(),
            phase: spec.phase,
            sequence: spec.sequence.unwrap_or(idx as i64),
            depends_on: spec.depends_on.clone(),
            complexity: spec.complexity,
            task_type,
            module_exports: spec.module_exports.clone(),
        });
    }

    report.inserted = db.insert_tasks(&tasks)?;
    info!(
        inserted = report.inserted,
        verify_only = report.verify_only.len(),
        "tasks ingested"
    );
    Ok(report)
}
