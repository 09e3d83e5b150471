//! `StaticReviewer` that checks generated pytest files for real assertions.
//!
//! Blocking: a missing file, a file without test functions, or a test
//! function with no assertion. Advisory: assertions that are always true.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tdd_orchestrator_sdk::{async_trait, ReviewResult, StaticReviewer, Violation};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct AssertionReviewer {
    root: Option<PathBuf>,
}

impl AssertionReviewer {
    /// Resolve relative paths against `root`.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    fn resolve(&self, file: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(file),
            None => PathBuf::from(file),
        }
    }
}

#[async_trait]
impl StaticReviewer for AssertionReviewer {
    async fn check_file(&self, file: &str) -> Result<ReviewResult> {
        let path = self.resolve(file);
        let source = match tokio::fs::read_to_string(&path).await {
            Ok(source) => source,
            Err(e) => {
                return Ok(ReviewResult::from_violations(vec![Violation {
                    pattern: "missing_test_file".into(),
                    location: file.to_string(),
                    message: format!("cannot read test file: {e}"),
                    blocking: true,
                }]))
            }
        };
        let result = review_source(file, &source);
        debug!(
            file,
            violations = result.violations.len(),
            blocking = result.is_blocking,
            "reviewed"
        );
        Ok(result)
    }

    fn in_workspace(&self, dir: &Path) -> Option<Arc<dyn StaticReviewer>> {
        Some(Arc::new(Self::new(Some(dir.to_path_buf()))))
    }
}

pub fn review_source(file: &str, source: &str) -> ReviewResult {
    let lines: Vec<&str> = source.lines().collect();
    let mut violations = Vec::new();
    let mut test_count = 0;

    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        let Some(name) = trimmed
            .strip_prefix("def ")
            .or_else(|| trimmed.strip_prefix("async def "))
            .filter(|rest| rest.starts_with("test"))
            .map(|rest| rest.split('(').next().unwrap_or(rest))
        else {
            continue;
        };
        test_count += 1;

        let indent = line.len() - trimmed.len();
        let body = lines[idx + 1..]
            .iter()
            .take_while(|l| l.trim().is_empty() || l.len() - l.trim_start().len() > indent);
        let asserts = body
            .filter(|l| {
                let t = l.trim_start();
                t.starts_with("assert ") || t.contains("pytest.raises") || t.contains(".assert_")
            })
            .count();
        if asserts == 0 {
            violations.push(Violation {
                pattern: "test_without_assertion".into(),
                location: format!("{file}:{}", idx + 1),
                message: format!("test '{name}' asserts nothing"),
                blocking: true,
            });
        }
    }

    if test_count == 0 {
        violations.push(Violation {
            pattern: "no_tests".into(),
            location: file.to_string(),
            message: "file defines no test functions".into(),
            blocking: true,
        });
    }

    for (idx, line) in lines.iter().enumerate() {
        if let Some(expr) = line.trim().strip_prefix("assert ") {
            if is_trivial(expr) {
                violations.push(Violation {
                    pattern: "trivial_assertion".into(),
                    location: format!("{file}:{}", idx + 1),
                    message: format!("assertion is always true: assert {expr}"),
                    blocking: false,
                });
            }
        }
    }

    ReviewResult::from_violations(violations)
}

fn is_trivial(expr: &str) -> bool {
    let expr = expr.split(',').next().unwrap_or(expr).trim();
    if matches!(expr, "True" | "1" | "not False" | "not None") {
        return true;
    }
    for op in [" == ", " is "] {
        if let Some((lhs, rhs)) = expr.split_once(op) {
            return lhs.trim() == rhs.trim();
        }
    }
    false
}
