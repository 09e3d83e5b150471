//! Stage prompt rendering
//!
//! Each agent-driven stage gets the task context (goal, acceptance criteria,
//! files, exports) plus whatever the previous stage left behind: review
//! violations for RED_FIX, test output for GREEN, issues for FIX.

use tdd_orchestrator_sdk::{Issue, Violation};

use crate::models::Task;
use crate::refactor_check::RefactorCheck;

fn task_context(task: &Task) -> String {
    let mut out = format!("# Task {}: {}\n\n", task.task_key, task.title);
    if !task.goal.is_empty() {
        out.push_str(&format!("## Goal\n{}\n\n", task.goal));
    }
    if !task.acceptance_criteria.is_empty() {
        out.push_str("## Acceptance criteria\n");
        for criterion in &task.acceptance_criteria {
            out.push_str(&format!("- {criterion}\n"));
        }
        out.push('\n');
    }
    out.push_str(&format!("## Files\n- test: {}\n", task.test_file));
    if let Some(impl_file) = &task.impl_file {
        out.push_str(&format!("- implementation: {impl_file}\n"));
    }
    if !task.module_exports.is_empty() {
        out.push_str(&format!(
            "\n## Required exports\n{}\n",
            task.module_exports.join(", ")
        ));
    }
    out
}

fn issue_list(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(|i| format!("- [{}] {} {}", i.pattern, i.location, i.message))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn red_prompt(task: &Task) -> String {
    format!(
        "{}\nWrite failing pytest tests in {} that cover every acceptance criterion. \
         Do not write the implementation.",
        task_context(task),
        task.test_file
    )
}

pub fn red_fix_prompt(task: &Task, violations: &[Violation]) -> String {
    let listed: Vec<Issue> = violations.iter().map(Violation::as_issue).collect();
    format!(
        "{}\nStatic review rejected {}:\n{}\n\nFix the tests so every test asserts real behaviour.",
        task_context(task),
        task.test_file,
        issue_list(&listed)
    )
}

pub fn green_prompt(task: &Task, test_output: &str, attempt: u32) -> String {
    let retry = if attempt > 1 {
        format!("\nThis is attempt {attempt}; the previous attempt did not make the tests pass.\n")
    } else {
        String::new()
    };
    format!(
        "{}\nWrite the minimal implementation that makes {} pass.{}\n## Current test output\n{}",
        task_context(task),
        task.test_file,
        retry,
        test_output
    )
}

pub fn refactor_prompt(task: &Task, check: &RefactorCheck) -> String {
    let reasons = check
        .reasons
        .iter()
        .map(|r| format!("- {r}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{}\nRefactor the implementation without changing behaviour. \
         Tests must keep passing.\n\n## Findings\n{}",
        task_context(task),
        reasons
    )
}

pub fn fix_prompt(task: &Task, issues: &[Issue], output: &str) -> String {
    format!(
        "{}\nVerification failed. Fix these issues:\n{}\n\n## Verification output\n{}",
        task_context(task),
        issue_list(issues),
        output
    )
}
