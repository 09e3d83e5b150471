//! Deterministic "does this file need a refactor" check.
//!
//! Generated implementation files are Python, so function and class extents
//! are found from `def`/`class` headers and indentation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::RefactorThresholds;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefactorCheck {
    /// Any threshold exceeded.
    pub needs_refactor: bool,
    /// Hard line limit exceeded.
    pub must_refactor: bool,
    pub line_count: usize,
    pub reasons: Vec<String>,
}

/// Check the file at `path`. A missing file never needs a refactor.
pub fn check_needs_refactor(path: &Path, thresholds: &RefactorThresholds) -> Result<RefactorCheck> {
    if !path.exists() {
        return Ok(RefactorCheck::default());
    }
    let source =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(analyze_source(&source, thresholds))
}

pub fn analyze_source(source: &str, thresholds: &RefactorThresholds) -> RefactorCheck {
    let lines: Vec<&str> = source.lines().collect();
    let mut check = RefactorCheck {
        line_count: lines.len(),
        ..Default::default()
    };

    if lines.len() > thresholds.hard_max_lines {
        check.must_refactor = true;
        check.reasons.push(format!(
            "file has {} lines (MUST refactor above {})",
            lines.len(),
            thresholds.hard_max_lines
        ));
    } else if lines.len() > thresholds.soft_max_lines {
        check.reasons.push(format!(
            "file has {} lines (consider refactoring above {})",
            lines.len(),
            thresholds.soft_max_lines
        ));
    }

    for block in find_blocks(&lines) {
        match block.kind {
            BlockKind::Function => {
                if block.len() > thresholds.max_function_lines {
                    check.reasons.push(format!(
                        "function '{}' is {} lines (max {})",
                        block.name,
                        block.len(),
                        thresholds.max_function_lines
                    ));
                }
            }
            BlockKind::Class => {
                let methods = count_methods(&lines, &block);
                if methods >= thresholds.max_class_methods {
                    check.reasons.push(format!(
                        "class '{}' has {} methods (limit {})",
                        block.name, methods, thresholds.max_class_methods
                    ));
                }
            }
        }
    }

    check.needs_refactor = !check.reasons.is_empty();
    check
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Function,
    Class,
}

#[derive(Debug)]
struct Block {
    kind: BlockKind,
    name: String,
    indent: usize,
    start: usize,
    /// Index of the last non-blank line of the body.
    end: usize,
}

impl Block {
    fn len(&self) -> usize {
        self.end - self.start + 1
    }
}

fn indent_of(line: &str) -> usize {
    line.chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

fn is_code(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

fn header(line: &str) -> Option<(BlockKind, String)> {
    let trimmed = line.trim_start();
    let (kind, rest) = if let Some(rest) = trimmed.strip_prefix("async def ") {
        (BlockKind::Function, rest)
    } else if let Some(rest) = trimmed.strip_prefix("def ") {
        (BlockKind::Function, rest)
    } else if let Some(rest) = trimmed.strip_prefix("class ") {
        (BlockKind::Class, rest)
    } else {
        return None;
    };
    let name: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then_some((kind, name))
}

fn find_blocks(lines: &[&str]) -> Vec<Block> {
    let mut blocks = Vec::new();
    for (start, line) in lines.iter().enumerate() {
        let Some((kind, name)) = header(line) else {
            continue;
        };
        let indent = indent_of(line);
        let mut end = start;
        for (offset, body) in lines[start + 1..].iter().enumerate() {
            if !is_code(body) {
                continue;
            }
            if indent_of(body) <= indent {
                break;
            }
            end = start + 1 + offset;
        }
        blocks.push(Block {
            kind,
            name,
            indent,
            start,
            end,
        });
    }
    blocks
}

fn count_methods(lines: &[&str], class: &Block) -> usize {
    let body = &lines[class.start + 1..=class.end];
    let Some(body_indent) = body
        .iter()
        .find(|l| is_code(l))
        .map(|l| indent_of(l))
        .filter(|i| *i > class.indent)
    else {
        return 0;
    };
    body.iter()
        .filter(|l| indent_of(l) == body_indent)
        .filter(|l| matches!(header(l), Some((BlockKind::Function, _))))
        .count()
}
