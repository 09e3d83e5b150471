//! Bounded fix-loop guard.
//!
//! A [`RedFixAttemptTracker`] stops a fix loop when it has run out of
//! attempts, when it starts cycling between the same broken states, or when
//! it has been running for too long. The wall-clock guard is checked between
//! attempts; it never interrupts one.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use tdd_orchestrator_sdk::Issue;

#[derive(Debug, Clone)]
pub struct RedFixAttemptTracker {
    max_attempts: u32,
    aggregate_timeout: Duration,
    started: Instant,
    fingerprints: Vec<String>,
}

impl RedFixAttemptTracker {
    pub fn new(max_attempts: u32, aggregate_timeout: Duration) -> Self {
        Self {
            max_attempts,
            aggregate_timeout,
            started: Instant::now(),
            fingerprints: Vec::new(),
        }
    }

    /// Canonical fingerprint of an issue set: sorted, deduplicated
    /// `pattern:location` keys joined with `|`.
    pub fn fingerprint(issues: &[Issue]) -> String {
        issues
            .iter()
            .map(Issue::key)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Record one attempt made against `issues`; returns its fingerprint.
    pub fn record_attempt(&mut self, issues: &[Issue]) -> String {
        let fingerprint = Self::fingerprint(issues);
        self.fingerprints.push(fingerprint.clone());
        fingerprint
    }

    /// Whether another attempt may run, and why not.
    pub fn can_attempt(&self) -> (bool, String) {
        if self.is_oscillating() {
            return (false, "Oscillation detected".to_string());
        }
        if self.attempts() >= self.max_attempts {
            return (
                false,
                format!("Max fix attempts exceeded ({})", self.max_attempts),
            );
        }
        if self.started.elapsed() > self.aggregate_timeout {
            return (
                false,
                format!(
                    "Aggregate fix timeout exceeded ({}s)",
                    self.aggregate_timeout.as_secs()
                ),
            );
        }
        (true, String::new())
    }

    /// The newest fingerprint repeats an earlier one (A -> B -> A).
    fn is_oscillating(&self) -> bool {
        match self.fingerprints.split_last() {
            Some((newest, earlier)) => earlier.contains(newest),
            None => false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.fingerprints.len() as u32
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[cfg(test)]
    fn started_ago(mut self, ago: Duration) -> Self {
        if let Some(earlier) = Instant::now().checked_sub(ago) {
            self.started = earlier;
        }
        self
    }
}
