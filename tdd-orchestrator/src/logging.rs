//! Diagnostic tracing for the orchestrator.
//!
//! Orchestration events (`OrchestratorEvent`) are logged as JSON under the
//! `tdd_orchestrator::events` target, so `RUST_LOG` controls them together
//! with ordinary diagnostics.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_filter` when unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=tdd_orchestrator=debug,tdd_orchestrator::events=warn tdd-orchestrator run
/// ```
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // try_init: a second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
