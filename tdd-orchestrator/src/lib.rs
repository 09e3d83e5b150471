// Task store
pub mod database;
pub mod models;

// Error taxonomy
pub mod error;

// Configuration and logging
pub mod config;
pub mod logging;

// Failure containment
pub mod circuit_breaker;
pub mod fix_tracker;

// Per-task pipeline
pub mod pipeline;
pub mod refactor_check;

// Scheduling
pub mod phase_gate;
pub mod validation;
pub mod worker_pool;

// External collaborators
pub mod collaborators;

// Ingestion, wiring and metrics
pub mod ingest;
pub mod metrics;
pub mod orchestrator;

pub use error::OrchestratorError;
pub use orchestrator::{collaborators_from_config, Orchestrator};
