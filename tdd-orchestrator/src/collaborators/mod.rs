//! Concrete implementations of the collaborator traits.
//!
//! Each one wraps an external program (`pytest`/`mypy`/`ruff`, the `claude`
//! CLI, `git`) through the shared subprocess helper in [`process`].

pub mod agent;
pub mod git;
pub mod process;
pub mod review;
pub mod runner;

pub use agent::ClaudeCliAgent;
pub use git::GitCoordinator;
pub use review::AssertionReviewer;
pub use runner::CommandRunner;
