//! Typed error hierarchy for the studio engine.
//!
//! One enum per subsystem:
//! - `WorkspaceError`: session directory and command failures
//! - `GenerationError`: model provider failures
//! - `PreviewError`: live preview process failures
//! - `OrchestratorError`: workflow entry point failures

use std::path::PathBuf;

use thiserror::Error;

use crate::session::Phase;

/// Errors from the workspace capability.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Project for session {session} does not exist")]
    MissingProject { session: String },

    #[error("Path escapes the session workspace: {path}")]
    PathTraversal { path: String },

    #[error("File not found: {path}")]
    MissingFile { path: String },

    #[error("Invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("Search text not found in {path}")]
    SearchNotFound { path: String },

    #[error("Command timed out after {secs}s: {command}")]
    CommandTimeout { command: String, secs: u64 },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the generation adapter.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Provider rate limit reached: {0}")]
    RateLimited(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Failed to spawn generation process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Generation I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GenerationError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// Errors from the preview process pool.
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("No free port in {base}..{end}")]
    PortExhausted { base: u16, end: u16 },

    #[error("Failed to spawn preview process: {0}")]
    Spawn(String),

    #[error("All {max} preview slots are busy starting up")]
    AtCapacity { max: usize },

    #[error("No preview process for session {0}")]
    NotFound(String),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// Errors surfaced by the orchestration entry points.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No plan found for session {session}")]
    NoPlanFound { session: String },

    #[error("Cannot move session {session} from {from} to {to}")]
    InvalidTransition {
        session: String,
        from: Phase,
        to: Phase,
    },

    #[error("Repair failed: {0}")]
    RepairFailed(String),

    #[error("Planner returned an empty plan for session {session}")]
    EmptyPlan { session: String },

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Preview(#[from] PreviewError),

    #[error("Session store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
