//! Error taxonomy shared across the daemon.
//!
//! Collaborator-class failures (install command, liveness probe, git status
//! refresh) degrade a worktree to a usable-but-flagged state and are recorded
//! as activity events; they never abort a lifecycle operation. Every other
//! class aborts the one operation it occurred in, leaving the offset table
//! and worktree registry untouched.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid project configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A git operation failed after all applicable fallbacks.
    #[error("git operation failed: {0}")]
    GitOperation(String),

    /// The dev-server (or install) process could not be spawned.
    #[error("failed to spawn process: {0}")]
    ProcessSpawn(String),

    /// Every positive multiple of the offset step is already held.
    #[error("no port offset available (step {step})")]
    NoOffsetAvailable { step: u16 },

    /// No worktree registered under this id.
    #[error("worktree not found: {0}")]
    WorktreeNotFound(String),

    /// A lifecycle operation is already in flight for this worktree.
    #[error("operation already in progress for worktree '{0}'")]
    OperationInProgress(String),

    /// The worktree is not in a state that permits this operation.
    #[error("worktree '{id}' is {actual} — operation requires {required}")]
    InvalidState {
        id: String,
        actual: &'static str,
        required: &'static str,
    },

    /// External-collaborator failure: degrades, never aborts.
    #[error("{0}")]
    Collaborator(String),
}

impl Error {
    pub fn git(context: &str, e: git2::Error) -> Self {
        Error::GitOperation(format!("{context}: {}", e.message()))
    }
}

impl From<git2::Error> for Error {
    fn from(e: git2::Error) -> Self {
        Error::GitOperation(e.message().to_string())
    }
}
