//! Worktree lifecycle: state machine, git plumbing, and secret-file seeding.

pub mod git;
pub mod manager;
pub mod secrets;

pub use manager::{GitStatusSnapshot, WorktreeInfo, WorktreeManager, WorktreeStatus};
