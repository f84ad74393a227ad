//! RPC method handlers, grouped by namespace.
//!
//! Every handler takes raw params + the shared context and returns a JSON
//! value; error classification to RPC codes happens in the dispatcher.

pub mod activity;
pub mod daemon;
pub mod ports;
pub mod worktree;
