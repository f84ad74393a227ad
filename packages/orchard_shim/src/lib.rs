//! Socket interposition shim for port-virtualized worktrees.
//!
//! Built as a cdylib and injected into a dev server's process tree via
//! `LD_PRELOAD` (Linux) or `DYLD_INSERT_LIBRARIES` (macOS). It overrides
//! `bind(2)` and `connect(2)`: when the requested port is in the known
//! base-port set, the call proceeds with `port + offset` instead.
//!
//! Activation is driven entirely by two environment variables set by the
//! daemon (see [`PORT_OFFSET_ENV`] and [`KNOWN_PORTS_ENV`]). With offset 0,
//! an empty port set, or either variable missing, every call passes through
//! untouched.
//!
//! The shim is a fallback: the daemon's env-variable substitution is the
//! primary mechanism. The shim catches ports the project hardcodes or reads
//! out-of-band.

pub mod rewrite;

#[cfg(unix)]
mod interpose;

/// Environment variable carrying the decimal port offset for this process tree.
pub const PORT_OFFSET_ENV: &str = "ORCHARD_PORT_OFFSET";

/// Environment variable carrying the comma-separated base-port set.
pub const KNOWN_PORTS_ENV: &str = "ORCHARD_KNOWN_PORTS";
