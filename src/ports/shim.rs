//! Preload-shim activation: control variables and library injection.
//!
//! The shim itself lives in the `orchard_shim` cdylib. This module decides
//! whether and how a child process gets it: the two control variables are
//! always set alongside the env mapping, and when a built shim library can
//! be located it is added to the platform's preload variable. The shim
//! self-disables when the offset is zero or the known-port set is empty, so
//! over-injection is harmless.

use std::path::PathBuf;

use tracing::debug;

pub use orchard_shim::{KNOWN_PORTS_ENV, PORT_OFFSET_ENV};

/// Env var that pins the shim library path explicitly (highest priority).
pub const SHIM_LIB_ENV: &str = "ORCHARD_SHIM_LIB";

#[cfg(target_os = "macos")]
const PRELOAD_VAR: &str = "DYLD_INSERT_LIBRARIES";
#[cfg(not(target_os = "macos"))]
const PRELOAD_VAR: &str = "LD_PRELOAD";

#[cfg(target_os = "macos")]
const SHIM_FILE: &str = "liborchard_shim.dylib";
#[cfg(not(target_os = "macos"))]
const SHIM_FILE: &str = "liborchard_shim.so";

/// Append the two shim control variables. No-op when offset is 0 or the
/// port set is empty — matching the shim's own activation check.
pub fn inject_control_vars(env: &mut Vec<(String, String)>, offset: u16, ports: &[u16]) {
    if offset == 0 || ports.is_empty() {
        return;
    }
    let csv = ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",");
    env.push((PORT_OFFSET_ENV.to_string(), offset.to_string()));
    env.push((KNOWN_PORTS_ENV.to_string(), csv));

    if let Some(lib) = locate_shim_library() {
        debug!(lib = %lib.display(), "preload shim injected");
        env.push((PRELOAD_VAR.to_string(), preload_value(&lib)));
    }
}

/// Find the shim library: `ORCHARD_SHIM_LIB` override first, then next to
/// the running daemon binary. `None` means env substitution runs alone.
pub fn locate_shim_library() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(SHIM_LIB_ENV) {
        let path = PathBuf::from(explicit);
        return path.is_file().then_some(path);
    }
    let exe = std::env::current_exe().ok()?;
    let candidate = exe.parent()?.join(SHIM_FILE);
    candidate.is_file().then_some(candidate)
}

/// Preload value for the child, preserving any preload list the daemon
/// itself was started under.
fn preload_value(lib: &std::path::Path) -> String {
    match std::env::var(PRELOAD_VAR) {
        Ok(existing) if !existing.is_empty() => format!("{existing}:{}", lib.display()),
        _ => lib.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_vars_absent_when_offset_zero() {
        let mut env = Vec::new();
        inject_control_vars(&mut env, 0, &[3000]);
        assert!(env.is_empty());
    }

    #[test]
    fn control_vars_absent_when_no_ports() {
        let mut env = Vec::new();
        inject_control_vars(&mut env, 10, &[]);
        assert!(env.is_empty());
    }

    #[test]
    fn control_vars_carry_offset_and_port_csv() {
        let mut env = Vec::new();
        inject_control_vars(&mut env, 30, &[3000, 5173, 8080]);
        assert!(env.contains(&(PORT_OFFSET_ENV.to_string(), "30".to_string())));
        assert!(env.contains(&(KNOWN_PORTS_ENV.to_string(), "3000,5173,8080".to_string())));
    }
}
