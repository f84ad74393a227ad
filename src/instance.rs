//! Single-instance advertisement.
//!
//! The daemon writes `{state_dir}/instance.json` so CLI tools can find the
//! running instance, and refuses to start while another live daemon holds
//! the file. A file left behind by a dead process is stale and gets
//! overwritten.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub instance_id: Uuid,
    pub pid: u32,
    pub url: String,
}

/// Removes the advertisement file when dropped.
#[derive(Debug)]
pub struct InstanceGuard {
    path: PathBuf,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %e, "could not remove instance file");
        }
    }
}

/// Claim the instance file, failing if a live daemon already holds it.
pub fn acquire(path: PathBuf, url: String) -> Result<InstanceGuard> {
    if let Ok(contents) = std::fs::read_to_string(&path) {
        if let Ok(existing) = serde_json::from_str::<InstanceInfo>(&contents) {
            if process_alive(existing.pid) {
                return Err(Error::Configuration(format!(
                    "another instance is already running (pid {}, {})",
                    existing.pid, existing.url
                )));
            }
            info!(pid = existing.pid, "stale instance file from dead process — replacing");
        }
    }

    let info = InstanceInfo {
        instance_id: Uuid::new_v4(),
        pid: std::process::id(),
        url,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Configuration(format!("cannot create {}: {e}", parent.display())))?;
    }
    let contents = serde_json::to_string_pretty(&info)
        .map_err(|e| Error::Configuration(format!("cannot serialize instance info: {e}")))?;
    std::fs::write(&path, contents)
        .map_err(|e| Error::Configuration(format!("cannot write {}: {e}", path.display())))?;
    info!(path = %path.display(), pid = info.pid, "instance file written");
    Ok(InstanceGuard { path })
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 performs the permission/existence check without delivering.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}
