//! Project configuration: file-backed, loaded once per run.
//!
//! Lives at `{project}/.orchard/config.toml`. Priority for startup fields:
//! CLI / env var  >  TOML  >  built-in default. The struct is mutated only
//! through explicit update operations (`ports.discover` → [`ProjectConfig::save`]),
//! never implicitly — there is deliberately no file watcher here.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Project-local state directory name.
pub const STATE_DIR: &str = ".orchard";

const DEFAULT_LISTEN_PORT: u16 = 4400;
const DEFAULT_OFFSET_STEP: u16 = 10;
const DEFAULT_LOG_BUFFER_LINES: usize = 500;
const DEFAULT_STOP_GRACE_SECS: u64 = 5;
const DEFAULT_RECONCILE_SECS: u64 = 30;

// ─── PortConfig ───────────────────────────────────────────────────────────────

/// Discovered base ports and the spacing between worktree offsets.
///
/// `offset_step = 0` or an empty port list disables virtualization entirely:
/// children bind the literal configured ports. That is a supported
/// single-worktree configuration, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub discovered_ports: Vec<u16>,
    pub offset_step: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            discovered_ports: Vec::new(),
            offset_step: DEFAULT_OFFSET_STEP,
        }
    }
}

// ─── EnvMapping ───────────────────────────────────────────────────────────────

/// One environment variable whose value is derived from a discovered port.
///
/// `template` references a discovered-port index, e.g. `"${0}"`; applied with
/// offset `k` it evaluates to `discovered_ports[0] + k`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvMappingEntry {
    pub var: String,
    pub template: String,
}

// ─── LivenessConfig ───────────────────────────────────────────────────────────

/// Bounded, best-effort readiness probe tunables.
///
/// When `path` is set, the probe is an HTTP GET against the first discovered
/// port (offset-adjusted); otherwise a plain TCP connect. On overall timeout
/// the worktree is promoted to `running` anyway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub path: Option<String>,
    pub interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            path: None,
            interval_ms: 500,
            timeout_secs: 30,
        }
    }
}

// ─── ProjectConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Root of the primary checkout. Not persisted — derived at startup.
    #[serde(skip)]
    pub project_dir: PathBuf,

    /// Branch new worktrees fork from.
    pub base_branch: String,
    /// Dev-server command, run through the shell in the worktree directory.
    pub start_command: Option<String>,
    /// Dependency install command, run once after worktree creation.
    pub install_command: Option<String>,

    /// JSON-RPC WebSocket listen port for the daemon itself.
    pub listen_port: u16,
    pub bind_address: String,

    pub ports: PortConfig,
    /// Ordered env-variable mapping, persisted once by detection and reused.
    pub env_mapping: Vec<EnvMappingEntry>,
    pub liveness: LivenessConfig,

    /// Grace period before a graceful stop escalates to SIGKILL.
    pub stop_grace_secs: u64,
    /// Most recent process-output lines retained per worktree.
    pub log_buffer_lines: usize,
    /// Interval of the periodic git-status reconcile task.
    pub reconcile_secs: u64,

    /// Log level filter string, e.g. "debug", "info,orchard=trace".
    pub log: String,
    /// "pretty" (default) | "json".
    pub log_format: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::new(),
            base_branch: "main".to_string(),
            start_command: None,
            install_command: None,
            listen_port: DEFAULT_LISTEN_PORT,
            bind_address: "127.0.0.1".to_string(),
            ports: PortConfig::default(),
            env_mapping: Vec::new(),
            liveness: LivenessConfig::default(),
            stop_grace_secs: DEFAULT_STOP_GRACE_SECS,
            log_buffer_lines: DEFAULT_LOG_BUFFER_LINES,
            reconcile_secs: DEFAULT_RECONCILE_SECS,
            log: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// CLI/env overrides that outrank the TOML file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub listen_port: Option<u16>,
    pub bind_address: Option<String>,
    pub log: Option<String>,
}

impl ProjectConfig {
    /// Load `{project_dir}/.orchard/config.toml`, falling back to defaults
    /// when the file is absent, then apply CLI/env overrides.
    pub fn load(project_dir: &Path, overrides: Overrides) -> Result<Self> {
        if !project_dir.is_dir() {
            return Err(Error::Configuration(format!(
                "project directory does not exist: {}",
                project_dir.display()
            )));
        }

        let path = project_dir.join(STATE_DIR).join("config.toml");
        let mut cfg = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str::<ProjectConfig>(&contents).map_err(|e| {
                Error::Configuration(format!("invalid {}: {e}", path.display()))
            })?,
            Err(_) => {
                info!(path = %path.display(), "no config file — using defaults");
                ProjectConfig::default()
            }
        };

        cfg.project_dir = project_dir.to_path_buf();
        if let Some(p) = overrides.listen_port {
            cfg.listen_port = p;
        }
        if let Some(b) = overrides.bind_address {
            cfg.bind_address = b;
        }
        if let Some(l) = overrides.log {
            cfg.log = l;
        }
        Ok(cfg)
    }

    /// Persist the current config. Only called by explicit update operations.
    pub fn save(&self) -> Result<()> {
        let dir = self.state_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Configuration(format!("cannot create {}: {e}", dir.display())))?;
        let path = dir.join("config.toml");
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("cannot serialize config: {e}")))?;
        std::fs::write(&path, contents)
            .map_err(|e| Error::Configuration(format!("cannot write {}: {e}", path.display())))?;
        info!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Both mechanisms (env substitution and the preload shim) are active
    /// only when there is a step to offset by and ports to offset.
    pub fn virtualization_enabled(&self) -> bool {
        self.ports.offset_step > 0 && !self.ports.discovered_ports.is_empty()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_dir.join(STATE_DIR)
    }

    /// Container directory holding the actual checkouts.
    pub fn worktrees_dir(&self) -> PathBuf {
        self.state_dir().join("worktrees")
    }

    pub fn instance_file(&self) -> PathBuf {
        self.state_dir().join("instance.json")
    }

    pub fn activity_log_file(&self) -> PathBuf {
        self.state_dir().join("activity.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_file_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = ProjectConfig::load(tmp.path(), Overrides::default()).unwrap();
        assert_eq!(cfg.base_branch, "main");
        assert_eq!(cfg.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(cfg.ports.offset_step, DEFAULT_OFFSET_STEP);
        assert!(cfg.ports.discovered_ports.is_empty());
        assert!(!cfg.virtualization_enabled());
    }

    #[test]
    fn missing_project_dir_is_configuration_error() {
        let err = ProjectConfig::load(Path::new("/nonexistent/xyz"), Overrides::default())
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn overrides_outrank_toml() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(STATE_DIR)).unwrap();
        std::fs::write(
            tmp.path().join(STATE_DIR).join("config.toml"),
            "listen_port = 5000\nlog = \"debug\"\n",
        )
        .unwrap();

        let cfg = ProjectConfig::load(
            tmp.path(),
            Overrides {
                listen_port: Some(6000),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.listen_port, 6000);
        assert_eq!(cfg.log, "debug");
    }

    #[test]
    fn save_then_load_round_trips_port_state() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = ProjectConfig::load(tmp.path(), Overrides::default()).unwrap();
        cfg.ports.discovered_ports = vec![3000, 5173];
        cfg.env_mapping = vec![EnvMappingEntry {
            var: "PORT".into(),
            template: "${0}".into(),
        }];
        cfg.save().unwrap();

        let reloaded = ProjectConfig::load(tmp.path(), Overrides::default()).unwrap();
        assert_eq!(reloaded.ports.discovered_ports, vec![3000, 5173]);
        assert_eq!(reloaded.env_mapping, cfg.env_mapping);
        assert!(reloaded.virtualization_enabled());
    }
}
