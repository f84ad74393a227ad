//! Worktree registry and lifecycle state machine.
//!
//! States: `creating → stopped ⇄ (starting → running) → stopped`, any state
//! can drop to `error`, and `removed` is terminal. At most one lifecycle
//! operation runs per worktree at a time; a second caller gets
//! `OperationInProgress` immediately rather than queueing. Every transition
//! is recorded on the activity bus and broadcast as `worktree.statusChanged`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::activity::{Activity, ActivityBus, ActivityCategory};
use crate::config::ProjectConfig;
use crate::error::{Error, Result};
use crate::ipc::event::EventBroadcaster;
use crate::ports::{env_map, PortAllocator};
use crate::supervisor::{ExitKind, ProbeSpec, ProcessSupervisor, SpawnSpec};
use crate::worktree::{git, secrets};

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Creating,
    Stopped,
    Starting,
    Running,
    Error,
    Removed,
}

impl WorktreeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorktreeStatus::Creating => "creating",
            WorktreeStatus::Stopped => "stopped",
            WorktreeStatus::Starting => "starting",
            WorktreeStatus::Running => "running",
            WorktreeStatus::Error => "error",
            WorktreeStatus::Removed => "removed",
        }
    }
}

/// Git state of a checkout, refreshed by the reconcile task.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatusSnapshot {
    pub has_uncommitted: bool,
    pub ahead: usize,
    pub behind: usize,
    pub ahead_of_base: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub id: String,
    pub name: String,
    pub branch: String,
    pub path: PathBuf,
    pub status: WorktreeStatus,
    pub created_at: DateTime<Utc>,
    /// Held port offset while starting/running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Offset-adjusted ports the dev server is reachable on.
    pub ports: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub git: GitStatusSnapshot,
}

struct Entry {
    info: WorktreeInfo,
    supervisor: Option<Arc<ProcessSupervisor>>,
}

// ─── Manager ─────────────────────────────────────────────────────────────────

struct Inner {
    config: Arc<RwLock<ProjectConfig>>,
    allocator: Arc<PortAllocator>,
    activity: Arc<ActivityBus>,
    broadcaster: Arc<EventBroadcaster>,
    entries: RwLock<HashMap<String, Entry>>,
    /// Ids with a lifecycle operation in flight. Synchronous lock: the
    /// claim/reject decision must not interleave with another claim.
    in_flight: StdMutex<HashSet<String>>,
}

pub struct WorktreeManager {
    inner: Arc<Inner>,
}

/// Releases the per-worktree operation claim when the operation ends,
/// whether it returned early, succeeded, or failed.
struct OpGuard {
    id: String,
    inner: Arc<Inner>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&self.id);
    }
}

impl WorktreeManager {
    pub fn new(
        config: Arc<RwLock<ProjectConfig>>,
        allocator: Arc<PortAllocator>,
        activity: Arc<ActivityBus>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                allocator,
                activity,
                broadcaster,
                entries: RwLock::new(HashMap::new()),
                in_flight: StdMutex::new(HashSet::new()),
            }),
        }
    }

    /// Rebuild the registry from checkouts already on disk. Everything found
    /// starts as `stopped`; processes never survive a daemon restart.
    pub async fn bootstrap(&self) -> Result<()> {
        let (worktrees_dir, base_branch) = {
            let config = self.inner.config.read().await;
            (config.worktrees_dir(), config.base_branch.clone())
        };
        if !worktrees_dir.is_dir() {
            return Ok(());
        }

        let mut found = 0usize;
        let dirs: Vec<PathBuf> = std::fs::read_dir(&worktrees_dir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();

        for path in dirs {
            let id = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            let branch_path = path.clone();
            let branch = tokio::task::spawn_blocking(move || checkout_branch(&branch_path))
                .await
                .map_err(|e| Error::GitOperation(e.to_string()))?;
            let branch = match branch {
                Ok(b) => b,
                Err(e) => {
                    warn!(id = %id, err = %e, "skipping unreadable checkout");
                    continue;
                }
            };
            let created_at = std::fs::metadata(&path)
                .and_then(|m| m.created())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            let snapshot_path = path.clone();
            let base = base_branch.clone();
            let git_status =
                tokio::task::spawn_blocking(move || git::status_snapshot(&snapshot_path, &base))
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .unwrap_or_default();

            let mut entries = self.inner.entries.write().await;
            entries.insert(
                id.clone(),
                Entry {
                    info: WorktreeInfo {
                        id: id.clone(),
                        name: id.clone(),
                        branch,
                        path,
                        status: WorktreeStatus::Stopped,
                        created_at,
                        offset: None,
                        pid: None,
                        ports: Vec::new(),
                        issue: None,
                        pull_request: None,
                        last_error: None,
                        git: git_status,
                    },
                    supervisor: None,
                },
            );
            found += 1;
        }

        if found > 0 {
            info!(count = found, "existing worktrees registered");
        }
        Ok(())
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    /// All live worktrees, sorted by name. Removed entries are omitted.
    pub async fn list(&self) -> Vec<WorktreeInfo> {
        let entries = self.inner.entries.read().await;
        let mut infos: Vec<WorktreeInfo> = entries
            .values()
            .filter(|e| e.info.status != WorktreeStatus::Removed)
            .map(|e| e.info.clone())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn get(&self, id: &str) -> Result<WorktreeInfo> {
        let entries = self.inner.entries.read().await;
        entries
            .get(id)
            .map(|e| e.info.clone())
            .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))
    }

    pub async fn logs(&self, id: &str, lines: Option<usize>) -> Result<Vec<String>> {
        let entries = self.inner.entries.read().await;
        let entry = entries
            .get(id)
            .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
        Ok(entry
            .supervisor
            .as_ref()
            .map(|s| s.logs(lines))
            .unwrap_or_default())
    }

    pub async fn running_count(&self) -> usize {
        let entries = self.inner.entries.read().await;
        entries
            .values()
            .filter(|e| e.info.status == WorktreeStatus::Running)
            .count()
    }

    pub async fn counts_by_status(&self) -> BTreeMap<&'static str, usize> {
        let entries = self.inner.entries.read().await;
        let mut counts = BTreeMap::new();
        for entry in entries.values() {
            *counts.entry(entry.info.status.as_str()).or_insert(0) += 1;
        }
        counts
    }

    // ─── Lifecycle operations ────────────────────────────────────────────────

    /// Create a checkout of `branch` and register it as `stopped`. A failed
    /// git step leaves no registration behind; install-command and
    /// secret-seeding failures only degrade the result.
    pub async fn create(&self, branch: &str, name: Option<&str>) -> Result<WorktreeInfo> {
        let id = slug(name.unwrap_or(branch));
        if id.is_empty() {
            return Err(Error::Configuration(format!("unusable worktree name: '{branch}'")));
        }
        let _guard = self.begin_op(&id)?;

        {
            let entries = self.inner.entries.read().await;
            if entries
                .get(&id)
                .is_some_and(|e| e.info.status != WorktreeStatus::Removed)
            {
                return Err(Error::Configuration(format!("worktree '{id}' already exists")));
            }
        }

        let (project_dir, base_branch, wt_path, install_command, log_buffer_lines) = {
            let config = self.inner.config.read().await;
            (
                config.project_dir.clone(),
                config.base_branch.clone(),
                config.worktrees_dir().join(&id),
                config.install_command.clone(),
                config.log_buffer_lines,
            )
        };

        let info = WorktreeInfo {
            id: id.clone(),
            name: id.clone(),
            branch: branch.to_string(),
            path: wt_path.clone(),
            status: WorktreeStatus::Creating,
            created_at: Utc::now(),
            offset: None,
            pid: None,
            ports: Vec::new(),
            issue: None,
            pull_request: None,
            last_error: None,
            git: GitStatusSnapshot::default(),
        };
        {
            let mut entries = self.inner.entries.write().await;
            entries.insert(
                id.clone(),
                Entry {
                    info: info.clone(),
                    supervisor: None,
                },
            );
        }
        self.inner.broadcast_status(&info);
        self.inner
            .activity
            .append(
                Activity::info(ActivityCategory::Lifecycle, "creating", format!("creating worktree for branch '{branch}'"))
                    .worktree(&id),
            )
            .await;

        let git_branch = branch.to_string();
        let git_id = id.clone();
        let git_path = wt_path.clone();
        let git_project = project_dir.clone();
        let created = tokio::task::spawn_blocking(move || {
            git::create_worktree(&git_project, &base_branch, &git_branch, &git_id, &git_path)
        })
        .await
        .map_err(|e| Error::GitOperation(e.to_string()))?;

        if let Err(e) = created {
            // No partial registrations: a failed create leaves nothing behind.
            self.inner.entries.write().await.remove(&id);
            self.inner
                .activity
                .append(
                    Activity::error(ActivityCategory::Git, "creation_failed", "worktree creation failed")
                        .worktree(&id)
                        .detail(e.to_string()),
                )
                .await;
            return Err(e);
        }

        let seed_src = project_dir.clone();
        let seed_dst = wt_path.clone();
        let copied = tokio::task::spawn_blocking(move || secrets::seed_secrets(&seed_src, &seed_dst))
            .await
            .unwrap_or_default();
        if !copied.is_empty() {
            self.inner
                .activity
                .append(
                    Activity::info(ActivityCategory::Lifecycle, "secrets_seeded", format!("copied {} secret file(s)", copied.len()))
                        .worktree(&id)
                        .detail(copied.join(", ")),
                )
                .await;
        }

        let mut degraded: Option<String> = None;
        if let Some(command) = install_command {
            if let Err(e) = self.run_install(&id, &command, &wt_path, log_buffer_lines).await {
                degraded = Some(e.to_string());
            }
        }

        let info = self
            .inner
            .transition(&id, WorktreeStatus::Stopped, |entry| {
                entry.info.last_error = degraded.clone();
            })
            .await
            .ok_or_else(|| Error::WorktreeNotFound(id.clone()))?;
        self.inner
            .activity
            .append(
                Activity::info(ActivityCategory::Lifecycle, "creation_completed", format!("worktree '{id}' ready"))
                    .worktree(&id),
            )
            .await;
        info!(id, branch, "worktree created");
        Ok(info)
    }

    /// Install failures are collaborator-class: the worktree stays usable.
    async fn run_install(
        &self,
        id: &str,
        command: &str,
        working_dir: &std::path::Path,
        log_buffer_lines: usize,
    ) -> Result<()> {
        let sup = ProcessSupervisor::spawn(SpawnSpec {
            command: command.to_string(),
            working_dir: working_dir.to_path_buf(),
            env: Vec::new(),
            log_buffer_lines,
        })
        .map_err(|e| Error::Collaborator(format!("install command failed to spawn: {e}")))?;

        let kind = sup.wait_exit().await;
        if matches!(kind, ExitKind::Crashed(Some(0))) {
            return Ok(());
        }
        let detail = match kind {
            ExitKind::Crashed(Some(code)) => format!("install command exited with code {code}"),
            _ => "install command did not complete".to_string(),
        };
        self.inner
            .activity
            .append(
                Activity::warning(ActivityCategory::Process, "install_failed", "install command failed")
                    .worktree(id)
                    .detail(detail.clone()),
            )
            .await;
        Err(Error::Collaborator(detail))
    }

    /// Start the dev server: claim an offset, build the child environment,
    /// spawn, probe, promote. The offset is held from before the spawn until
    /// the process is gone, whichever way it goes.
    pub async fn start(&self, id: &str) -> Result<WorktreeInfo> {
        let _guard = self.begin_op(id)?;

        {
            let entries = self.inner.entries.read().await;
            let entry = entries
                .get(id)
                .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
            match entry.info.status {
                WorktreeStatus::Stopped | WorktreeStatus::Error => {}
                other => {
                    return Err(Error::InvalidState {
                        id: id.to_string(),
                        actual: other.as_str(),
                        required: "stopped",
                    })
                }
            }
            if !entry.info.path.is_dir() {
                drop(entries);
                let detail = "worktree directory is missing".to_string();
                self.inner
                    .transition(id, WorktreeStatus::Error, |e| {
                        e.info.last_error = Some(detail.clone());
                    })
                    .await;
                self.inner
                    .activity
                    .append(
                        Activity::error(ActivityCategory::Git, "checkout_missing", "worktree directory is missing")
                            .worktree(id),
                    )
                    .await;
                return Err(Error::GitOperation(detail));
            }
        }

        let config = self.inner.config.read().await.clone();
        let command = config.start_command.clone().ok_or_else(|| {
            Error::Configuration("no start_command configured".to_string())
        })?;
        let wt_path = self.get(id).await?.path;

        let offset = if config.virtualization_enabled() {
            self.inner.allocator.allocate(id, config.ports.offset_step)?
        } else {
            0
        };
        let env = env_map::build_child_env(&config, offset);

        let sup = match ProcessSupervisor::spawn(SpawnSpec {
            command,
            working_dir: wt_path,
            env,
            log_buffer_lines: config.log_buffer_lines,
        }) {
            Ok(s) => s,
            Err(e) => {
                self.inner.allocator.release(offset);
                self.inner
                    .transition(id, WorktreeStatus::Error, |entry| {
                        entry.info.last_error = Some(e.to_string());
                    })
                    .await;
                self.inner
                    .activity
                    .append(
                        Activity::error(ActivityCategory::Process, "spawn_failed", "dev server failed to spawn")
                            .worktree(id)
                            .detail(e.to_string()),
                    )
                    .await;
                return Err(e);
            }
        };

        let effective_ports: Vec<u16> = config
            .ports
            .discovered_ports
            .iter()
            .filter_map(|p| p.checked_add(offset))
            .collect();
        let pid = sup.pid();
        let info = self
            .inner
            .transition(id, WorktreeStatus::Starting, |entry| {
                entry.info.offset = if offset > 0 { Some(offset) } else { None };
                entry.info.pid = Some(pid);
                entry.info.ports = effective_ports.clone();
                entry.info.last_error = None;
                entry.supervisor = Some(sup.clone());
            })
            .await
            .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
        self.inner
            .activity
            .append(
                Activity::info(ActivityCategory::Lifecycle, "starting", format!("dev server starting (pid {pid})"))
                    .worktree(id)
                    .detail(format!("offset {offset}, ports {effective_ports:?}")),
            )
            .await;

        let probe = ProbeSpec {
            port: effective_ports.first().copied(),
            path: config.liveness.path.clone(),
            interval: Duration::from_millis(config.liveness.interval_ms),
            timeout: Duration::from_secs(config.liveness.timeout_secs),
        };
        let inner = self.inner.clone();
        let monitor_id = id.to_string();
        tokio::spawn(async move {
            monitor(inner, monitor_id, sup, probe).await;
        });

        Ok(info)
    }

    /// Graceful stop. Already-stopped worktrees are a no-op.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let _guard = self.begin_op(id)?;
        self.stop_claimed(id).await
    }

    /// Body of `stop`, shared with `remove` which already holds the claim.
    async fn stop_claimed(&self, id: &str) -> Result<()> {
        let sup = {
            let entries = self.inner.entries.read().await;
            let entry = entries
                .get(id)
                .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
            match entry.supervisor.clone() {
                Some(s) => s,
                None => return Ok(()), // nothing running
            }
        };

        let grace = Duration::from_secs(self.inner.config.read().await.stop_grace_secs);
        sup.stop(grace).await;

        // Taking the offset and clearing the supervisor happen in the same
        // critical section, so exactly one party (this stop or a crash
        // monitor) ever owns the release.
        let mut released = None;
        self.inner
            .transition(id, WorktreeStatus::Stopped, |entry| {
                released = entry.info.offset.take();
                entry.info.pid = None;
                entry.info.ports.clear();
                entry.supervisor = None;
            })
            .await;
        if let Some(offset) = released {
            self.inner.allocator.release(offset);
        }
        self.inner
            .activity
            .append(
                Activity::info(ActivityCategory::Lifecycle, "stopped", "dev server stopped")
                    .worktree(id),
            )
            .await;
        info!(id, "worktree stopped");
        Ok(())
    }

    /// Stop if running, then delete the checkout and its git registration.
    /// The `stopped` event lands strictly before `removed`.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.begin_op(id)?;

        let (status, wt_path) = {
            let entries = self.inner.entries.read().await;
            let entry = entries
                .get(id)
                .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
            (entry.info.status, entry.info.path.clone())
        };
        if status == WorktreeStatus::Removed {
            return Ok(());
        }
        if matches!(status, WorktreeStatus::Running | WorktreeStatus::Starting) {
            self.stop_claimed(id).await?;
        }

        let project_dir = self.inner.config.read().await.project_dir.clone();
        let wt_name = id.to_string();
        let removed = tokio::task::spawn_blocking(move || {
            git::remove_worktree(&project_dir, &wt_name, &wt_path)
        })
        .await
        .map_err(|e| Error::GitOperation(e.to_string()))?;

        if let Err(e) = removed {
            self.inner
                .transition(id, WorktreeStatus::Error, |entry| {
                    entry.info.last_error = Some(e.to_string());
                })
                .await;
            self.inner
                .activity
                .append(
                    Activity::error(ActivityCategory::Git, "removal_failed", "worktree removal failed")
                        .worktree(id)
                        .detail(e.to_string()),
                )
                .await;
            return Err(e);
        }

        self.inner.transition(id, WorktreeStatus::Removed, |_| {}).await;
        self.inner
            .activity
            .append(
                Activity::info(ActivityCategory::Lifecycle, "removed", format!("worktree '{id}' removed"))
                    .worktree(id),
            )
            .await;
        info!(id, "worktree removed");
        Ok(())
    }

    /// Rename the display name (moves the checkout directory) and/or the
    /// checked-out branch. Only valid while stopped.
    pub async fn rename(
        &self,
        id: &str,
        name: Option<&str>,
        branch: Option<&str>,
    ) -> Result<WorktreeInfo> {
        let _guard = self.begin_op(id)?;

        let (status, old_path) = {
            let entries = self.inner.entries.read().await;
            let entry = entries
                .get(id)
                .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
            (entry.info.status, entry.info.path.clone())
        };
        if status != WorktreeStatus::Stopped {
            return Err(Error::InvalidState {
                id: id.to_string(),
                actual: status.as_str(),
                required: "stopped",
            });
        }

        let config = self.inner.config.read().await;
        let project_dir = config.project_dir.clone();
        let worktrees_dir = config.worktrees_dir();
        drop(config);

        let mut new_path = None;
        if let Some(name) = name {
            let dir_name = slug(name);
            if dir_name.is_empty() {
                return Err(Error::Configuration(format!("unusable worktree name: '{name}'")));
            }
            let target = worktrees_dir.join(&dir_name);
            if target != old_path {
                let mv_project = project_dir.clone();
                let mv_name = id.to_string();
                let mv_old = old_path.clone();
                let mv_new = target.clone();
                tokio::task::spawn_blocking(move || {
                    git::move_worktree(&mv_project, &mv_name, &mv_old, &mv_new)
                })
                .await
                .map_err(|e| Error::GitOperation(e.to_string()))??;
                new_path = Some(target);
            }
        }

        if let Some(branch) = branch {
            let path = new_path.clone().unwrap_or_else(|| old_path.clone());
            let new_branch = branch.to_string();
            tokio::task::spawn_blocking(move || git::rename_branch(&path, &new_branch))
                .await
                .map_err(|e| Error::GitOperation(e.to_string()))??;
        }

        let name_owned = name.map(str::to_string);
        let branch_owned = branch.map(str::to_string);
        let info = {
            let mut entries = self.inner.entries.write().await;
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
            if let Some(n) = name_owned {
                entry.info.name = n;
            }
            if let Some(p) = new_path {
                entry.info.path = p;
            }
            if let Some(b) = branch_owned {
                entry.info.branch = b;
            }
            entry.info.clone()
        };
        self.inner.broadcast_status(&info);
        self.inner
            .activity
            .append(
                Activity::info(ActivityCategory::Git, "renamed", format!("worktree renamed to '{}'", info.name))
                    .worktree(id),
            )
            .await;
        Ok(info)
    }

    /// Attach issue / pull-request references. No state transition.
    pub async fn set_linkage(
        &self,
        id: &str,
        issue: Option<String>,
        pull_request: Option<String>,
    ) -> Result<WorktreeInfo> {
        let info = {
            let mut entries = self.inner.entries.write().await;
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
            if issue.is_some() {
                entry.info.issue = issue;
            }
            if pull_request.is_some() {
                entry.info.pull_request = pull_request;
            }
            entry.info.clone()
        };
        self.inner
            .activity
            .append(
                Activity::info(ActivityCategory::Git, "linked", "external references updated")
                    .worktree(id),
            )
            .await;
        Ok(info)
    }

    /// Stop every running worktree. Used for daemon shutdown; errors are
    /// logged, not propagated.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let entries = self.inner.entries.read().await;
            entries
                .values()
                .filter(|e| e.supervisor.is_some())
                .map(|e| e.info.id.clone())
                .collect()
        };
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(id = %id, err = %e, "stop during shutdown failed");
            }
        }
    }

    /// Refresh git snapshots and flag checkouts that vanished from disk.
    /// Collaborator-class: individual failures are logged and skipped.
    pub async fn reconcile(&self) {
        let targets: Vec<(String, PathBuf, WorktreeStatus)> = {
            let entries = self.inner.entries.read().await;
            entries
                .values()
                .filter(|e| {
                    !matches!(
                        e.info.status,
                        WorktreeStatus::Removed | WorktreeStatus::Creating
                    )
                })
                .map(|e| (e.info.id.clone(), e.info.path.clone(), e.info.status))
                .collect()
        };
        let base_branch = self.inner.config.read().await.base_branch.clone();

        for (id, path, status) in targets {
            if !path.is_dir() {
                if status != WorktreeStatus::Error {
                    self.inner
                        .transition(&id, WorktreeStatus::Error, |entry| {
                            entry.info.last_error =
                                Some("worktree directory is missing".to_string());
                        })
                        .await;
                    self.inner
                        .activity
                        .append(
                            Activity::warning(ActivityCategory::Git, "checkout_missing", "worktree directory is missing")
                                .worktree(&id),
                        )
                        .await;
                }
                continue;
            }
            let base = base_branch.clone();
            let snapshot =
                tokio::task::spawn_blocking(move || git::status_snapshot(&path, &base)).await;
            match snapshot {
                Ok(Ok(git_status)) => {
                    let mut entries = self.inner.entries.write().await;
                    if let Some(entry) = entries.get_mut(&id) {
                        entry.info.git = git_status;
                    }
                }
                Ok(Err(e)) => warn!(id = %id, err = %e, "git status refresh failed"),
                Err(e) => warn!(id = %id, err = %e, "git status task failed"),
            }
        }
    }

    fn begin_op(&self, id: &str) -> Result<OpGuard> {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .expect("in-flight lock poisoned");
        if !in_flight.insert(id.to_string()) {
            return Err(Error::OperationInProgress(id.to_string()));
        }
        Ok(OpGuard {
            id: id.to_string(),
            inner: self.inner.clone(),
        })
    }
}

impl Inner {
    /// Apply a status transition plus extra field edits, then broadcast.
    async fn transition(
        &self,
        id: &str,
        status: WorktreeStatus,
        edit: impl FnOnce(&mut Entry),
    ) -> Option<WorktreeInfo> {
        let info = {
            let mut entries = self.entries.write().await;
            let entry = entries.get_mut(id)?;
            entry.info.status = status;
            edit(entry);
            entry.info.clone()
        };
        self.broadcast_status(&info);
        Some(info)
    }

    /// Like `transition`, but only if `sup` is still the entry's current
    /// supervisor. Check and edit share one critical section: a stale
    /// monitor can never clobber state a newer operation already owns.
    async fn transition_if_current(
        &self,
        id: &str,
        sup: &Arc<ProcessSupervisor>,
        status: WorktreeStatus,
        edit: impl FnOnce(&mut Entry),
    ) -> Option<WorktreeInfo> {
        let info = {
            let mut entries = self.entries.write().await;
            let entry = entries.get_mut(id)?;
            let current = entry
                .supervisor
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(s, sup));
            if !current {
                return None;
            }
            entry.info.status = status;
            edit(entry);
            entry.info.clone()
        };
        self.broadcast_status(&info);
        Some(info)
    }

    fn broadcast_status(&self, info: &WorktreeInfo) {
        self.broadcaster.broadcast(
            "worktree.statusChanged",
            serde_json::to_value(info).unwrap_or_default(),
        );
    }
}

// ─── Monitor task ────────────────────────────────────────────────────────────

/// Runs from spawn to reap: probes for readiness, promotes to `running`,
/// then waits for the exit and classifies it. Operator stops are handled by
/// the stop operation itself; only crashes are acted on here.
async fn monitor(inner: Arc<Inner>, id: String, sup: Arc<ProcessSupervisor>, probe: ProbeSpec) {
    let ready = sup.wait_ready(&probe).await;
    if !sup.has_exited() {
        // A stop that completed during the probe already cleared the
        // supervisor; promoting then would wedge a stopped worktree in
        // `running` with no process behind it.
        let promoted = inner
            .transition_if_current(&id, &sup, WorktreeStatus::Running, |_| {})
            .await;
        if promoted.is_some() {
            if !ready {
                inner
                    .activity
                    .append(
                        Activity::warning(ActivityCategory::Process, "probe_timeout", "liveness probe timed out — assuming running")
                            .worktree(&id),
                    )
                    .await;
            }
            inner
                .activity
                .append(
                    Activity::info(ActivityCategory::Lifecycle, "running", "dev server is up")
                        .worktree(&id),
                )
                .await;
        }
    }

    let kind = sup.wait_exit().await;
    match kind {
        ExitKind::Stopped => {} // the stop operation does the bookkeeping
        ExitKind::Crashed(code) => {
            let detail = match code {
                Some(c) => format!("dev server exited unexpectedly with code {c}"),
                None => "dev server was killed by a signal".to_string(),
            };
            // The currency check, the transition, and taking the offset are
            // one critical section; whoever takes the offset releases it.
            let mut released = None;
            let transitioned = inner
                .transition_if_current(&id, &sup, WorktreeStatus::Error, |entry| {
                    released = entry.info.offset.take();
                    entry.info.pid = None;
                    entry.info.ports.clear();
                    entry.info.last_error = Some(detail.clone());
                    entry.supervisor = None;
                })
                .await;
            if transitioned.is_none() {
                return;
            }
            if let Some(offset) = released {
                inner.allocator.release(offset);
            }
            inner
                .activity
                .append(
                    Activity::error(ActivityCategory::Process, "crashed", "dev server crashed")
                        .worktree(&id)
                        .detail(detail),
                )
                .await;
            warn!(id = %id, ?code, "worktree crashed");
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Filesystem- and id-safe slug: lowercase alphanumerics and dashes.
fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

fn checkout_branch(path: &std::path::Path) -> Result<String> {
    let repo = git2::Repository::open(path).map_err(|e| Error::git("open checkout", e))?;
    let head = repo.head().map_err(|e| Error::git("resolve HEAD", e))?;
    Ok(head.shorthand().unwrap_or("HEAD").to_string())
}
