//! Per-worktree process supervision.
//!
//! One supervisor per running worktree: it spawns the dev-server command
//! through the shell in the worktree directory (its own process group on
//! Unix, so the whole tree can be signalled), captures output into a bounded
//! ring buffer, answers the liveness probe, and reports how the process
//! ended. An operator-initiated stop sets the `stopping` flag before any
//! signal is sent, which is how the exit watcher tells a graceful stop from
//! a crash.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result};

// ─── Types ───────────────────────────────────────────────────────────────────

/// Everything needed to launch one dev-server process tree.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Shell command line, e.g. `npm run dev`.
    pub command: String,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub log_buffer_lines: usize,
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Operator-initiated stop completed (graceful or escalated).
    Stopped,
    /// Unexpected exit; carries the exit code when the OS reported one.
    Crashed(Option<i32>),
}

/// Liveness probe parameters. `port == None` means no probe: the caller
/// promotes the worktree immediately.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub port: Option<u16>,
    /// HTTP readiness path; plain TCP connect when absent.
    pub path: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ProcessSupervisor {
    pid: u32,
    logs: Arc<Mutex<VecDeque<String>>>,
    log_capacity: usize,
    stopping: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<ExitKind>>,
    force_kill: mpsc::Sender<()>,
}

impl ProcessSupervisor {
    /// Spawn the command and start the drain + exit-watcher tasks.
    pub fn spawn(spec: SpawnSpec) -> Result<Arc<Self>> {
        let mut cmd = shell_command(&spec.command);
        cmd.current_dir(&spec.working_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            Error::ProcessSpawn(format!(
                "'{}' in {}: {e}",
                spec.command,
                spec.working_dir.display()
            ))
        })?;
        let pid = child.id().unwrap_or(0);
        debug!(pid, command = %spec.command, "process spawned");

        let log_capacity = spec.log_buffer_lines.max(1);
        let logs: Arc<Mutex<VecDeque<String>>> =
            Arc::new(Mutex::new(VecDeque::with_capacity(log_capacity)));

        if let Some(stdout) = child.stdout.take() {
            let logs = logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_line(&logs, log_capacity, line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_line(&logs, log_capacity, line);
                }
            });
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(None);
        let (force_tx, mut force_rx) = mpsc::channel::<()>(1);

        // Exit watcher: owns the child, reaps it, and classifies the exit.
        let stopping_flag = stopping.clone();
        tokio::spawn(async move {
            let status = loop {
                let force = tokio::select! {
                    st = child.wait() => break st.ok(),
                    _ = force_rx.recv() => true,
                };
                if force {
                    let _ = child.start_kill();
                }
            };
            let kind = if stopping_flag.load(Ordering::Acquire) {
                ExitKind::Stopped
            } else {
                ExitKind::Crashed(status.and_then(|s| s.code()))
            };
            debug!(pid, ?kind, "process exited");
            let _ = exit_tx.send(Some(kind));
        });

        Ok(Arc::new(Self {
            pid,
            logs,
            log_capacity,
            stopping,
            exit_rx,
            force_kill: force_tx,
        }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Most recent output lines, oldest first. `last` trims to the tail.
    pub fn logs(&self, last: Option<usize>) -> Vec<String> {
        let buf = self.logs.lock().expect("log buffer lock poisoned");
        let take = last.unwrap_or(self.log_capacity).min(buf.len());
        buf.iter().skip(buf.len() - take).cloned().collect()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Resolve once the child has been reaped.
    pub async fn wait_exit(&self) -> ExitKind {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(kind) = *rx.borrow() {
                return kind;
            }
            if rx.changed().await.is_err() {
                return ExitKind::Crashed(None);
            }
        }
    }

    /// Graceful stop: SIGTERM to the process group, a bounded grace period,
    /// then SIGKILL. Always waits for the child to be reaped.
    pub async fn stop(&self, grace: Duration) {
        if self.has_exited() {
            return;
        }
        // Flag first, so the exit watcher classifies this as Stopped.
        self.stopping.store(true, Ordering::Release);

        #[cfg(unix)]
        signal_group(self.pid, libc::SIGTERM);
        #[cfg(not(unix))]
        let _ = self.force_kill.try_send(());

        if tokio::time::timeout(grace, self.wait_exit()).await.is_err() {
            warn!(pid = self.pid, "grace period elapsed — killing process group");
            #[cfg(unix)]
            signal_group(self.pid, libc::SIGKILL);
            let _ = self.force_kill.try_send(());
            self.wait_exit().await;
        }
    }

    /// Poll the readiness target until it answers, the overall timeout
    /// elapses, or the process exits. Returns whether the probe succeeded;
    /// the caller promotes to `running` on timeout regardless (best-effort
    /// optimism — the tunable lives in `LivenessConfig`).
    pub async fn wait_ready(&self, probe: &ProbeSpec) -> bool {
        let port = match probe.port {
            Some(p) => p,
            None => return true,
        };
        // One client for the whole poll loop; the per-request timeout is the
        // poll interval. If it cannot be built, fall through to raw TCP.
        let client = probe
            .path
            .as_ref()
            .and_then(|_| reqwest::Client::builder().timeout(probe.interval).build().ok());
        let deadline = tokio::time::Instant::now() + probe.timeout;

        loop {
            if self.has_exited() {
                return false;
            }
            let attempt = match (&probe.path, &client) {
                (Some(path), Some(client)) => http_probe(client, port, path).await,
                _ => tcp_probe(port, probe.interval).await,
            };
            if attempt {
                return true;
            }
            if tokio::time::Instant::now() + probe.interval >= deadline {
                return false;
            }
            tokio::time::sleep(probe.interval).await;
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn shell_command(command: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
    #[cfg(not(unix))]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    }
}

fn push_line(logs: &Mutex<VecDeque<String>>, capacity: usize, line: String) {
    let mut buf = logs.lock().expect("log buffer lock poisoned");
    if buf.len() == capacity {
        buf.pop_front();
    }
    buf.push_back(line);
}

/// Any HTTP response counts as ready — a 404 from the right server still
/// proves the port is being answered.
async fn http_probe(client: &reqwest::Client, port: u16, path: &str) -> bool {
    let url = format!("http://127.0.0.1:{port}{path}");
    client.get(&url).send().await.is_ok()
}

async fn tcp_probe(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) {
    if pid == 0 {
        return;
    }
    // Negative pid targets the whole process group created at spawn.
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
