//! Append-only activity event bus.
//!
//! Everything the allocator, supervisor, and lifecycle manager report lands
//! here. `append` is the only mutation: it assigns the next sequence number,
//! keeps the event in a bounded in-memory window for cursor queries, writes
//! one JSON line to `{state_dir}/activity.log`, and pushes an
//! `activity.appended` notification to every streaming subscriber. Consumers
//! can never block or slow down the core — file errors are swallowed with a
//! warning and broadcast drops are silent.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::warn;

use crate::ipc::event::EventBroadcaster;

/// In-memory query window. Older events remain in the JSONL file only.
const MEMORY_CAP: usize = 4096;
/// Rotate the JSONL file at 20 MB.
const ROTATE_BYTES: u64 = 20 * 1024 * 1024;

const DEFAULT_QUERY_LIMIT: usize = 100;
const MAX_QUERY_LIMIT: usize = 500;

// ─── Event ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    Lifecycle,
    Process,
    Ports,
    Git,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One immutable record of a lifecycle or subsystem state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    /// Monotonic sequence number — the query cursor.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub category: ActivityCategory,
    /// Machine-readable kind, e.g. `creation_completed`, `crashed`.
    pub kind: String,
    pub severity: Severity,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_id: Option<String>,
}

/// Draft of an event before the bus assigns seq + timestamp.
#[derive(Debug, Clone)]
pub struct Activity {
    pub category: ActivityCategory,
    pub kind: String,
    pub severity: Severity,
    pub title: String,
    pub detail: Option<String>,
    pub worktree_id: Option<String>,
}

impl Activity {
    pub fn info(category: ActivityCategory, kind: &str, title: impl Into<String>) -> Self {
        Self {
            category,
            kind: kind.to_string(),
            severity: Severity::Info,
            title: title.into(),
            detail: None,
            worktree_id: None,
        }
    }

    pub fn warning(category: ActivityCategory, kind: &str, title: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::info(category, kind, title)
        }
    }

    pub fn error(category: ActivityCategory, kind: &str, title: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            ..Self::info(category, kind, title)
        }
    }

    pub fn worktree(mut self, id: impl Into<String>) -> Self {
        self.worktree_id = Some(id.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ─── Bus ──────────────────────────────────────────────────────────────────────

struct BusState {
    events: VecDeque<ActivityEvent>,
    next_seq: u64,
}

pub struct ActivityBus {
    state: Mutex<BusState>,
    broadcaster: Arc<EventBroadcaster>,
    path: PathBuf,
    /// Cached, lazily opened file handle for the JSONL log.
    file: Mutex<Option<tokio::fs::File>>,
}

impl ActivityBus {
    pub fn new(path: PathBuf, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            state: Mutex::new(BusState {
                events: VecDeque::new(),
                next_seq: 1,
            }),
            broadcaster,
            path,
            file: Mutex::new(None),
        }
    }

    /// Append one event. Returns its sequence number.
    ///
    /// Events for one worktree are appended in the order its transitions
    /// occur, so append order is the delivery order for both the query
    /// window and the streaming feed.
    pub async fn append(&self, draft: Activity) -> u64 {
        let event = {
            let mut state = self.state.lock().await;
            let event = ActivityEvent {
                seq: state.next_seq,
                timestamp: Utc::now(),
                category: draft.category,
                kind: draft.kind,
                severity: draft.severity,
                title: draft.title,
                detail: draft.detail,
                worktree_id: draft.worktree_id,
            };
            state.next_seq += 1;
            if state.events.len() == MEMORY_CAP {
                state.events.pop_front();
            }
            state.events.push_back(event.clone());
            event
        };

        if let Err(e) = self.persist(&event).await {
            warn!(err = %e, "activity log write failed");
        }

        self.broadcaster.broadcast(
            "activity.appended",
            serde_json::to_value(&event).unwrap_or_default(),
        );
        event.seq
    }

    /// Events after `after_seq` (exclusive), chronological, optionally
    /// filtered by category and/or worktree, bounded by `limit`.
    ///
    /// Served from the in-memory window only. A cursor older than the
    /// oldest retained event yields results from the window's start; the
    /// JSONL file is the archival record, not a query source.
    pub async fn query(
        &self,
        after_seq: Option<u64>,
        category: Option<ActivityCategory>,
        worktree_id: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<ActivityEvent> {
        let limit = limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT);
        let cursor = after_seq.unwrap_or(0);
        let state = self.state.lock().await;
        state
            .events
            .iter()
            .filter(|e| e.seq > cursor)
            .filter(|e| category.is_none_or(|c| e.category == c))
            .filter(|e| worktree_id.is_none_or(|w| e.worktree_id.as_deref() == Some(w)))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Highest sequence number assigned so far (0 when empty).
    pub async fn latest_seq(&self) -> u64 {
        self.state.lock().await.next_seq - 1
    }

    async fn persist(&self, event: &ActivityEvent) -> Result<()> {
        let line = serde_json::to_string(event)? + "\n";
        let mut guard = self.file.lock().await;

        if guard.is_some() {
            if let Ok(meta) = tokio::fs::metadata(&self.path).await {
                if meta.len() >= ROTATE_BYTES {
                    *guard = None; // drop handle, flushes on drop
                    let rotated = self.path.with_extension("log.1");
                    let _ = tokio::fs::rename(&self.path, &rotated).await;
                }
            }
        }

        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(f);
        }

        guard.as_mut().unwrap().write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus(dir: &std::path::Path) -> ActivityBus {
        ActivityBus::new(
            dir.join("activity.log"),
            Arc::new(EventBroadcaster::new()),
        )
    }

    #[tokio::test]
    async fn append_assigns_increasing_seq() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = bus(tmp.path());
        let a = bus
            .append(Activity::info(ActivityCategory::System, "daemon_started", "up"))
            .await;
        let b = bus
            .append(Activity::info(ActivityCategory::Lifecycle, "stopped", "x").worktree("wt"))
            .await;
        assert!(b > a);
        assert_eq!(bus.latest_seq().await, b);
    }

    #[tokio::test]
    async fn query_respects_cursor_category_and_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = bus(tmp.path());
        for i in 0..10 {
            let cat = if i % 2 == 0 {
                ActivityCategory::Lifecycle
            } else {
                ActivityCategory::Process
            };
            bus.append(Activity::info(cat, "k", format!("event {i}"))).await;
        }

        let all = bus.query(None, None, None, None).await;
        assert_eq!(all.len(), 10);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));

        let after = bus.query(Some(5), None, None, None).await;
        assert_eq!(after.first().unwrap().seq, 6);

        let lifecycle = bus
            .query(None, Some(ActivityCategory::Lifecycle), None, None)
            .await;
        assert_eq!(lifecycle.len(), 5);

        let limited = bus.query(None, None, None, Some(3)).await;
        assert_eq!(limited.len(), 3);
    }

    #[tokio::test]
    async fn query_filters_by_worktree_in_append_order() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = bus(tmp.path());
        for kind in ["creating", "stopped", "starting", "running"] {
            bus.append(Activity::info(ActivityCategory::Lifecycle, kind, kind).worktree("a"))
                .await;
            bus.append(Activity::info(ActivityCategory::Lifecycle, kind, kind).worktree("b"))
                .await;
        }
        let a_events = bus.query(None, None, Some("a"), None).await;
        let kinds: Vec<&str> = a_events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["creating", "stopped", "starting", "running"]);
    }

    #[tokio::test]
    async fn events_are_persisted_as_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = bus(tmp.path());
        bus.append(
            Activity::error(ActivityCategory::Process, "crashed", "dev server crashed")
                .worktree("auth-fix")
                .detail("exit code 1"),
        )
        .await;

        let contents = std::fs::read_to_string(tmp.path().join("activity.log")).unwrap();
        let parsed: ActivityEvent = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.kind, "crashed");
        assert_eq!(parsed.worktree_id.as_deref(), Some("auth-fix"));
    }

    #[tokio::test]
    async fn streaming_subscribers_receive_appends_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let broadcaster = Arc::new(EventBroadcaster::new());
        let bus = ActivityBus::new(tmp.path().join("activity.log"), broadcaster.clone());
        let mut rx = broadcaster.subscribe();

        bus.append(Activity::info(ActivityCategory::Lifecycle, "starting", "s").worktree("w"))
            .await;
        bus.append(Activity::info(ActivityCategory::Lifecycle, "running", "r").worktree("w"))
            .await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.contains("\"starting\""));
        assert!(second.contains("\"running\""));
    }
}
