//! orchard: a daemon that manages isolated git worktrees for one project,
//! each with its own dev-server process and virtualized port space.
//!
//! A worktree gets a port offset from the allocator; its child environment
//! carries offset-adjusted literals for detected port variables, and the
//! preload shim rewrites the rest at the socket layer. Control happens over
//! a WebSocket JSON-RPC surface that also streams activity events.

pub mod activity;
pub mod config;
pub mod error;
pub mod instance;
pub mod ipc;
pub mod ports;
pub mod supervisor;
pub mod worktree;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::activity::ActivityBus;
use crate::config::ProjectConfig;
use crate::ipc::event::EventBroadcaster;
use crate::ports::PortAllocator;
use crate::worktree::WorktreeManager;

/// Shared state handed to every RPC handler and background task.
pub struct AppContext {
    pub config: Arc<RwLock<ProjectConfig>>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub activity: Arc<ActivityBus>,
    pub allocator: Arc<PortAllocator>,
    pub worktrees: WorktreeManager,
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(config: ProjectConfig) -> Arc<Self> {
        let activity_path = config.activity_log_file();
        let config = Arc::new(RwLock::new(config));
        let broadcaster = Arc::new(EventBroadcaster::new());
        let activity = Arc::new(ActivityBus::new(activity_path, broadcaster.clone()));
        let allocator = Arc::new(PortAllocator::new());
        let worktrees = WorktreeManager::new(
            config.clone(),
            allocator.clone(),
            activity.clone(),
            broadcaster.clone(),
        );
        Arc::new(Self {
            config,
            broadcaster,
            activity,
            allocator,
            worktrees,
            started_at: Instant::now(),
        })
    }
}
