use anyhow::Result;
use serde_json::{json, Value};

use crate::AppContext;

pub async fn ping(_params: Value, _ctx: &AppContext) -> Result<Value> {
    Ok(json!({ "pong": true, "timestamp": chrono::Utc::now() }))
}

pub async fn status(_params: Value, ctx: &AppContext) -> Result<Value> {
    let config = ctx.config.read().await;
    let by_status = ctx.worktrees.counts_by_status().await;
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "projectDir": config.project_dir,
        "listenPort": config.listen_port,
        "virtualizationEnabled": config.virtualization_enabled(),
        "worktrees": by_status,
        "subscribers": ctx.broadcaster.subscriber_count(),
        "latestActivitySeq": ctx.activity.latest_seq().await,
    }))
}
