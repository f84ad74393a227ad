use anyhow::Result;
use serde_json::{json, Value};
use tracing::info;

use crate::activity::{Activity, ActivityCategory};
use crate::ports::{discovery, env_map};
use crate::AppContext;

pub async fn config(_params: Value, ctx: &AppContext) -> Result<Value> {
    let config = ctx.config.read().await;
    Ok(json!({
        "discoveredPorts": config.ports.discovered_ports,
        "offsetStep": config.ports.offset_step,
        "envMapping": config.env_mapping,
        "virtualizationEnabled": config.virtualization_enabled(),
        "heldOffsets": ctx.allocator.held_offsets().iter()
            .map(|(offset, id)| json!({ "offset": offset, "worktreeId": id }))
            .collect::<Vec<_>>(),
    }))
}

/// Re-scan the project for base ports, re-detect the env mapping, and
/// persist both. This is the one explicit config update operation.
pub async fn discover(_params: Value, ctx: &AppContext) -> Result<Value> {
    let project_dir = ctx.config.read().await.project_dir.clone();

    let ports =
        tokio::task::spawn_blocking(move || discovery::discover_ports(&project_dir)).await?;

    let (mapping, snapshot) = {
        let mut config = ctx.config.write().await;
        config.ports.discovered_ports = ports.clone();
        let mapping = env_map::detect_env_mapping(&config.project_dir, &ports);
        config.env_mapping = mapping.clone();
        config.save()?;
        (mapping, config.clone())
    };

    info!(ports = ?ports, mappings = mapping.len(), "port discovery persisted");
    ctx.activity
        .append(
            Activity::info(
                ActivityCategory::Ports,
                "port_discovery_completed",
                format!("discovered {} port(s)", ports.len()),
            )
            .detail(format!("{ports:?}")),
        )
        .await;

    Ok(json!({
        "success": true,
        "discoveredPorts": snapshot.ports.discovered_ports,
        "envMapping": snapshot.env_mapping,
    }))
}
