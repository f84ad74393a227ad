use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::AppContext;

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    branch: String,
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameParams {
    id: String,
    name: Option<String>,
    branch: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsParams {
    id: String,
    lines: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkParams {
    id: String,
    issue: Option<String>,
    pull_request: Option<String>,
}

pub async fn list(_params: Value, ctx: &AppContext) -> Result<Value> {
    let worktrees = ctx.worktrees.list().await;
    Ok(json!({ "worktrees": worktrees }))
}

pub async fn get(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: IdParams = serde_json::from_value(params)?;
    let info = ctx.worktrees.get(&p.id).await?;
    Ok(json!({ "worktree": info }))
}

pub async fn create(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: CreateParams = serde_json::from_value(params)?;
    let info = ctx.worktrees.create(&p.branch, p.name.as_deref()).await?;
    Ok(json!({ "success": true, "worktree": info }))
}

pub async fn rename(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: RenameParams = serde_json::from_value(params)?;
    let info = ctx
        .worktrees
        .rename(&p.id, p.name.as_deref(), p.branch.as_deref())
        .await?;
    Ok(json!({ "success": true, "worktree": info }))
}

pub async fn remove(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: IdParams = serde_json::from_value(params)?;
    ctx.worktrees.remove(&p.id).await?;
    Ok(json!({ "success": true }))
}

pub async fn start(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: IdParams = serde_json::from_value(params)?;
    let info = ctx.worktrees.start(&p.id).await?;
    Ok(json!({ "success": true, "worktree": info }))
}

pub async fn stop(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: IdParams = serde_json::from_value(params)?;
    ctx.worktrees.stop(&p.id).await?;
    Ok(json!({ "success": true }))
}

pub async fn logs(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: LogsParams = serde_json::from_value(params)?;
    let lines = ctx.worktrees.logs(&p.id, p.lines).await?;
    Ok(json!({ "lines": lines }))
}

/// Attach externally-supplied issue / pull-request references. Lifecycle
/// state is untouched.
pub async fn link(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: LinkParams = serde_json::from_value(params)?;
    let info = ctx
        .worktrees
        .set_linkage(&p.id, p.issue, p.pull_request)
        .await?;
    Ok(json!({ "success": true, "worktree": info }))
}
