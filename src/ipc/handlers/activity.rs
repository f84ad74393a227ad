use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::activity::ActivityCategory;
use crate::AppContext;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryParams {
    after_seq: Option<u64>,
    category: Option<ActivityCategory>,
    worktree_id: Option<String>,
    limit: Option<usize>,
}

/// Cursor-based poll of the activity log. Streaming consumers attach to the
/// WebSocket feed instead and receive `activity.appended` notifications.
pub async fn query(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: QueryParams = if params.is_null() {
        QueryParams {
            after_seq: None,
            category: None,
            worktree_id: None,
            limit: None,
        }
    } else {
        serde_json::from_value(params)?
    };

    let events = ctx
        .activity
        .query(p.after_seq, p.category, p.worktree_id.as_deref(), p.limit)
        .await;
    let next_cursor = events.last().map(|e| e.seq);

    Ok(json!({ "events": events, "nextCursor": next_cursor }))
}
