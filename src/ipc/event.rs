use serde_json::Value;
use tokio::sync::broadcast;

/// Capacity of the fan-out channel. A subscriber that falls further behind
/// than this lags (and is told so) rather than blocking the core.
const CHANNEL_CAPACITY: usize = 1024;

/// Fans JSON-RPC notification strings out to all connected WebSocket clients.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Send a JSON-RPC notification to all connected clients.
    /// No subscribers is fine — the send result is ignored.
    pub fn broadcast(&self, method: &str, params: Value) {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        let _ = self
            .tx
            .send(serde_json::to_string(&notification).unwrap_or_default());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Currently attached streaming subscribers (for daemon.status).
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
