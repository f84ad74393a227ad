//! WebSocket JSON-RPC 2.0 control surface.
//!
//! One listener serves request/response RPCs and the streaming activity
//! feed on the same connection: broadcast notifications are interleaved
//! with responses in the per-connection select loop. A plain HTTP
//! `GET /health` on the same port answers liveness checks without a
//! WebSocket library.

pub mod event;
pub mod handlers;

use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::AppContext;

// ─── JSON-RPC 2.0 types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

// ─── Error codes ─────────────────────────────────────────────────────────────

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;

const WORKTREE_NOT_FOUND: i32 = -32001;
/// A lifecycle operation is already in flight for this worktree id.
const OPERATION_IN_PROGRESS: i32 = -32002;
const NO_OFFSET_AVAILABLE: i32 = -32003;
const INVALID_STATE: i32 = -32004;
const GIT_OPERATION_FAILED: i32 = -32005;
const PROCESS_SPAWN_FAILED: i32 = -32006;
const CONFIGURATION_ERROR: i32 = -32007;

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let (addr, port) = {
        let config = ctx.config.read().await;
        (
            format!("{}:{}", config.bind_address, config.listen_port),
            config.listen_port,
        )
    };
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "control server listening (WebSocket + HTTP health on same port)");

    ctx.broadcaster.broadcast(
        "daemon.ready",
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "port": port
        }),
    );

    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C (all platforms).
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping running worktrees");
                ctx.worktrees.stop_all().await;
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("control server stopped");
    Ok(())
}

async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Respond to `GET /health` with a JSON status document.
async fn handle_health_check(mut stream: tokio::net::TcpStream, ctx: &AppContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request — any GET /health is fine.
    let mut req_buf = vec![0u8; 2048];
    let _ = stream.read(&mut req_buf).await;

    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "runningWorktrees": ctx.worktrees.running_count().await,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn handle_connection(stream: tokio::net::TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    // Health checks share the port with WebSocket upgrades; peek for the
    // /health path and fall through to the WS handshake for everything else.
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 11 && &peek_buf[..11] == b"GET /health" {
        return handle_health_check(stream, &ctx).await;
    }

    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();
    let mut broadcast_rx = ctx.broadcaster.subscribe();

    loop {
        tokio::select! {
            // Incoming request from the client
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response = dispatch_text(&text, &ctx).await;
                        if let Err(e) = sink.send(Message::Text(response)).await {
                            warn!(err = %e, "send error");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            // Outgoing streamed event
            event = broadcast_rx.recv() => {
                match event {
                    Ok(json) => {
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            warn!(err = %e, "broadcast send error");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "broadcast lagged");
                    }
                }
            }
        }
    }
    Ok(())
}

pub(crate) async fn dispatch_text(text: &str, ctx: &AppContext) -> String {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => {
            return error_response(Value::Null, PARSE_ERROR, "Parse error");
        }
    };

    if req.jsonrpc != "2.0" {
        return error_response(
            req.id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "Invalid Request",
        );
    }

    let id = req.id.unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);

    debug!(method = %req.method, "rpc dispatch");

    match dispatch(&req.method, params, ctx).await {
        Ok(value) => {
            let resp = RpcResponse {
                jsonrpc: "2.0",
                id,
                result: Some(value),
                error: None,
            };
            serde_json::to_string(&resp).unwrap_or_default()
        }
        Err(e) => {
            let (code, msg) = classify_error(&e);
            error_response(id, code, &msg)
        }
    }
}

async fn dispatch(method: &str, params: Value, ctx: &AppContext) -> anyhow::Result<Value> {
    match method {
        "daemon.ping" => handlers::daemon::ping(params, ctx).await,
        "daemon.status" => handlers::daemon::status(params, ctx).await,
        "worktree.list" => handlers::worktree::list(params, ctx).await,
        "worktree.get" => handlers::worktree::get(params, ctx).await,
        "worktree.create" => handlers::worktree::create(params, ctx).await,
        "worktree.rename" => handlers::worktree::rename(params, ctx).await,
        "worktree.remove" => handlers::worktree::remove(params, ctx).await,
        "worktree.start" => handlers::worktree::start(params, ctx).await,
        "worktree.stop" => handlers::worktree::stop(params, ctx).await,
        "worktree.logs" => handlers::worktree::logs(params, ctx).await,
        "worktree.link" => handlers::worktree::link(params, ctx).await,
        "ports.config" => handlers::ports::config(params, ctx).await,
        "ports.discover" => handlers::ports::discover(params, ctx).await,
        "activity.query" => handlers::activity::query(params, ctx).await,
        _ => Err(anyhow::anyhow!("METHOD_NOT_FOUND:{}", method)),
    }
}

/// Map a handler error to a JSON-RPC code. Domain errors carry their own
/// classification; everything else is an internal error.
fn classify_error(e: &anyhow::Error) -> (i32, String) {
    use crate::error::Error;

    if let Some(domain) = e.downcast_ref::<Error>() {
        let code = match domain {
            Error::WorktreeNotFound(_) => WORKTREE_NOT_FOUND,
            Error::OperationInProgress(_) => OPERATION_IN_PROGRESS,
            Error::NoOffsetAvailable { .. } => NO_OFFSET_AVAILABLE,
            Error::InvalidState { .. } => INVALID_STATE,
            Error::GitOperation(_) => GIT_OPERATION_FAILED,
            Error::ProcessSpawn(_) => PROCESS_SPAWN_FAILED,
            Error::Configuration(_) => CONFIGURATION_ERROR,
            Error::Collaborator(_) => INTERNAL_ERROR,
        };
        return (code, domain.to_string());
    }

    let msg = e.to_string();
    if msg.starts_with("METHOD_NOT_FOUND:") {
        return (METHOD_NOT_FOUND, "Method not found".to_string());
    }
    if msg.contains("missing field") || msg.contains("invalid type") {
        return (INVALID_PARAMS, format!("Invalid params: {msg}"));
    }
    error!(err = %e, "internal error");
    (INTERNAL_ERROR, "Internal error".to_string())
}

fn error_response(id: Value, code: i32, message: &str) -> String {
    let resp = RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcError {
            code,
            message: message.to_string(),
        }),
    };
    serde_json::to_string(&resp).unwrap_or_default()
}
