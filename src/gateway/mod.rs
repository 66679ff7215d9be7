//! Runner Gateway (§4.2). WebSocket server that runner processes dial into;
//! every exchange is a JSON-RPC 2.0 envelope. Grounded directly on the
//! teacher's `ipc::mod` — same per-IP connection rate limiter, per-connection
//! RPC rate limiter, constant-time auth token comparison, and
//! structured-prefix-then-heuristic error classification. Direction is
//! inverted: here the control plane is the server and runners are clients
//! authenticating with a per-runner token instead of a single daemon secret.
//!
//! The runner -> core half of the wire table (`status`, `project_register`,
//! `agent_update`, `task_complete`, `error`, `heartbeat_ack`) arrives as RPC
//! calls and is handled by the caller's [`RpcDispatcher`]. The core -> runner
//! half (`heartbeat`, `task_assign`, `agent_cancel`, `agent_resume`,
//! `shutdown`) is a push: [`OutboundRegistry`] holds one channel per
//! currently-connected runner so the router/orchestrator layer can send a
//! notification without reaching into the WebSocket itself. `run` also
//! drives the §6.1 30s application-level heartbeat probe on every
//! connection.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use crate::error::SibylError;

const MAX_CONNECTIONS_PER_MIN: usize = 20;
const MAX_RPC_PER_SEC: u32 = 200;
/// §6.1: application-level heartbeat pushed to every connected runner.
const CORE_HEARTBEAT_INTERVAL_SECS: u64 = 30;

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const UNAUTHORIZED: i32 = -32004;
const RATE_LIMITED: i32 = -32003;
const NOT_FOUND: i32 = -32010;
const CONFLICT: i32 = -32011;
const CAPACITY: i32 = -32012;
const VALIDATION: i32 = -32013;

struct ConnectionRateLimiter {
    connections: HashMap<IpAddr, Vec<Instant>>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - std::time::Duration::from_secs(60);
        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);
        if timestamps.len() >= MAX_CONNECTIONS_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}

struct RpcRateLimiter {
    count: u32,
    window_start: Instant,
}

impl RpcRateLimiter {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }

    fn check(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start).as_secs() >= 1 {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= MAX_RPC_PER_SEC
    }
}

fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

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

/// Resolve a runner's per-connection token. Supplied by the caller (backed
/// by the runner registry / a secrets store); returning `None` rejects the
/// connection as unauthorized.
#[async_trait::async_trait]
pub trait RunnerAuthenticator: Send + Sync {
    async fn token_for_runner(&self, runner_id: &str) -> Option<String>;
}

/// Routes a parsed RPC call to whatever component owns that method. Kept as
/// a trait so the gateway itself stays free of orchestrator/registry
/// dependencies — production wiring implements this over `AppContext`.
#[async_trait::async_trait]
pub trait RpcDispatcher: Send + Sync {
    async fn dispatch(&self, method: &str, params: Value) -> anyhow::Result<Value>;
}

/// Holds one outbound channel per currently-connected runner so any
/// component (the router, a TaskOrchestrator driver, an operator command)
/// can push a core -> runner message (§4.2's second half of the wire
/// table: `heartbeat`, `task_assign`, `agent_cancel`, `agent_resume`,
/// `shutdown`) without itself touching the WebSocket. Each push is a
/// JSON-RPC 2.0 notification (no `id`, no response expected) — the runner
/// answers asynchronously over the same connection via the normal
/// runner -> core methods (e.g. `task_complete`, `heartbeat_ack`).
pub struct OutboundRegistry {
    senders: RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

pub type SharedOutboundRegistry = Arc<OutboundRegistry>;

impl OutboundRegistry {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    /// `pub(crate)` rather than private: exercised directly by the
    /// `dispatch` module's tests to simulate a connected runner without
    /// spinning up a real WebSocket.
    pub(crate) async fn register(&self, runner_id: &str, tx: mpsc::UnboundedSender<Message>) {
        self.senders.write().await.insert(runner_id.to_string(), tx);
    }

    pub(crate) async fn unregister(&self, runner_id: &str) {
        self.senders.write().await.remove(runner_id);
    }

    pub async fn is_connected(&self, runner_id: &str) -> bool {
        self.senders.read().await.contains_key(runner_id)
    }

    fn notification(method: &str, params: Value) -> Message {
        Message::Text(
            serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
            })
            .to_string(),
        )
    }

    async fn push(&self, runner_id: &str, method: &str, params: Value) -> Result<()> {
        let senders = self.senders.read().await;
        let tx = senders
            .get(runner_id)
            .ok_or_else(|| anyhow::anyhow!("runner not connected: {runner_id}"))?;
        tx.send(Self::notification(method, params))
            .map_err(|_| anyhow::anyhow!("runner channel closed: {runner_id}"))
    }

    /// core -> runner `task_assign` (§4.2).
    pub async fn task_assign(&self, runner_id: &str, params: Value) -> Result<()> {
        self.push(runner_id, "task_assign", params).await
    }

    /// core -> runner `agent_cancel` (§4.2).
    pub async fn agent_cancel(&self, runner_id: &str, agent_id: &str, reason: &str) -> Result<()> {
        self.push(
            runner_id,
            "agent_cancel",
            serde_json::json!({"agent_id": agent_id, "reason": reason}),
        )
        .await
    }

    /// core -> runner `agent_resume` (§4.2).
    pub async fn agent_resume(&self, runner_id: &str, agent_id: &str, checkpoint_ref: &str) -> Result<()> {
        self.push(
            runner_id,
            "agent_resume",
            serde_json::json!({"agent_id": agent_id, "checkpoint_ref": checkpoint_ref}),
        )
        .await
    }

    /// core -> runner `shutdown` (§4.2): graceful drain.
    pub async fn shutdown(&self, runner_id: &str) -> Result<()> {
        self.push(runner_id, "shutdown", serde_json::json!({})).await
    }
}

impl Default for OutboundRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GatewayConfig {
    pub bind_addr: String,
}

pub async fn run(
    config: GatewayConfig,
    authenticator: Arc<dyn RunnerAuthenticator>,
    dispatcher: Arc<dyn RpcDispatcher>,
    outbound: SharedOutboundRegistry,
) -> Result<()> {
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "runner gateway listening");

    let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "accept error");
                continue;
            }
        };

        {
            let mut limiter = conn_limiter.lock().await;
            if !limiter.check_and_record(peer.ip()) {
                warn!(peer = %peer, "connection rate limit exceeded — rejecting");
                drop(stream);
                continue;
            }
        }

        debug!(peer = %peer, "runner connection accepted");
        let authenticator = authenticator.clone();
        let dispatcher = dispatcher.clone();
        let outbound = outbound.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, authenticator, dispatcher, outbound).await {
                warn!(peer = %peer, err = %e, "runner connection error");
            }
        });
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    authenticator: Arc<dyn RunnerAuthenticator>,
    dispatcher: Arc<dyn RpcDispatcher>,
    outbound: SharedOutboundRegistry,
) -> Result<()> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 * 1024 * 1024),
        max_frame_size: Some(4 * 1024 * 1024),
        ..Default::default()
    };
    let ws = accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut sink, mut stream) = ws.split();

    // First message must be a `runner.auth` RPC carrying {runner_id, token}.
    let first = tokio::time::timeout(std::time::Duration::from_secs(10), stream.next()).await;
    let text = match first {
        Ok(Some(Ok(Message::Text(t)))) => t,
        _ => return Ok(()),
    };
    let req: RpcRequest = match serde_json::from_str(&text) {
        Ok(r) => r,
        Err(_) => {
            let _ = sink
                .send(Message::Text(error_response(Value::Null, PARSE_ERROR, "Parse error")))
                .await;
            return Ok(());
        }
    };
    let id = req.id.clone().unwrap_or(Value::Null);
    if req.method != "runner.auth" {
        let _ = sink
            .send(Message::Text(error_response(
                id,
                UNAUTHORIZED,
                "Unauthorized — send runner.auth first",
            )))
            .await;
        return Ok(());
    }
    let runner_id = req
        .params
        .as_ref()
        .and_then(|p| p.get("runner_id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let provided = req
        .params
        .as_ref()
        .and_then(|p| p.get("token"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let expected = authenticator.token_for_runner(&runner_id).await;
    let authorized = matches!(&expected, Some(t) if tokens_equal(provided, t));
    if !authorized {
        let _ = sink
            .send(Message::Text(error_response(id, UNAUTHORIZED, "Unauthorized — invalid token")))
            .await;
        return Ok(());
    }

    let resp = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": { "authenticated": true },
    });
    let _ = sink.send(Message::Text(resp.to_string())).await;
    debug!(runner_id = %runner_id, "runner authenticated");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    outbound.register(&runner_id, out_tx).await;

    let mut rpc_limiter = RpcRateLimiter::new();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(CORE_HEARTBEAT_INTERVAL_SECS));
    heartbeat.tick().await; // first tick fires immediately; consume it so the probe starts after one full interval

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !rpc_limiter.check() {
                            let resp = error_response(Value::Null, RATE_LIMITED, "RPC rate limit exceeded");
                            if sink.send(Message::Text(resp)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        let response = dispatch_text(&text, dispatcher.as_ref()).await;
                        if sink.send(Message::Text(response)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(runner_id = %runner_id, err = %e, "websocket error");
                        break;
                    }
                }
            }
            Some(push) = out_rx.recv() => {
                if sink.send(push).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                // §6.1: liveness probe; the runner is expected to answer with
                // `heartbeat_ack` within 10s. The gateway itself does not
                // enforce that window — a missed ack simply leaves the
                // runner's registry heartbeat stale, which the router (§4.3)
                // already penalizes.
                if sink.send(OutboundRegistry::notification("heartbeat", serde_json::json!({}))).await.is_err() {
                    break;
                }
            }
        }
    }

    outbound.unregister(&runner_id).await;
    debug!(runner_id = %runner_id, "runner disconnected");
    Ok(())
}

async fn dispatch_text(text: &str, dispatcher: &dyn RpcDispatcher) -> String {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => return error_response(Value::Null, PARSE_ERROR, "Parse error"),
    };
    if req.jsonrpc != "2.0" {
        return error_response(req.id.unwrap_or(Value::Null), INVALID_REQUEST, "Invalid Request");
    }
    let id = req.id.unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);
    trace!(method = %req.method, "gateway rpc dispatch");

    match dispatcher.dispatch(&req.method, params).await {
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

/// Narrow an `anyhow::Error` to an RPC error code. Checks for a downcast to
/// `SibylError` first; falls back to a message-prefix sniff for errors that
/// cross a `spawn_blocking`/ffi boundary and lose their concrete type.
fn classify_error(e: &anyhow::Error) -> (i32, String) {
    if let Some(err) = e.downcast_ref::<SibylError>() {
        return match err {
            SibylError::Authorization(m) => (UNAUTHORIZED, m.clone()),
            SibylError::Validation(m) => (VALIDATION, m.clone()),
            SibylError::NotFound(m) => (NOT_FOUND, m.clone()),
            SibylError::Conflict(m) => (CONFLICT, m.clone()),
            SibylError::Capacity(m) => (CAPACITY, m.clone()),
            SibylError::RunnerFault(m) => (INTERNAL, m.clone()),
            SibylError::GateFailure(m) => (INTERNAL, m.clone()),
            SibylError::Internal { message, .. } => (INTERNAL, message.clone()),
        };
    }

    let msg = e.to_string();
    if msg.starts_with("METHOD_NOT_FOUND:") {
        return (METHOD_NOT_FOUND, "Method not found".to_string());
    }
    if msg.contains("not found") {
        return (NOT_FOUND, msg);
    }
    if msg.contains("already") || msg.contains("conflict") {
        return (CONFLICT, msg);
    }
    (INTERNAL, msg)
}

const INTERNAL: i32 = -32603;
