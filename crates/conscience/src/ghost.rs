//! Message-framed control plane: JSON frames over one persistent TCP
//! connection per client.
//!
//! Frame shape: `{version:"2.0", id?, method, params | result | error}`,
//! newline-delimited. The first frame must be `connect` with the boot
//! token; a mismatch closes the connection. Everything after that is
//! gated by the client type's capability set. Events are broadcast as
//! id-less notification frames.

use kernel_core::action::{Action, Proposal};
use kernel_core::codes;
use kernel_core::ids::new_request_id;
use kernel_core::state::{ClientType, UserMode};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::kernel::{Kernel, KernelError};
use crate::registry::ClientInfo;

/// Outgoing frames buffered per connection before writes block.
const OUTGOING_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    version: String,
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(default)]
    token: String,
    #[serde(default)]
    client_type: String,
}

#[derive(Debug, Deserialize)]
struct ToggleParams {
    #[serde(default)]
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ExecRequestParams {
    #[serde(default)]
    request_id: String,
    intent: String,
    #[serde(default)]
    actions: Vec<Action>,
    #[serde(default)]
    expected_window: Option<String>,
    #[serde(default)]
    trace: String,
    #[serde(default, rename = "override")]
    override_requested: bool,
    #[serde(default)]
    agent_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecResolveParams {
    id: String,
    #[serde(default)]
    approved: Option<bool>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MemoryStoreParams {
    content: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    bounding_box: Option<JsonValue>,
    #[serde(default)]
    classification: Option<String>,
    #[serde(default)]
    embedding: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct MemorySearchParams {
    query: String,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FocusUpdateParams {
    window_title: String,
    #[serde(default)]
    process_name: String,
}

#[derive(Debug, Deserialize)]
struct SessionUpdateParams {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    user_mode: Option<String>,
}

fn ok_frame(id: Option<JsonValue>, result: JsonValue) -> String {
    json!({
        "version": "2.0",
        "id": id,
        "result": result,
    })
    .to_string()
}

fn err_frame(id: Option<JsonValue>, code: i64, message: &str) -> String {
    json!({
        "version": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
    .to_string()
}

/// Accept loop. Ends when the shutdown signal fires; live connections
/// notice the same signal and drain out.
pub async fn serve(
    kernel: Arc<Kernel>,
    listener: TcpListener,
    shutdown: watch::Receiver<bool>,
) {
    info!(addr = ?listener.local_addr().ok(), "ghost plane listening");
    let mut accept_shutdown = shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "ghost client connected");
                    tokio::spawn(handle_connection(
                        Arc::clone(&kernel),
                        socket,
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "ghost accept failed"),
            },
            _ = accept_shutdown.changed() => break,
        }
    }
}

async fn handle_connection(
    kernel: Arc<Kernel>,
    socket: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTGOING_BUFFER);

    // Writer task: one outbound lane per connection. A failed write ends
    // the connection; it never propagates to other clients.
    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    });

    let mut events = kernel.subscribe_events();
    let mut client: Option<ClientInfo> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        if raw.trim().is_empty() {
                            continue;
                        }
                        if process_line(&kernel, &raw, &mut client, &out_tx).await {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            event = events.recv() => {
                // Authenticated clients get the broadcast; a lagged
                // receiver just skips ahead.
                if client.is_some() {
                    if let Ok(ev) = event {
                        let _ = out_tx.send(ev.to_frame().to_string()).await;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    if let Some(c) = &client {
        kernel.registry().remove(&c.id);
        debug!(client_id = %c.id, "ghost client disconnected");
    }
    drop(out_tx);
    let _ = writer.await;
}

/// Handle one frame. Returns true when the connection must close.
async fn process_line(
    kernel: &Arc<Kernel>,
    raw: &str,
    client: &mut Option<ClientInfo>,
    out: &mpsc::Sender<String>,
) -> bool {
    let frame: Frame = match serde_json::from_str(raw) {
        Ok(f) => f,
        Err(_) => {
            let _ = out.send(err_frame(None, codes::PARSE_ERROR, "parse error")).await;
            return false;
        }
    };
    let id = frame.id.clone();
    let Some(method) = frame.method.as_deref() else {
        let _ = out
            .send(err_frame(id, codes::INVALID_REQUEST, "missing method"))
            .await;
        return false;
    };
    if !frame.version.is_empty() && frame.version != "2.0" {
        let _ = out
            .send(err_frame(id, codes::INVALID_REQUEST, "unsupported version"))
            .await;
        return false;
    }

    if method == "connect" {
        let params: ConnectParams = match parse_params(frame.params) {
            Ok(p) => p,
            Err(msg) => {
                let _ = out.send(err_frame(id, codes::INVALID_PARAMS, &msg)).await;
                return false;
            }
        };
        if params.token != kernel.token() {
            let _ = out.send(err_frame(id, codes::AUTH_FAILED, "bad token")).await;
            return true;
        }
        let Ok(client_type) = ClientType::from_str(&params.client_type) else {
            let _ = out
                .send(err_frame(id, codes::INVALID_PARAMS, "unknown client type"))
                .await;
            return false;
        };
        let info = kernel.registry().register(&new_request_id(), client_type);
        let result = json!({
            "client_id": info.id,
            "client_type": info.client_type.as_str(),
            "capabilities": info.capabilities,
        });
        *client = Some(info);
        let _ = out.send(ok_frame(id, result)).await;
        return false;
    }

    let Some(info) = client.as_ref() else {
        let _ = out
            .send(err_frame(id, codes::AUTH_FAILED, "connect first"))
            .await;
        return false;
    };
    if !info.may_call(method) {
        let _ = out
            .send(err_frame(
                id,
                codes::PERMISSION_DENIED,
                &format!("{} may not call {method}", info.client_type.as_str()),
            ))
            .await;
        return false;
    }

    let reply = match dispatch_method(kernel, method, frame.params) {
        Ok(result) => ok_frame(id, result),
        Err((code, message)) => err_frame(id, code, &message),
    };
    let _ = out.send(reply).await;
    false
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<JsonValue>) -> Result<T, String> {
    // Absent params read as an empty object so all-optional param
    // structs work without an explicit `"params": {}`.
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| format!("invalid params: {e}"))
}

type MethodResult = Result<JsonValue, (i64, String)>;

fn dispatch_method(kernel: &Arc<Kernel>, method: &str, params: Option<JsonValue>) -> MethodResult {
    match method {
        "wake" => {
            let p: ToggleParams = bad_params(parse_params(params))?;
            let current = kernel.voice().wake;
            let state = kernel.set_wake(p.enabled.unwrap_or(!current));
            Ok(json!({ "wake": state.wake }))
        }
        "talk_mode" => {
            let p: ToggleParams = bad_params(parse_params(params))?;
            let current = kernel.voice().talk;
            let state = kernel.set_talk(p.enabled.unwrap_or(!current));
            Ok(json!({ "talk": state.talk }))
        }
        "exec.request" => {
            let p: ExecRequestParams = bad_params(parse_params(params))?;
            let proposal = Proposal {
                id: p.request_id,
                intent: p.intent,
                actions: p.actions,
                expected_window: p.expected_window,
                trace_id: p.trace,
                override_requested: p.override_requested,
                agent_message: p.agent_message,
            };
            // Policy denials come back inside the result, not as errors.
            let verdict = kernel.request_permission(proposal).map_err(ghost_error)?;
            serde_json::to_value(&verdict)
                .map_err(|_| (codes::INTERNAL_ERROR, "internal error".to_string()))
        }
        "exec.resolve" => {
            let p: ExecResolveParams = bad_params(parse_params(params))?;
            if let Some(response) = p.response.as_deref() {
                let updated =
                    kernel.reply_clarification(&p.id, response).map_err(ghost_error)?;
                return Ok(json!({ "id": p.id, "status": updated.status.as_str() }));
            }
            if let Some(status) = p.status.as_deref() {
                let success = match status {
                    "COMPLETED" => true,
                    "FAILED" => false,
                    other => {
                        return Err((
                            codes::INVALID_PARAMS,
                            format!("unknown status {other:?}"),
                        ))
                    }
                };
                kernel.report_outcome(&p.id, success).map_err(ghost_error)?;
                return Ok(json!({ "id": p.id, "status": status }));
            }
            let Some(approved) = p.approved else {
                return Err((
                    codes::INVALID_PARAMS,
                    "one of approved, status or response is required".to_string(),
                ));
            };
            let decided = kernel.decide_approval(&p.id, approved).map_err(ghost_error)?;
            Ok(json!({ "id": p.id, "status": decided.status.as_str() }))
        }
        "memory.store" => {
            let p: MemoryStoreParams = bad_params(parse_params(params))?;
            let artifact = store::ArtifactRow {
                id: String::new(),
                timestamp: 0,
                content: p.content,
                kind: p.kind.unwrap_or_else(|| "artifact".to_string()),
                bounding_box: p
                    .bounding_box
                    .map_or_else(|| "{}".to_string(), |v| v.to_string()),
                classification: p.classification,
                summary: p.summary,
                embedding: p.embedding.map(|v| v.to_string()),
            };
            let id = kernel
                .memory_store(artifact)
                .map_err(|_| (codes::MEMORY_ERROR, "memory store failed".to_string()))?;
            Ok(json!({ "id": id }))
        }
        "memory.search" => {
            let p: MemorySearchParams = bad_params(parse_params(params))?;
            let hits = kernel
                .memory_search(&p.query, p.limit.unwrap_or(20))
                .map_err(|_| (codes::MEMORY_ERROR, "memory search failed".to_string()))?;
            Ok(json!({ "results": hits }))
        }
        "focus.update" => {
            let p: FocusUpdateParams = bad_params(parse_params(params))?;
            let snap = kernel.report_focus(&p.window_title, &p.process_name);
            Ok(json!({
                "window_title": snap.window_title,
                "process_name": snap.process_name,
            }))
        }
        "session.snapshot" => {
            let snapshot = kernel.session_snapshot().map_err(ghost_error)?;
            serde_json::to_value(&snapshot)
                .map_err(|_| (codes::INTERNAL_ERROR, "internal error".to_string()))
        }
        "session.update" => {
            let p: SessionUpdateParams = bad_params(parse_params(params))?;
            if let Some(mode) = p.mode.as_deref() {
                kernel.set_mode_from(mode).map_err(ghost_error)?;
            }
            if let (Some(domain), Some(raw)) = (p.domain.as_deref(), p.user_mode.as_deref()) {
                let user_mode = UserMode::from_str(raw)
                    .map_err(|_| (codes::INVALID_PARAMS, format!("unknown user mode {raw:?}")))?;
                kernel.set_user_mode(domain, user_mode).map_err(ghost_error)?;
            }
            let voice = kernel.voice();
            Ok(json!({
                "mode": kernel.mode().as_str(),
                "wake": voice.wake,
                "talk": voice.talk,
            }))
        }
        "registry.snapshot" => Ok(json!({ "clients": kernel.registry().snapshot() })),
        _ => Err((codes::METHOD_NOT_FOUND, format!("unknown method {method:?}"))),
    }
}

fn bad_params<T>(r: Result<T, String>) -> Result<T, (i64, String)> {
    r.map_err(|msg| (codes::INVALID_PARAMS, msg))
}

fn ghost_error(e: KernelError) -> (i64, String) {
    match e {
        KernelError::Validator => (codes::INTERNAL_ERROR, "validator error".to_string()),
        KernelError::UnknownMode(m) => (codes::INVALID_PARAMS, format!("unknown mode {m:?}")),
        KernelError::UnknownCommand(c) => {
            (codes::INVALID_PARAMS, format!("unknown command {c}"))
        }
        KernelError::Approval(approval::ApprovalError::NotFound(id)) => {
            (codes::INVALID_PARAMS, format!("proposal {id} not found"))
        }
        KernelError::Approval(approval::ApprovalError::InvalidTransition {
            id,
            actual,
            expected,
        }) => (
            codes::INVALID_PARAMS,
            format!("proposal {id} is {actual}, expected {expected}"),
        ),
        KernelError::Approval(_) | KernelError::Store(_) => {
            (codes::INTERNAL_ERROR, "internal error".to_string())
        }
    }
}
