//! WebSocket protocol state machine: NEW → AUTHENTICATED → CLOSED. The
//! first frame on every connection must be `{type:"auth"}`. Before that,
//! malformed JSON gets an `INVALID_JSON` error and a well-formed frame
//! of any other type gets `NOT_AUTHENTICATED`, either way leaving the
//! connection open to retry; only a real `auth` frame with a bad key
//! gets `auth-ack{success:false}` followed by a close with code 1008.
//!
//! Grounded on `gateway::ws::handle_connection`'s write-loop task +
//! message-loop structure, adapted from its `connect`/`ConnectParams`
//! handshake to this protocol's `auth`/`auth-ack` handshake. The write
//! loop (and client registration) only starts once a session exists;
//! the handshake itself writes directly to the socket half so a failed
//! auth can send a real close frame instead of relying on a dropped
//! channel.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream, StreamExt};
use futures::SinkExt;
use relay_protocol::{
    error_codes, AuthAck, ClientFrame, ErrorPayload, ServerFrame, HANDSHAKE_TIMEOUT_MS, MAX_PAYLOAD_BYTES,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::GatewayState;
use crate::{chat_handler, command_handler, job_handler, system_handler};

const CLOSE_POLICY_VIOLATION: u16 = 1008;

pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, remote_addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let auth_result = tokio::time::timeout(
        std::time::Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
        wait_for_auth(&mut ws_rx, &mut ws_tx),
    )
    .await;

    let timed_out = matches!(auth_result, Err(_));
    let session = match auth_result {
        Ok(Some(params)) => state.auth.validate_api_key(&params.api_key, params.client_id.clone(), params.client_type.clone()),
        Ok(None) | Err(_) => None,
    };
    if timed_out {
        warn!(%remote_addr, "ws: handshake timed out");
    }

    let ack = ServerFrame::AuthAck(AuthAck {
        success: session.is_some(),
        session_token: session.as_ref().map(|s| s.session_token.clone()),
        server_version: state.server_version().to_string(),
        error: if session.is_some() { None } else { Some("invalid api key".into()) },
    });
    let _ = ws_tx.send(Message::Text(ack.to_json().into())).await;

    let Some(session) = session else {
        let _ = ws_tx.send(Message::Close(Some(policy_violation_close_frame()))).await;
        return;
    };
    let (session_token, client_id, client_type) = (session.session_token, session.client_id, session.client_type);

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let write_handle = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if ws_tx.send(Message::Text(frame.to_json().into())).await.is_err() {
                break;
            }
        }
    });

    state.registry.add(session_token.clone(), client_id, client_type, frame_tx.clone());
    info!(session_token = %session_token, %remote_addr, "ws: client authenticated");

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(session_token = %session_token, error = %e, "ws: read error");
                break;
            },
        };

        if text.len() > MAX_PAYLOAD_BYTES {
            let err = ServerFrame::Error(ErrorPayload::new(error_codes::INVALID_JSON, "payload too large"));
            let _ = frame_tx.send(err);
            continue;
        }

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(session_token = %session_token, error = %e, "ws: invalid frame");
                let err = ServerFrame::Error(ErrorPayload::new(error_codes::INVALID_JSON, e.to_string()));
                let _ = frame_tx.send(err);
                continue;
            },
        };

        dispatch(&state, &session_token, frame, &frame_tx).await;
    }

    state.registry.remove(&session_token);
    state.watches.remove_session(&session_token);
    info!(session_token = %session_token, "ws: connection closed");

    drop(frame_tx);
    write_handle.abort();
}

async fn dispatch(
    state: &Arc<GatewayState>,
    session_token: &str,
    frame: ClientFrame,
    reply: &mpsc::UnboundedSender<ServerFrame>,
) {
    match frame {
        ClientFrame::Auth(_) => {
            // Already authenticated; a second auth frame is ignored rather than
            // treated as an error, since clients may resend defensively.
        },
        ClientFrame::Ping => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            let _ = reply.send(ServerFrame::Pong { timestamp: now });
        },
        ClientFrame::JobSubmit(params) => {
            let response = job_handler::handle_submit(state, session_token, params).await;
            let _ = reply.send(response);
        },
        ClientFrame::JobCancel(params) => {
            let response = job_handler::handle_cancel(state, params).await;
            let _ = reply.send(response);
        },
        ClientFrame::ChatSend(params) => {
            chat_handler::handle_send(state.clone(), session_token.to_string(), params, reply.clone()).await;
        },
        ClientFrame::ChatAbort(params) => {
            chat_handler::handle_abort(state, session_token, params);
        },
        ClientFrame::SystemStatus(params) => {
            let response = system_handler::handle_status(state, params);
            let _ = reply.send(response);
        },
        ClientFrame::SystemSubscribe(params) => {
            let response = system_handler::handle_subscribe(state, session_token, params);
            let _ = reply.send(response);
        },
        ClientFrame::CmdExecute(params) => {
            let response = command_handler::handle_execute(state, session_token, params).await;
            let _ = reply.send(response);
        },
        ClientFrame::TraceStatus(params) => {
            let response = system_handler::handle_trace_status(state, params);
            let _ = reply.send(response);
        },
        ClientFrame::TraceCancelTask(params) => {
            let response = job_handler::handle_cancel_task(state, params).await;
            let _ = reply.send(response);
        },
    }
}

/// Reads frames until a real `auth` frame arrives or the stream ends.
/// Bad JSON and well-formed non-auth frames each get their own error
/// frame and do not end the handshake; only the caller closing on a
/// failed key check, or the peer itself closing, ends it here.
async fn wait_for_auth(
    rx: &mut SplitStream<WebSocket>,
    tx: &mut SplitSink<WebSocket, Message>,
) -> Option<relay_protocol::AuthParams> {
    while let Some(msg) = rx.next().await {
        let text = match msg.ok()? {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => return None,
            _ => continue,
        };
        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::Auth(params)) => return Some(params),
            Ok(_) => {
                let err = ServerFrame::Error(ErrorPayload::new(error_codes::NOT_AUTHENTICATED, "authenticate first"));
                let _ = tx.send(Message::Text(err.to_json().into())).await;
            },
            Err(e) => {
                let err = ServerFrame::Error(ErrorPayload::new(error_codes::INVALID_JSON, e.to_string()));
                let _ = tx.send(Message::Text(err.to_json().into())).await;
            },
        }
    }
    None
}

fn policy_violation_close_frame() -> CloseFrame {
    CloseFrame { code: CLOSE_POLICY_VIOLATION, reason: "authentication required".into() }
}
