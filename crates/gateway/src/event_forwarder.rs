//! Event Forwarder: drains the vault's Change Bus and the Upstream Chat
//! Bridge's event stream, translating each into protocol frames and
//! handing them to the Client Registry for delivery.
//!
//! Job lifecycle events are routed to `WatchSet[jobId]` only, so that
//! only sessions watching a given job see its events; everything else
//! goes through the Registry's pattern-matched `broadcast_event`.

use std::sync::Arc;

use relay_chat::BridgeEvent;
use relay_protocol::{ChatDelta, ChatFinal, ChatTool, JobCompleteFrame, JobStatusFrame, ServerFrame, SystemEvent};
use relay_vault::{ChangeEvent, JobStatus};
use tokio::sync::mpsc;
use tracing::warn;

use crate::state::GatewayState;

const JOB_EVENT_KINDS: &[&str] = &["job:completed", "job:failed", "job:claimed"];

/// Drain the vault change bus for as long as the gateway runs.
pub async fn run_change_bus_forwarder(state: Arc<GatewayState>) {
    let Some(mut receiver) = state.vault.subscribe_changes() else {
        warn!("change bus unavailable; live events disabled");
        return;
    };

    loop {
        match receiver.recv().await {
            Ok(event) => forward_change_event(&state, event),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event forwarder lagged behind the change bus");
            },
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn forward_change_event(state: &Arc<GatewayState>, event: ChangeEvent) {
    if JOB_EVENT_KINDS.contains(&event.kind.as_str()) {
        forward_job_event(state, &event);
        return;
    }
    state.registry.broadcast_event(
        &event.kind,
        ServerFrame::SystemEvent(SystemEvent { event: event.kind.clone(), payload: event.data.clone() }),
    );
}

fn forward_job_event(state: &Arc<GatewayState>, event: &ChangeEvent) {
    let Some(job_id) = event.data.as_ref().and_then(|d| d.get("jobId")).and_then(|v| v.as_str()) else { return };

    let Ok(Some(record)) = state.vault.get_job(job_id) else { return };
    let status = record.get("status").unwrap_or("pending");
    let is_terminal = JobStatus::parse(status).is_some_and(|s| s.is_terminal());

    let frame = if is_terminal {
        ServerFrame::JobComplete(JobCompleteFrame { job_id: job_id.to_string(), status: status.to_string(), result: None })
    } else {
        ServerFrame::JobStatus(JobStatusFrame { job_id: job_id.to_string(), status: status.to_string() })
    };

    for watcher in state.watches.watchers(job_id) {
        state.registry.send_to(&watcher, frame.clone());
    }

    if is_terminal {
        state.watches.stop_watching_job(job_id);
    }
}

/// Drain upstream chat bridge events, routing each by request id
/// through `state.pending_chat_requests`. The first event observed for
/// a request fires its `chat_armed` one-shot, telling the Chat Handler
/// this request is being served upstream and the fallback should stand
/// down.
pub async fn run_bridge_forwarder(state: Arc<GatewayState>, mut events: mpsc::UnboundedReceiver<BridgeEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            BridgeEvent::TraceProgress(payload) => {
                state.registry.broadcast_event("trace:progress", ServerFrame::TraceProgress(payload));
            },
            BridgeEvent::Delta { request_id, text } => {
                arm(&state, &request_id);
                let index = state.next_chat_delta_index(&request_id);
                deliver_to_request(&state, &request_id, ServerFrame::ChatDelta(ChatDelta { request_id: request_id.clone(), index, delta: text }));
            },
            BridgeEvent::Tool { request_id, tool } => {
                arm(&state, &request_id);
                deliver_to_request(&state, &request_id, ServerFrame::ChatTool(ChatTool { request_id: request_id.clone(), tool }));
            },
            BridgeEvent::Final { request_id, text } => {
                arm(&state, &request_id);
                deliver_to_request(&state, &request_id, ServerFrame::ChatFinal(ChatFinal { request_id: request_id.clone(), content: text }));
                state.pending_chat_requests.lock().unwrap().remove(&request_id);
                state.clear_chat_delta_index(&request_id);
            },
            BridgeEvent::Error { request_id, message } => {
                arm(&state, &request_id);
                deliver_to_request(
                    &state,
                    &request_id,
                    ServerFrame::Error(relay_protocol::ErrorPayload::new(relay_protocol::error_codes::CHAT_ERROR, message).with_request_id(request_id.clone())),
                );
                state.pending_chat_requests.lock().unwrap().remove(&request_id);
                state.clear_chat_delta_index(&request_id);
            },
        }
    }
}

fn arm(state: &Arc<GatewayState>, request_id: &str) {
    if let Some(tx) = state.chat_armed.lock().unwrap().remove(request_id) {
        let _ = tx.send(());
    }
}

fn deliver_to_request(state: &Arc<GatewayState>, request_id: &str, frame: ServerFrame) {
    if let Some(session_token) = state.pending_chat_requests.lock().unwrap().get(request_id).cloned() {
        state.registry.send_to(&session_token, frame);
    }
}
