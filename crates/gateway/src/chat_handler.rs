//! Two-tier chat routing: prefer the Upstream Chat Bridge; if it hasn't
//! produced a first delta within the arming window, fall back to a
//! synchronous streamed HTTP chat completion. Memory tags in the
//! assistant's final text are applied and stripped before delivery.

use std::sync::Arc;

use relay_chat::{context, fallback, memory_tags};
use relay_protocol::{error_codes, ChatAbortParams, ChatDelta, ChatFinal, ChatSendParams, ErrorPayload, ServerFrame, UPSTREAM_ARMING_MS};
use tokio::sync::mpsc;
use tracing::warn;

use crate::state::GatewayState;

pub async fn handle_send(
    state: Arc<GatewayState>,
    session_token: String,
    params: ChatSendParams,
    reply: mpsc::UnboundedSender<ServerFrame>,
) {
    let request_id = params.request_id.clone();

    if let Some(bridge) = state.chat_bridge.clone() {
        if bridge.is_connected() {
            if try_upstream(&state, &bridge, session_token.clone(), params.clone(), reply.clone()).await {
                return;
            }
        }
    }

    run_fallback(&state, session_token, params, reply).await;
    let _ = request_id;
}

/// Attempt the upstream path, arming a 30s timer for the bridge's first
/// event on this request. If the Event Forwarder never wakes the
/// armed signal — bridge down, request dropped mid-flight — the caller
/// falls back to the synchronous HTTP path. Once armed, the Event
/// Forwarder owns delivery for the rest of this request's lifetime.
async fn try_upstream(
    state: &Arc<GatewayState>,
    bridge: &relay_chat::UpstreamChatBridge,
    session_token: String,
    params: ChatSendParams,
    reply: mpsc::UnboundedSender<ServerFrame>,
) -> bool {
    let request_id = params.request_id.clone();
    let (armed_tx, armed_rx) = tokio::sync::oneshot::channel();
    state.chat_armed.lock().unwrap().insert(request_id.clone(), armed_tx);
    state.pending_chat_requests.lock().unwrap().insert(request_id.clone(), session_token.clone());

    if bridge
        .send_chat_message(params.content.clone(), session_token.clone(), request_id.clone(), params.thread_id.clone())
        .is_err()
    {
        state.chat_armed.lock().unwrap().remove(&request_id);
        state.pending_chat_requests.lock().unwrap().remove(&request_id);
        return false;
    }

    let state = state.clone();
    let waited = tokio::time::timeout(std::time::Duration::from_millis(UPSTREAM_ARMING_MS), armed_rx).await;
    match waited {
        Ok(Ok(())) => true,
        _ => {
            state.chat_armed.lock().unwrap().remove(&request_id);
            state.pending_chat_requests.lock().unwrap().remove(&request_id);
            run_fallback(&state, session_token, params, reply).await;
            true
        },
    }
}

async fn run_fallback(state: &Arc<GatewayState>, session_token: String, params: ChatSendParams, reply: mpsc::UnboundedSender<ServerFrame>) {
    let request_id = params.request_id.clone();
    let model = params.model_override.clone().unwrap_or_else(|| state.chat_fallback.model.clone());

    let inputs = context::ContextInputs { client_type: "relay", current_time: &chrono::Utc::now().to_rfc3339(), ..Default::default() };
    let system_prompt = context::build_system_prompt(&inputs);

    let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
    let forward_request_id = request_id.clone();
    let forward_reply = reply.clone();
    let forward_handle = tokio::spawn(async move {
        let mut index = 0u64;
        while let Some(delta) = delta_rx.recv().await {
            let _ = forward_reply.send(ServerFrame::ChatDelta(ChatDelta { request_id: forward_request_id.clone(), index, delta }));
            index += 1;
        }
    });

    let result = fallback::stream_chat_completion(
        &state.http_client,
        &state.chat_fallback.endpoint,
        state.chat_fallback.api_key.as_deref(),
        &model,
        &system_prompt,
        &params.content,
        delta_tx,
    )
    .await;
    forward_handle.abort();

    match result {
        Ok(text) => {
            let (clean_text, actions) = memory_tags::process_memory_tags(&text);
            apply_memory_actions(state, &session_token, actions);
            let _ = reply.send(ServerFrame::ChatFinal(ChatFinal { request_id, content: clean_text }));
        },
        Err(relay_chat::Error::NoApiKey) => {
            let _ = reply.send(ServerFrame::Error(
                ErrorPayload::new(error_codes::NO_API_KEY, "no chat backend is configured").with_request_id(request_id),
            ));
        },
        Err(e) => {
            warn!(error = %e, "fallback chat completion failed");
            let _ = reply.send(ServerFrame::Error(
                ErrorPayload::new(error_codes::CHAT_ERROR, e.to_string()).with_request_id(request_id),
            ));
        },
    }
}

fn apply_memory_actions(state: &Arc<GatewayState>, session_token: &str, actions: Vec<memory_tags::MemoryAction>) {
    if actions.is_empty() {
        return;
    }
    let notes = state.vault.notes();
    for action in actions {
        let result = match action {
            memory_tags::MemoryAction::Remember { fact } => notes.update(session_token, |record| {
                let line = memory_tags::render_remember_line(&fact);
                record.body = if record.body.is_empty() { line } else { format!("{}\n{line}", record.body) };
            }),
            memory_tags::MemoryAction::Goal { goal, deadline } => notes.update(session_token, |record| {
                let line = memory_tags::render_goal_line(&goal, deadline.as_deref());
                record.body = if record.body.is_empty() { line } else { format!("{}\n{line}", record.body) };
            }),
            memory_tags::MemoryAction::Done { search_text } => notes.update(session_token, |record| {
                record.body = memory_tags::apply_done(&record.body, &search_text);
            }),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to apply memory action");
        }
    }
}

pub fn handle_abort(state: &Arc<GatewayState>, session_token: &str, params: ChatAbortParams) {
    if let Some(bridge) = &state.chat_bridge {
        let _ = bridge.abort(session_token.to_string(), params.request_id);
    }
}
