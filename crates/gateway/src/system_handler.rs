//! System status reporting and event subscription management.

use std::sync::Arc;

use relay_protocol::{
    error_codes, ErrorPayload, ServerFrame, SystemStatusParams, SystemStatusResponse, SystemSubscribeParams,
    TraceStatusParams,
};

use crate::state::GatewayState;

pub fn handle_status(state: &Arc<GatewayState>, params: SystemStatusParams) -> ServerFrame {
    match snapshot(state) {
        Ok(mut response) => {
            response.request_id = params.request_id;
            ServerFrame::SystemStatusResponse(response)
        },
        Err(e) => {
            let mut err = ErrorPayload::new(error_codes::TRACE_STATUS_FAILED, e.to_string());
            if let Some(request_id) = params.request_id {
                err = err.with_request_id(request_id);
            }
            ServerFrame::Error(err)
        },
    }
}

fn snapshot(state: &Arc<GatewayState>) -> relay_vault::Result<SystemStatusResponse> {
    Ok(SystemStatusResponse {
        request_id: None,
        pending_jobs: state.vault.pending_job_count()?,
        running_jobs: 0,
        agent_online: state.chat_bridge.as_ref().is_some_and(|b| b.is_connected()),
        connected_clients: state.registry.size(),
        vault_path: state.vault.root().display().to_string(),
        uptime_sec: state.uptime_secs(),
    })
}

pub fn handle_subscribe(state: &Arc<GatewayState>, session_token: &str, params: SystemSubscribeParams) -> ServerFrame {
    state.registry.add_subscriptions(session_token, params.events.clone());
    ServerFrame::SystemEvent(relay_protocol::SystemEvent {
        event: "system:subscribed".into(),
        payload: Some(serde_json::json!({ "events": params.events, "requestId": params.request_id })),
    })
}

pub fn handle_trace_status(state: &Arc<GatewayState>, params: TraceStatusParams) -> ServerFrame {
    match snapshot(state) {
        Ok(response) => ServerFrame::TraceStatusResponse(serde_json::json!({
            "requestId": params.request_id,
            "pendingJobs": response.pending_jobs,
            "agentOnline": response.agent_online,
            "liveTasks": state.vault.list_live_tasks().unwrap_or_default(),
        })),
        Err(e) => {
            let mut err = ErrorPayload::new(error_codes::TRACE_STATUS_FAILED, e.to_string());
            if let Some(request_id) = params.request_id {
                err = err.with_request_id(request_id);
            }
            ServerFrame::Error(err)
        },
    }
}
