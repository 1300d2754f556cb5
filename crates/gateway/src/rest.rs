//! REST router: mirrors the WebSocket surface for non-streaming callers.
//! Every `/api/*` route requires `Authorization: Bearer <key-or-token>`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use relay_chat::{context, fallback, memory_tags};
use relay_vault::{JobStatus, NewJob};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::state::GatewayState;

pub fn router() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/jobs", post(submit_job).get(|| async { StatusCode::METHOD_NOT_ALLOWED }))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/chat", post(chat))
        .route("/api/notes/search", get(search_notes))
        .route("/api/threads", get(list_threads))
}

fn authorized(headers: &HeaderMap, state: &GatewayState) -> bool {
    headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()).is_some_and(|h| state.auth.validate_bearer(h))
}

async fn health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": state.server_version() }))
}

async fn status(headers: HeaderMap, State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    if !authorized(&headers, &state) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
    }
    let pending = state.vault.pending_job_count().unwrap_or(0);
    let body = json!({
        "pendingJobs": pending,
        "runningJobs": 0,
        "agentOnline": state.chat_bridge.as_ref().is_some_and(|b| b.is_connected()),
        "connectedClients": state.registry.size(),
        "vaultPath": state.vault.root().display().to_string(),
        "uptimeSec": state.uptime_secs(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

#[derive(Deserialize)]
struct SubmitJobBody {
    instruction: Option<String>,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(rename = "jobType", default)]
    job_type: Option<String>,
}

async fn submit_job(headers: HeaderMap, State(state): State<Arc<GatewayState>>, Json(body): Json<SubmitJobBody>) -> impl IntoResponse {
    if !authorized(&headers, &state) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
    }
    let Some(instruction) = body.instruction.filter(|s| !s.is_empty()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "instruction is required" }))).into_response();
    };

    let spec = NewJob { instruction, priority: body.priority.unwrap_or(30), job_type: body.job_type.unwrap_or_else(|| "background".into()), ..Default::default() };
    match state.vault.create_job(spec) {
        Ok(job_id) => (
            StatusCode::CREATED,
            Json(json!({ "jobId": job_id, "status": JobStatus::Pending.as_str(), "createdAt": relay_vault::now_ms() })),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn get_job(headers: HeaderMap, State(state): State<Arc<GatewayState>>, axum::extract::Path(id): axum::extract::Path<String>) -> impl IntoResponse {
    if !authorized(&headers, &state) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
    }
    match state.vault.get_job(&id) {
        Ok(Some(record)) => (StatusCode::OK, Json(json!({ "jobId": id, "header": record.header, "body": record.body }))).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "job not found" }))).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn cancel_job(headers: HeaderMap, State(state): State<Arc<GatewayState>>, axum::extract::Path(id): axum::extract::Path<String>) -> impl IntoResponse {
    if !authorized(&headers, &state) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
    }
    let extras = json!({ "cancelReason": "cancelled by client" });
    match state.vault.update_job_status(&id, JobStatus::Failed, Some(extras)) {
        Ok(()) => {
            state.watches.stop_watching_job(&id);
            (StatusCode::OK, Json(json!({ "jobId": id, "status": JobStatus::Failed.as_str() }))).into_response()
        },
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

#[derive(Deserialize)]
struct ChatBody {
    content: String,
    #[serde(rename = "modelOverride", default)]
    model_override: Option<String>,
}

#[derive(Serialize)]
struct ChatResponse {
    content: String,
}

async fn chat(headers: HeaderMap, State(state): State<Arc<GatewayState>>, Json(body): Json<ChatBody>) -> impl IntoResponse {
    if !authorized(&headers, &state) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
    }
    if state.chat_fallback.api_key.is_none() && state.chat_bridge.as_ref().is_none_or(|b| !b.is_connected()) {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "no chat backend configured" }))).into_response();
    }

    let model = body.model_override.unwrap_or_else(|| state.chat_fallback.model.clone());
    let inputs = context::ContextInputs { client_type: "rest", current_time: &chrono::Utc::now().to_rfc3339(), ..Default::default() };
    let system_prompt = context::build_system_prompt(&inputs);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move { while rx.recv().await.is_some() {} });

    match fallback::stream_chat_completion(&state.http_client, &state.chat_fallback.endpoint, state.chat_fallback.api_key.as_deref(), &model, &system_prompt, &body.content, tx).await {
        Ok(text) => {
            let (clean, _actions) = memory_tags::process_memory_tags(&text);
            (StatusCode::OK, Json(ChatResponse { content: clean })).into_response()
        },
        Err(relay_chat::Error::NoApiKey) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "no chat backend configured" }))).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    limit: Option<usize>,
}

async fn search_notes(headers: HeaderMap, State(state): State<Arc<GatewayState>>, Query(query): Query<SearchQuery>) -> impl IntoResponse {
    if !authorized(&headers, &state) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
    }
    match state.vault.notes().search(&query.q) {
        Ok(hits) => {
            let limit = query.limit.unwrap_or(5);
            let rendered: Vec<_> = hits.into_iter().take(limit).map(|(id, record)| json!({ "id": id, "snippet": record.body })).collect();
            (StatusCode::OK, Json(json!({ "hits": rendered }))).into_response()
        },
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn list_threads(headers: HeaderMap, State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    if !authorized(&headers, &state) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
    }
    match state.vault.threads().list_recent(10) {
        Ok(items) => {
            let ids: Vec<String> = items.into_iter().map(|(id, _)| id).collect();
            (StatusCode::OK, Json(json!({ "threads": ids }))).into_response()
        },
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}
