//! Relay gateway WebSocket/REST wire protocol.
//!
//! All communication uses JSON frames. Inbound frames carry a `type`
//! discriminator (`ClientFrame`); outbound frames use the same scheme
//! (`ServerFrame`). REST payloads reuse the same body types where practical.

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 18900;
pub const MAX_PAYLOAD_BYTES: usize = 1_048_576; // 1 MB
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const UPSTREAM_ARMING_MS: u64 = 30_000;
pub const COMMAND_REPLY_TIMEOUT_MS: u64 = 9_000;
pub const CONNECT_ATTEMPT_TIMEOUT_MS: u64 = 3_000;
pub const RELAY_RECONNECT_DELAY_MS: u64 = 5_000;
pub const CHAT_END_TO_END_TIMEOUT_MS: u64 = 600_000;
pub const LOCK_STALE_AGE_MS: u64 = 30_000;

// ── Error codes (closed set) ─────────────────────────────────────────────────

pub mod error_codes {
    pub const INVALID_JSON: &str = "INVALID_JSON";
    pub const NOT_AUTHENTICATED: &str = "NOT_AUTHENTICATED";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
    pub const JOB_SUBMIT_FAILED: &str = "JOB_SUBMIT_FAILED";
    pub const JOB_CANCEL_FAILED: &str = "JOB_CANCEL_FAILED";
    pub const NO_API_KEY: &str = "NO_API_KEY";
    pub const CHAT_ERROR: &str = "CHAT_ERROR";
    pub const CHAT_TIMEOUT: &str = "CHAT_TIMEOUT";
    pub const TRACE_STATUS_FAILED: &str = "TRACE_STATUS_FAILED";
    pub const TASK_CANCEL_FAILED: &str = "TASK_CANCEL_FAILED";
}

/// An `{type:"error", ...}` frame payload, optionally tagged with a `requestId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), request_id: None }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

// ── Inbound client frames ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "auth")]
    Auth(AuthParams),
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "job:submit")]
    JobSubmit(JobSubmitParams),
    #[serde(rename = "job:cancel")]
    JobCancel(JobCancelParams),
    #[serde(rename = "chat:send")]
    ChatSend(ChatSendParams),
    #[serde(rename = "chat:abort")]
    ChatAbort(ChatAbortParams),
    #[serde(rename = "system:status")]
    SystemStatus(SystemStatusParams),
    #[serde(rename = "system:subscribe")]
    SystemSubscribe(SystemSubscribeParams),
    #[serde(rename = "cmd:execute")]
    CmdExecute(CmdExecuteParams),
    #[serde(rename = "trace:status")]
    TraceStatus(TraceStatusParams),
    #[serde(rename = "trace:cancel-task")]
    TraceCancelTask(TraceCancelTaskParams),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthParams {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(rename = "clientId", default)]
    pub client_id: Option<String>,
    #[serde(rename = "clientType", default)]
    pub client_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSubmitParams {
    pub instruction: String,
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(rename = "jobType", default)]
    pub job_type: Option<String>,
    #[serde(rename = "securityProfile", default)]
    pub security_profile: Option<String>,
    #[serde(rename = "modelOverride", default)]
    pub model_override: Option<String>,
    #[serde(rename = "thinkingLevel", default)]
    pub thinking_level: Option<String>,
    #[serde(rename = "threadId", default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobCancelParams {
    #[serde(rename = "jobId")]
    pub job_id: String,
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSendParams {
    pub content: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "threadId", default)]
    pub thread_id: Option<String>,
    #[serde(rename = "modelOverride", default)]
    pub model_override: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatAbortParams {
    #[serde(rename = "requestId")]
    pub request_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemStatusParams {
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSubscribeParams {
    pub events: Vec<String>,
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CmdExecuteParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceStatusParams {
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraceCancelTaskParams {
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
}

// ── Outbound server frames ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "auth-ack")]
    AuthAck(AuthAck),
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
    #[serde(rename = "error")]
    Error(ErrorPayload),
    #[serde(rename = "system:status-response")]
    SystemStatusResponse(SystemStatusResponse),
    #[serde(rename = "system:event")]
    SystemEvent(SystemEvent),
    #[serde(rename = "job:submitted")]
    JobSubmitted(JobSubmitted),
    #[serde(rename = "job:status")]
    JobStatus(JobStatusFrame),
    #[serde(rename = "job:complete")]
    JobComplete(JobCompleteFrame),
    #[serde(rename = "chat:delta")]
    ChatDelta(ChatDelta),
    #[serde(rename = "chat:tool")]
    ChatTool(ChatTool),
    #[serde(rename = "chat:final")]
    ChatFinal(ChatFinal),
    #[serde(rename = "cmd:result")]
    CmdResult(CmdResult),
    #[serde(rename = "trace:status-response")]
    TraceStatusResponse(serde_json::Value),
    #[serde(rename = "trace:cancel-task-result")]
    TraceCancelTaskResult(TraceCancelTaskResult),
    #[serde(rename = "trace:progress")]
    TraceProgress(serde_json::Value),
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthAck {
    pub success: bool,
    #[serde(rename = "sessionToken", skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(rename = "serverVersion")]
    pub server_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatusResponse {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(rename = "pendingJobs")]
    pub pending_jobs: usize,
    #[serde(rename = "runningJobs")]
    pub running_jobs: usize,
    #[serde(rename = "agentOnline")]
    pub agent_online: bool,
    #[serde(rename = "connectedClients")]
    pub connected_clients: usize,
    #[serde(rename = "vaultPath")]
    pub vault_path: String,
    #[serde(rename = "uptimeSec")]
    pub uptime_sec: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSubmitted {
    #[serde(rename = "jobId")]
    pub job_id: String,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusFrame {
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobCompleteFrame {
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatDelta {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub index: u64,
    pub delta: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatTool {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub tool: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatFinal {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CmdResult {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceCancelTaskResult {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub success: bool,
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","code":"INTERNAL","message":"serialization failed"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_auth_parses() {
        let raw = r#"{"type":"auth","apiKey":"test-relay-key"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::Auth(p) => assert_eq!(p.api_key, "test-relay-key"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn client_frame_unknown_type_errors() {
        let raw = r#"{"type":"nope"}"#;
        assert!(serde_json::from_str::<ClientFrame>(raw).is_err());
    }

    #[test]
    fn server_frame_job_submitted_roundtrips_fields() {
        let frame = ServerFrame::JobSubmitted(JobSubmitted {
            job_id: "j1".into(),
            request_id: Some("ws-req-001".into()),
            status: "pending".into(),
        });
        let json = frame.to_json();
        assert!(json.contains("\"type\":\"job:submitted\""));
        assert!(json.contains("\"jobId\":\"j1\""));
        assert!(json.contains("\"requestId\":\"ws-req-001\""));
    }

    #[test]
    fn chat_send_requires_request_id() {
        let raw = r#"{"type":"chat:send","content":"hi"}"#;
        assert!(serde_json::from_str::<ClientFrame>(raw).is_err());
    }
}
