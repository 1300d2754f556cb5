//! Job lifecycle handling: submit/cancel over WebSocket, and
//! event-driven status forwarding to every session watching a job.

use std::sync::Arc;

use relay_protocol::{error_codes, ErrorPayload, JobCancelParams, JobCompleteFrame, JobSubmitParams, JobSubmitted, ServerFrame, TraceCancelTaskParams, TraceCancelTaskResult};
use relay_vault::{JobStatus, NewJob};
use tracing::warn;

use crate::state::GatewayState;

pub async fn handle_submit(state: &Arc<GatewayState>, session_token: &str, params: JobSubmitParams) -> ServerFrame {
    if let Some(request_id) = &params.request_id {
        if state.dedupe.check_and_insert(request_id) {
            return ServerFrame::Error(
                ErrorPayload::new(error_codes::JOB_SUBMIT_FAILED, "duplicate requestId").with_request_id(request_id),
            );
        }
    }

    let spec = NewJob {
        instruction: params.instruction,
        job_type: params.job_type.unwrap_or_else(|| "background".into()),
        priority: params.priority.unwrap_or(30),
        security_profile: params.security_profile,
        model_override: params.model_override,
        thinking_level: params.thinking_level,
        thread_id: params.thread_id,
    };

    match state.vault.create_job(spec) {
        Ok(job_id) => {
            state.watches.watch(&job_id, session_token);
            ServerFrame::JobSubmitted(JobSubmitted {
                job_id,
                request_id: params.request_id,
                status: JobStatus::Pending.as_str().to_string(),
            })
        },
        Err(e) => {
            warn!(error = %e, "job submit failed");
            let mut err = ErrorPayload::new(error_codes::JOB_SUBMIT_FAILED, e.to_string());
            if let Some(request_id) = params.request_id {
                err = err.with_request_id(request_id);
            }
            ServerFrame::Error(err)
        },
    }
}

/// Cancellation is best-effort: the job is marked `failed`, annotated
/// as cancelled by the client, since in-flight worker execution cannot
/// be preempted mid-step.
pub async fn handle_cancel(state: &Arc<GatewayState>, params: JobCancelParams) -> ServerFrame {
    let extras = serde_json::json!({ "cancelReason": "cancelled by client" });
    match state.vault.update_job_status(&params.job_id, JobStatus::Failed, Some(extras)) {
        Ok(()) => {
            state.watches.stop_watching_job(&params.job_id);
            ServerFrame::JobComplete(JobCompleteFrame { job_id: params.job_id, status: JobStatus::Failed.as_str().to_string(), result: None })
        },
        Err(e) => {
            let mut err = ErrorPayload::new(error_codes::JOB_CANCEL_FAILED, e.to_string());
            if let Some(request_id) = params.request_id {
                err = err.with_request_id(request_id);
            }
            ServerFrame::Error(err)
        },
    }
}

pub async fn handle_cancel_task(state: &Arc<GatewayState>, params: TraceCancelTaskParams) -> ServerFrame {
    use relay_vault::TaskStatus;
    let success = state
        .vault
        .update_task_status(&params.task_id, TaskStatus::Cancelled, None, Some("cancelled by client".into()))
        .is_ok();
    if !success {
        let mut err = ErrorPayload::new(error_codes::TASK_CANCEL_FAILED, "task not found or not cancellable");
        if let Some(request_id) = params.request_id {
            err = err.with_request_id(request_id);
        }
        return ServerFrame::Error(err);
    }
    ServerFrame::TraceCancelTaskResult(TraceCancelTaskResult { request_id: params.request_id, success: true })
}
