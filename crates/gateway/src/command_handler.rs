//! Bang-command vocabulary: a closed set of session commands operating
//! on a per-session settings map, backed by the vault.

use std::sync::Arc;

use relay_protocol::{CmdExecuteParams, CmdResult, ServerFrame, COMMAND_REPLY_TIMEOUT_MS};
use relay_vault::{JobStatus, NewTaskSpec, TaskStatus};

use crate::state::GatewayState;

const HELP_TEXT: &str = "\
Commands: reset/new, session, model [name], thread [id], status/hq/hq-status, \
memory, threads, search {query}, delegate {task,targetHarness?}, \
task-result {taskId}, job-result {jobId}, help/commands.";

pub async fn handle_execute(state: &Arc<GatewayState>, session_token: &str, params: CmdExecuteParams) -> ServerFrame {
    let request_id = params.request_id.clone();
    let outcome = tokio::time::timeout(
        std::time::Duration::from_millis(COMMAND_REPLY_TIMEOUT_MS),
        execute(state, session_token, &params.command, &params.args),
    )
    .await;

    let (success, output) = match outcome {
        Ok(result) => result,
        Err(_) => (false, "command timed out".to_string()),
    };

    ServerFrame::CmdResult(CmdResult { request_id, success, output })
}

async fn execute(state: &Arc<GatewayState>, session_token: &str, command: &str, args: &[String]) -> (bool, String) {
    match command {
        "reset" | "new" => {
            state.command_settings.lock().unwrap().remove(session_token);
            (true, "session settings cleared".into())
        },
        "session" => {
            let store = state.command_settings.lock().unwrap();
            let settings = store.get(session_token).cloned().unwrap_or_default();
            (true, format!("{settings:?}"))
        },
        "model" => {
            if let Some(name) = args.first() {
                set_setting(state, session_token, "model", name);
                (true, format!("model set to {name}"))
            } else {
                let model = get_setting(state, session_token, "model").unwrap_or_else(|| state.chat_fallback.model.clone());
                (true, format!("active model: {model}"))
            }
        },
        "thread" => {
            if let Some(id) = args.first() {
                set_setting(state, session_token, "threadId", id);
                (true, format!("thread set to {id}"))
            } else {
                let id = relay_vault::new_id("thread");
                set_setting(state, session_token, "threadId", &id);
                (true, format!("new thread: {id}"))
            }
        },
        "status" | "hq" | "hq-status" => match vault_status(state) {
            Ok(summary) => (true, summary),
            Err(e) => (false, e.to_string()),
        },
        "memory" => match state.vault.notes().read(session_token) {
            Ok(Some(record)) => (true, truncate(&record.body, 1536)),
            Ok(None) => (true, String::new()),
            Err(e) => (false, e.to_string()),
        },
        "threads" => match state.vault.threads().list_recent(10) {
            Ok(items) => (true, items.into_iter().map(|(id, _)| id).collect::<Vec<_>>().join("\n")),
            Err(e) => (false, e.to_string()),
        },
        "search" => {
            let query = args.join(" ");
            if query.is_empty() {
                return (false, "search requires a query".into());
            }
            match state.vault.notes().search(&query) {
                Ok(hits) => {
                    let rendered = hits
                        .into_iter()
                        .take(5)
                        .map(|(id, record)| format!("{id}: {}", truncate(&record.body, 160)))
                        .collect::<Vec<_>>()
                        .join("\n");
                    (true, rendered)
                },
                Err(e) => (false, e.to_string()),
            }
        },
        "delegate" => {
            if args.is_empty() {
                return (false, "delegate requires a task description".into());
            }
            let target_harness_type = args.get(1).cloned().unwrap_or_else(|| "any".into());
            let job_id = get_setting(state, session_token, "jobId").unwrap_or_else(|| "adhoc".into());
            let spec = NewTaskSpec { instruction: args[0].clone(), target_harness_type, depends_on: vec![], deadline_ms: None, priority: 50 };
            match state.vault.create_delegated_tasks(&job_id, vec![spec]) {
                Ok(ids) => (true, ids.into_iter().next().unwrap_or_default()),
                Err(e) => (false, e.to_string()),
            }
        },
        "task-result" => {
            let Some(task_id) = args.first() else { return (false, "task-result requires a taskId".into()) };
            match state.vault.get_task(task_id) {
                Ok(Some(record)) if record.get("status") == Some(TaskStatus::Completed.as_str()) => (true, record.body),
                Ok(_) => (true, "__pending__".into()),
                Err(e) => (false, e.to_string()),
            }
        },
        "job-result" => {
            let Some(job_id) = args.first() else { return (false, "job-result requires a jobId".into()) };
            match state.vault.get_job(job_id) {
                Ok(Some(record)) if record.get("status") == Some(JobStatus::Done.as_str()) => (true, record.body),
                Ok(_) => (true, "__pending__".into()),
                Err(e) => (false, e.to_string()),
            }
        },
        "help" | "commands" => (true, HELP_TEXT.to_string()),
        other => (false, format!("unknown command: {other}")),
    }
}

fn vault_status(state: &Arc<GatewayState>) -> relay_vault::Result<String> {
    Ok(format!("pendingJobs={} connectedClients={}", state.vault.pending_job_count()?, state.registry.size()))
}

fn get_setting(state: &Arc<GatewayState>, session_token: &str, key: &str) -> Option<String> {
    state.command_settings.lock().unwrap().get(session_token).and_then(|m| m.get(key).cloned())
}

fn set_setting(state: &Arc<GatewayState>, session_token: &str, key: &str, value: &str) {
    state.command_settings.lock().unwrap().entry(session_token.to_string()).or_default().insert(key.to_string(), value.to_string());
}

fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        s.to_string()
    } else {
        let mut cut = max_bytes;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &s[..cut])
    }
}
