//! Record header/body parsing for vault text files.
//!
//! A record is a UTF-8 text file: a header block of `key: value` lines,
//! a single blank line, then a free-form body. Reserved header keys are
//! a closed set; unrecognized keys round-trip unchanged.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A parsed record: header key/value pairs plus the body text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub header: BTreeMap<String, String>,
    pub body: String,
}

impl Record {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.header.insert(key.into(), value.into());
    }

    pub fn version(&self) -> u64 {
        self.get("version").and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// Bump `version`, defaulting a missing version to 1 on first write.
    pub fn bump_version(&mut self) {
        let next = self.version() + 1;
        self.set("version", next.to_string());
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.header {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut header = BTreeMap::new();
        let mut lines = text.lines();
        let mut body_start = 0usize;
        let mut consumed = 0usize;
        for line in lines.by_ref() {
            consumed += line.len() + 1;
            if line.trim().is_empty() {
                body_start = consumed;
                break;
            }
            let Some((k, v)) = line.split_once(':') else {
                return Err(Error::message(format!("malformed header line: {line}")));
            };
            header.insert(k.trim().to_string(), v.trim().to_string());
        }
        let body = text.get(body_start..).unwrap_or("").to_string();
        Ok(Self { header, body })
    }
}

// ── Typed views over records ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    WaitingForUser,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingForUser => "waiting_for_user",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "waiting_for_user" => Self::WaitingForUser,
            "done" => Self::Done,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Delegated-task status. Distinct from `JobStatus`: a task's
/// terminal-success state is `completed`, not `done`, since it is this
/// status a staged dependency waits on before promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Priority bucket used for dequeue ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityBucket {
    Low,
    Normal,
    High,
    Critical,
}

pub fn priority_bucket(priority: u8) -> PriorityBucket {
    if priority >= 90 {
        PriorityBucket::Critical
    } else if priority >= 70 {
        PriorityBucket::High
    } else if priority >= 30 {
        PriorityBucket::Normal
    } else {
        PriorityBucket::Low
    }
}

/// Specification for a new job, as accepted by `VaultFacade::create_job`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub instruction: String,
    pub job_type: String,
    pub priority: u8,
    pub security_profile: Option<String>,
    pub model_override: Option<String>,
    pub thinking_level: Option<String>,
    pub thread_id: Option<String>,
}

impl Default for NewJob {
    fn default() -> Self {
        Self {
            instruction: String::new(),
            job_type: "background".into(),
            priority: 30,
            security_profile: None,
            model_override: None,
            thinking_level: None,
            thread_id: None,
        }
    }
}

pub fn new_job_record(id: &str, spec: &NewJob) -> Record {
    let now = now_ms();
    let mut header = BTreeMap::new();
    header.insert("jobId".into(), id.into());
    header.insert("type".into(), spec.job_type.clone());
    header.insert("status".into(), JobStatus::Pending.as_str().into());
    header.insert("priority".into(), spec.priority.to_string());
    header.insert("createdAt".into(), now.to_string());
    header.insert("version".into(), "1".into());
    if let Some(p) = &spec.security_profile {
        header.insert("securityProfile".into(), p.clone());
    }
    if let Some(m) = &spec.model_override {
        header.insert("modelOverride".into(), m.clone());
    }
    if let Some(t) = &spec.thinking_level {
        header.insert("thinkingLevel".into(), t.clone());
    }
    if let Some(t) = &spec.thread_id {
        header.insert("threadId".into(), t.clone());
    }
    Record { header, body: spec.instruction.clone() }
}

/// Specification for a new delegated task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub job_id: String,
    pub instruction: String,
    pub target_harness_type: String,
    pub depends_on: Vec<String>,
    pub deadline_ms: Option<u64>,
    pub priority: u8,
}

pub fn new_task_record(id: &str, spec: &NewTask) -> Record {
    let now = now_ms();
    let mut header = BTreeMap::new();
    header.insert("taskId".into(), id.into());
    header.insert("jobId".into(), spec.job_id.clone());
    header.insert("status".into(), JobStatus::Pending.as_str().into());
    header.insert("priority".into(), spec.priority.to_string());
    header.insert("targetHarnessType".into(), spec.target_harness_type.clone());
    header.insert("createdAt".into(), now.to_string());
    header.insert("version".into(), "1".into());
    if !spec.depends_on.is_empty() {
        header.insert("dependsOn".into(), spec.depends_on.join(","));
    }
    if let Some(d) = spec.deadline_ms {
        header.insert("deadlineMs".into(), d.to_string());
    }
    Record { header, body: spec.instruction.clone() }
}

pub fn depends_on(record: &Record) -> Vec<String> {
    record
        .get("dependsOn")
        .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
        .unwrap_or_default()
}

pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_body_round_trip() {
        let mut r = Record::default();
        r.set("jobId", "j1");
        r.set("status", "pending");
        r.body = "do the thing".into();
        let text = r.to_text();
        let parsed = Record::parse(&text).unwrap();
        assert_eq!(parsed.get("jobId"), Some("j1"));
        assert_eq!(parsed.body, "do the thing");
    }

    #[test]
    fn version_bumps_from_missing_to_one() {
        let mut r = Record::default();
        assert_eq!(r.version(), 0);
        r.bump_version();
        assert_eq!(r.version(), 1);
        r.bump_version();
        assert_eq!(r.version(), 2);
    }

    #[test]
    fn priority_buckets_match_spec_thresholds() {
        assert_eq!(priority_bucket(95), PriorityBucket::Critical);
        assert_eq!(priority_bucket(90), PriorityBucket::Critical);
        assert_eq!(priority_bucket(89), PriorityBucket::High);
        assert_eq!(priority_bucket(70), PriorityBucket::High);
        assert_eq!(priority_bucket(69), PriorityBucket::Normal);
        assert_eq!(priority_bucket(30), PriorityBucket::Normal);
        assert_eq!(priority_bucket(29), PriorityBucket::Low);
        assert_eq!(priority_bucket(0), PriorityBucket::Low);
    }

    #[test]
    fn depends_on_parses_comma_list() {
        let mut r = Record::default();
        r.set("dependsOn", "a, b ,c");
        assert_eq!(depends_on(&r), vec!["a", "b", "c"]);
    }
}
