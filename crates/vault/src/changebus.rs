//! Filesystem-watch-derived change bus.
//!
//! Grounded on `skills::watcher::SkillWatcher`: a `notify-debouncer-full`
//! debouncer translates raw create/modify/delete events into typed
//! events, which here are fanned out via `tokio::sync::broadcast` so the
//! Job Handler, Event Forwarder, and any other in-process consumer each
//! get their own ordered `Receiver`.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify_debouncer_full::notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::Result;

const DEBOUNCE_MS: u64 = 100;
const CHANNEL_CAPACITY: usize = 1024;

/// A single high-level vault change, derived from one or more raw
/// filesystem events observed within a debounce window.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: String,
    pub path: PathBuf,
    pub data: Option<Value>,
    pub timestamp: u64,
}

/// Owns the debouncer and the broadcast sender. Must stay alive for
/// watching to continue; drop it to stop.
pub struct ChangeBus {
    _debouncer: Debouncer<notify_debouncer_full::notify::RecommendedWatcher, RecommendedCache>,
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn start(root: &Path) -> Result<Self> {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        let tx_events = tx.clone();

        let debouncer = new_debouncer(
            Duration::from_millis(DEBOUNCE_MS),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        for path in &event.paths {
                            if let Some(change) = classify(path, &event.kind) {
                                debug!(kind = %change.kind, path = %change.path.display(), "vault change");
                                let _ = tx_events.send(change);
                            }
                        }
                    }
                },
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "vault watcher error");
                    }
                },
            },
        )
        .map_err(|e| crate::error::Error::message(format!("failed to start watcher: {e}")))?;

        let mut bus = Self { _debouncer: debouncer, tx };
        bus._debouncer
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| crate::error::Error::message(format!("failed to watch vault root: {e}")))?;
        Ok(bus)
    }

    /// Subscribe a new independent consumer. Each subscriber observes
    /// every event in arrival order; none can make another miss events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

fn classify(path: &Path, kind: &EventKind) -> Option<ChangeEvent> {
    let verb = match kind {
        EventKind::Create(_) => "created",
        EventKind::Modify(_) => "modified",
        EventKind::Remove(_) => "deleted",
        _ => return None,
    };

    let components: Vec<&str> = path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();

    let id = path.file_stem().and_then(|s| s.to_str()).map(str::to_string);

    let noun = if components.iter().any(|c| *c == "jobs") {
        "job"
    } else if components.iter().any(|c| *c == "delegation" || *c == "staged") {
        "task"
    } else if components.iter().any(|c| *c == "_notes") {
        "note"
    } else if components.iter().any(|c| *c == "_approvals") {
        "approval"
    } else if components.iter().any(|c| *c == "_system") {
        "system"
    } else {
        return None;
    };

    let event_kind = match (noun, verb, components.last().copied()) {
        ("job", "created", Some("pending")) => "job:created".to_string(),
        ("job", "modified", Some("processing")) => "job:claimed".to_string(),
        ("job", _, Some("done")) => "job:completed".to_string(),
        ("task", "created", _) => "task:created".to_string(),
        ("task", "modified", Some("processing")) => "task:claimed".to_string(),
        ("task", _, Some("done")) => "task:completed".to_string(),
        ("system", _, _) => "system:modified".to_string(),
        (noun, verb, _) => format!("{noun}:{verb}"),
    };

    let data = id.map(|id| serde_json::json!({ "id": id }));

    Some(ChangeEvent {
        kind: event_kind,
        path: path.to_path_buf(),
        data,
        timestamp: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn observes_job_creation() {
        let dir = tempfile::tempdir().unwrap();
        let jobs_pending = dir.path().join("_fbmq/jobs/pending");
        fs::create_dir_all(&jobs_pending).unwrap();

        let bus = ChangeBus::start(dir.path()).unwrap();
        let mut rx = bus.subscribe();

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        fs::write(jobs_pending.join("j1.md"), "jobId: j1\n\nhello").unwrap();

        let event = tokio::time::timeout(StdDuration::from_secs(2), rx.recv()).await;
        assert!(event.is_ok(), "expected a change event within timeout");
        let event = event.unwrap().unwrap();
        assert_eq!(event.kind, "job:created");
    }

    #[tokio::test]
    async fn multiple_subscribers_each_observe_event() {
        let dir = tempfile::tempdir().unwrap();
        let jobs_pending = dir.path().join("_fbmq/jobs/pending");
        fs::create_dir_all(&jobs_pending).unwrap();

        let bus = ChangeBus::start(dir.path()).unwrap();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        fs::write(jobs_pending.join("j2.md"), "jobId: j2\n\nhello").unwrap();

        let e1 = tokio::time::timeout(StdDuration::from_secs(2), rx1.recv()).await.unwrap().unwrap();
        let e2 = tokio::time::timeout(StdDuration::from_secs(2), rx2.recv()).await.unwrap().unwrap();
        assert_eq!(e1.kind, e2.kind);
    }
}
