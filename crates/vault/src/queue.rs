//! File-backed priority queue and staged-dependency queue.
//!
//! A queue is three sibling directories: `pending/`, `processing/`,
//! `done/`. Each record is one `<id>.md` file. Atomic dequeue moves a
//! file from `pending/` to `processing/` via hard-link-then-unlink:
//! `fs::hard_link` fails if the destination already exists, which gives
//! the mutual exclusion that `rename` (overwrite-on-collision on POSIX)
//! cannot. Whoever wins the link wins the claim; the loser's link
//! attempt errors and it moves to the next candidate.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::record::{depends_on, priority_bucket, Record};

/// A record read from `pending/`, carrying enough to perform the
/// matching atomic claim later.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub record: Record,
    pub pending_path: PathBuf,
}

pub struct Queue {
    pub root: PathBuf,
}

impl Queue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    pub fn processing_dir(&self) -> PathBuf {
        self.root.join("processing")
    }

    pub fn done_dir(&self) -> PathBuf {
        self.root.join("done")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.pending_dir(), self.processing_dir(), self.done_dir()] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn enqueue(&self, id: &str, record: &Record) -> Result<()> {
        self.ensure_dirs()?;
        let path = self.pending_dir().join(format!("{id}.md"));
        fs::write(path, record.to_text())?;
        Ok(())
    }

    /// List pending records ordered by strict priority descending, then
    /// FIFO (creation order) within a bucket.
    pub fn list_pending(&self) -> Result<Vec<PendingEntry>> {
        self.ensure_dirs()?;
        let mut entries = Vec::new();
        for dirent in fs::read_dir(self.pending_dir())? {
            let dirent = dirent?;
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let text = match fs::read_to_string(&path) {
                Ok(t) => t,
                Err(_) => continue,
            };
            let record = match Record::parse(&text) {
                Ok(r) => r,
                Err(_) => continue, // corrupt record: skip, scan continues
            };
            entries.push(PendingEntry { id: id.to_string(), record, pending_path: path });
        }

        entries.sort_by(|a, b| {
            let pa = a.record.get("priority").and_then(|p| p.parse::<u8>().ok()).unwrap_or(0);
            let pb = b.record.get("priority").and_then(|p| p.parse::<u8>().ok()).unwrap_or(0);
            let ba = priority_bucket(pa);
            let bb = priority_bucket(pb);
            let created_a = a.record.get("createdAt").and_then(|c| c.parse::<u64>().ok()).unwrap_or(0);
            let created_b = b.record.get("createdAt").and_then(|c| c.parse::<u64>().ok()).unwrap_or(0);
            bb.cmp(&ba).then(created_a.cmp(&created_b))
        });

        Ok(entries)
    }

    /// Dequeue the highest-priority record matching `filter`, moving it
    /// from `pending/` to `processing/` atomically. Returns `None` if no
    /// candidate matches or every match is lost to a concurrent claimant.
    pub fn dequeue_matching(&self, filter: impl Fn(&Record) -> bool) -> Result<Option<PendingEntry>> {
        for mut entry in self.list_pending()? {
            if !filter(&entry.record) {
                continue;
            }
            let dest = self.processing_dir().join(format!("{}.md", entry.id));
            if atomic_claim(&entry.pending_path, &dest).is_ok() {
                entry.pending_path = dest;
                return Ok(Some(entry));
            }
            // Lost the race for this record; try the next candidate.
        }
        Ok(None)
    }

    pub fn dequeue(&self) -> Result<Option<PendingEntry>> {
        self.dequeue_matching(|_| true)
    }

    pub fn read_processing(&self, id: &str) -> Result<Option<Record>> {
        let path = self.processing_dir().join(format!("{id}.md"));
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Record::parse(&fs::read_to_string(path)?)?))
    }

    pub fn write_processing(&self, id: &str, record: &Record) -> Result<()> {
        let path = self.processing_dir().join(format!("{id}.md"));
        fs::write(path, record.to_text())?;
        Ok(())
    }

    /// Move a record from `processing/` to `done/`, preserving status
    /// inside the record body as the terminal ack.
    pub fn ack_terminal(&self, id: &str, record: &Record) -> Result<()> {
        let processing = self.processing_dir().join(format!("{id}.md"));
        let done = self.done_dir().join(format!("{id}.md"));
        fs::write(&processing, record.to_text())?;
        fs::rename(&processing, &done)?;
        Ok(())
    }

    pub fn read_done(&self, id: &str) -> Result<Option<Record>> {
        let path = self.done_dir().join(format!("{id}.md"));
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Record::parse(&fs::read_to_string(path)?)?))
    }

    /// True if the claimant still owns the dequeued processing-location
    /// path for this id (i.e. it has not already been acked away).
    pub fn owns_processing(&self, id: &str) -> bool {
        self.processing_dir().join(format!("{id}.md")).exists()
    }
}

/// Hard-link then unlink: fails with an error if `dst` already exists,
/// giving exclusive ownership to exactly one caller among racers.
pub fn atomic_claim(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::hard_link(src, dst)?;
    fs::remove_file(src)?;
    Ok(())
}

/// The staged queue holds delegated tasks whose `dependsOn` is not yet
/// satisfied. Promotion moves a task file into the main queue's
/// `pending/` directory via the same hard-link-then-unlink primitive,
/// so a duplicate promotion attempt is a harmless no-op.
pub struct StagedQueue {
    pub root: PathBuf,
}

impl StagedQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn stage(&self, id: &str, record: &Record) -> Result<()> {
        self.ensure_dir()?;
        let path = self.root.join(format!("{id}.md"));
        fs::write(path, record.to_text())?;
        Ok(())
    }

    /// Move every staged task whose dependencies are all done-committed
    /// into `main.pending()`. A task already promoted by a concurrent
    /// call simply fails the link (its file is already gone) and is
    /// skipped, keeping promotion idempotent under races.
    pub fn promote_ready(&self, main: &Queue, is_satisfied: impl Fn(&str) -> bool) -> Result<Vec<String>> {
        self.ensure_dir()?;
        main.ensure_dirs()?;
        let mut promoted = Vec::new();
        for dirent in fs::read_dir(&self.root)? {
            let dirent = dirent?;
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else { continue };
            let text = match fs::read_to_string(&path) {
                Ok(t) => t,
                Err(_) => continue,
            };
            let record = match Record::parse(&text) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let deps = depends_on(&record);
            if !deps.iter().all(|d| is_satisfied(d)) {
                continue;
            }
            let dest = main.pending_dir().join(format!("{id}.md"));
            if atomic_claim(&path, &dest).is_ok() {
                promoted.push(id);
            }
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{new_job_record, NewJob};

    fn job(priority: u8, created_at: u64) -> Record {
        let mut r = new_job_record("j", &NewJob { priority, instruction: "x".into(), ..Default::default() });
        r.set("createdAt", created_at.to_string());
        r
    }

    #[test]
    fn dequeue_orders_by_priority_then_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let q = Queue::new(dir.path());
        q.enqueue("low", &job(10, 1)).unwrap();
        q.enqueue("critical", &job(95, 2)).unwrap();
        q.enqueue("medium", &job(50, 3)).unwrap();

        let first = q.dequeue().unwrap().unwrap();
        assert_eq!(first.id, "critical");
        let second = q.dequeue().unwrap().unwrap();
        assert_eq!(second.id, "medium");
        let third = q.dequeue().unwrap().unwrap();
        assert_eq!(third.id, "low");
        assert!(q.dequeue().unwrap().is_none());
    }

    #[test]
    fn dequeue_is_exclusive_under_concurrent_claim() {
        let dir = tempfile::tempdir().unwrap();
        let q = Queue::new(dir.path());
        q.enqueue("a", &job(50, 1)).unwrap();

        let first = q.dequeue().unwrap();
        assert!(first.is_some());
        // already moved to processing/, so a second dequeue sees nothing pending
        let second = q.dequeue().unwrap();
        assert!(second.is_none());
        assert!(q.owns_processing("a"));
    }

    #[test]
    fn ack_terminal_moves_to_done_preserving_status() {
        let dir = tempfile::tempdir().unwrap();
        let q = Queue::new(dir.path());
        q.enqueue("a", &job(50, 1)).unwrap();
        let entry = q.dequeue().unwrap().unwrap();
        let mut record = entry.record;
        record.set("status", "done");
        q.ack_terminal("a", &record).unwrap();

        assert!(!q.owns_processing("a"));
        let done = q.read_done("a").unwrap().unwrap();
        assert_eq!(done.get("status"), Some("done"));
    }

    #[test]
    fn promotion_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let main = Queue::new(dir.path().join("main"));
        let staged = StagedQueue::new(dir.path().join("staged"));

        let mut task = job(50, 1);
        task.set("dependsOn", "d1");
        staged.stage("t1", &task).unwrap();

        let promoted = staged.promote_ready(&main, |id| id == "d1").unwrap();
        assert_eq!(promoted, vec!["t1".to_string()]);
        assert!(main.pending_dir().join("t1.md").exists());

        // Second call: nothing left staged, so it's a harmless no-op.
        let promoted_again = staged.promote_ready(&main, |id| id == "d1").unwrap();
        assert!(promoted_again.is_empty());
    }

    #[test]
    fn unmet_dependency_keeps_task_staged() {
        let dir = tempfile::tempdir().unwrap();
        let main = Queue::new(dir.path().join("main"));
        let staged = StagedQueue::new(dir.path().join("staged"));

        let mut task = job(50, 1);
        task.set("dependsOn", "d1,d2");
        staged.stage("t1", &task).unwrap();

        let promoted = staged.promote_ready(&main, |id| id == "d1").unwrap();
        assert!(promoted.is_empty());
        assert!(dir.path().join("staged").join("t1.md").exists());
    }
}
