//! Per-path exclusive locking with bounded staleness.
//!
//! Grounded on `sessions::store::SessionStore::append`'s use of
//! `fd_lock::RwLock` around a blocking write. As there, the lock is held
//! only for the duration of the guarded operation rather than handed
//! back to the caller as a long-lived guard. A lock file lives next to
//! the path it protects (`<path>.lock`); a lock whose recorded
//! acquisition time is older than `relay_protocol::LOCK_STALE_AGE_MS` is
//! treated as abandoned, since a crashed claimant can never release it.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fd_lock::RwLock;
use relay_protocol::LOCK_STALE_AGE_MS;

use crate::error::{Error, Result};

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    target.with_file_name(name)
}

fn now_millis() -> u128 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_millis()
}

fn is_stale(path: &Path) -> bool {
    let Ok(content) = fs::read_to_string(path) else { return false };
    let Ok(acquired_at) = content.trim().parse::<u128>() else { return false };
    now_millis().saturating_sub(acquired_at) > LOCK_STALE_AGE_MS as u128
}

/// Run `f` while holding an exclusive lock on `target`. The lock is
/// released (and its lock file removed) before this function returns.
///
/// Blocking; callers from async contexts should wrap this in
/// `tokio::task::spawn_blocking`.
pub fn with_lock<T>(target: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let path = lock_path(target);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    if is_stale(&path) {
        let _ = fs::remove_file(&path);
    }

    let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
    let mut rw = RwLock::new(file);
    let mut guard = rw
        .try_write()
        .map_err(|_| Error::LockHeld(target.display().to_string()))?;
    guard.set_len(0)?;
    guard.seek(SeekFrom::Start(0))?;
    write!(guard, "{}", now_millis())?;
    guard.flush()?;

    let result = f();

    drop(guard);
    let _ = fs::remove_file(&path);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_closure_and_releases_afterward() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("job.md");
        fs::write(&target, "x").unwrap();

        let ran = with_lock(&target, || Ok(42)).unwrap();
        assert_eq!(ran, 42);

        // Lock file should be gone, so a second acquisition succeeds immediately.
        let ran2 = with_lock(&target, || Ok(7)).unwrap();
        assert_eq!(ran2, 7);
    }

    #[test]
    fn stale_lock_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("job.md");
        fs::write(&target, "x").unwrap();
        let stale_path = lock_path(&target);
        let ancient = now_millis().saturating_sub(LOCK_STALE_AGE_MS as u128 + 5_000);
        fs::write(&stale_path, ancient.to_string()).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        with_lock(&target, || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
