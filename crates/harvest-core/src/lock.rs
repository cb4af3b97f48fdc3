//! Run-level mutual exclusion keyed by target branch.
//!
//! A lock is a file under `.harvest/locks/` created with exclusive-create
//! semantics (the filesystem analogue of `SET NX`). Its content is
//! `<owner>:<unix-seconds>`. Only the owner removes it; a lock older than the
//! configured TTL is treated as abandoned by a crashed run and broken.
//!
//! Breaking happens under a second exclusive-create file (`<lock>.break`),
//! and the holder is re-read while that guard is held. Two waiters that both
//! saw the same stale holder cannot both remove it: the second one finds
//! either no lock or the first one's fresh lock.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{HarvestError, Result};
use crate::paths;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A break guard older than this was left by a process that died mid-break.
const BREAK_GUARD_TTL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    owner: String,
    released: bool,
}

impl RunLock {
    /// Acquire the lock for `branch`, polling until `wait` elapses.
    pub async fn acquire(
        root: &Path,
        branch: &str,
        owner: &str,
        wait: Duration,
        stale_after: Duration,
    ) -> Result<Self> {
        let path = paths::lock_path(root, branch);
        crate::io::ensure_dir(&paths::locks_dir(root))?;

        let deadline = tokio::time::Instant::now() + wait;
        let mut announced = false;
        loop {
            if try_acquire(&path, owner, stale_after)? {
                debug!(lock = %path.display(), %owner, "lock acquired");
                return Ok(Self {
                    path,
                    owner: owner.to_string(),
                    released: false,
                });
            }
            if !announced {
                info!(%branch, holder = ?read_holder(&path), "waiting for concurrent run to finish");
                announced = true;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HarvestError::LockTimeout {
                    key: branch.to_string(),
                    waited_secs: wait.as_secs(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file if this run still owns it.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release_owned(&self.path, &self.owner)
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = release_owned(&self.path, &self.owner) {
                warn!(error = %e, lock = %self.path.display(), "failed to release run lock");
            }
        }
    }
}

/// One exclusive-create attempt. Breaks a stale lock and retries once.
pub fn try_acquire(path: &Path, owner: &str, stale_after: Duration) -> Result<bool> {
    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut f) => {
                write!(f, "{owner}:{}", Utc::now().timestamp())?;
                return Ok(true);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !is_stale(path, stale_after) || !break_stale(path, stale_after)? {
                    return Ok(false);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(false)
}

/// Remove the lock at `path` if it is still stale, holding the break guard
/// while checking. Returns whether the lock was removed.
fn break_stale(path: &Path, stale_after: Duration) -> Result<bool> {
    let guard = guard_path(path);
    match OpenOptions::new().write(true).create_new(true).open(&guard) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            if age(&guard).is_some_and(|a| a >= BREAK_GUARD_TTL) {
                warn!(guard = %guard.display(), "removing abandoned lock break guard");
                remove_if_exists(&guard)?;
            }
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }

    let broken = if is_stale(path, stale_after) {
        warn!(lock = %path.display(), holder = ?read_holder(path), "breaking stale run lock");
        remove_if_exists(path).map(|()| true)
    } else {
        Ok(false)
    };
    remove_if_exists(&guard)?;
    broken
}

fn guard_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".break");
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn age(path: &Path) -> Option<Duration> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
}

fn release_owned(path: &Path, owner: &str) -> Result<()> {
    match read_holder(path) {
        Some((holder, _)) if holder == owner => {
            std::fs::remove_file(path)?;
            debug!(lock = %path.display(), %owner, "lock released");
        }
        Some((holder, _)) => {
            warn!(lock = %path.display(), %owner, %holder, "lock owned by another run; leaving it");
        }
        None => {
            debug!(lock = %path.display(), "lock already gone");
        }
    }
    Ok(())
}

/// `(owner, acquired_at_unix)` of the current holder.
fn read_holder(path: &Path) -> Option<(String, i64)> {
    let content = std::fs::read_to_string(path).ok()?;
    let (owner, ts) = content.trim().rsplit_once(':')?;
    Some((owner.to_string(), ts.parse().ok()?))
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    match read_holder(path) {
        Some((_, ts)) => Utc::now().timestamp() - ts >= stale_after.as_secs() as i64,
        // Unreadable or half-written content: only stale once the file
        // itself is old enough, so a holder mid-write is not robbed.
        None => age(path).is_some_and(|a| a >= stale_after),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::acquire(dir.path(), "main", "run-a", Duration::ZERO, HOUR)
            .await
            .unwrap();
        assert!(lock.path().exists());
        let path = lock.path().to_path_buf();
        lock.release().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn second_acquirer_times_out() {
        let dir = TempDir::new().unwrap();
        let _held = RunLock::acquire(dir.path(), "main", "run-a", Duration::ZERO, HOUR)
            .await
            .unwrap();
        let err = RunLock::acquire(
            dir.path(),
            "main",
            "run-b",
            Duration::from_millis(300),
            HOUR,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarvestError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn different_branches_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let _a = RunLock::acquire(dir.path(), "main", "run-a", Duration::ZERO, HOUR)
            .await
            .unwrap();
        let _b = RunLock::acquire(dir.path(), "gh-pages", "run-b", Duration::ZERO, HOUR)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_release() {
        let dir = TempDir::new().unwrap();
        let held = RunLock::acquire(dir.path(), "main", "run-a", Duration::ZERO, HOUR)
            .await
            .unwrap();
        let root = dir.path().to_path_buf();
        let waiter = tokio::spawn(async move {
            RunLock::acquire(&root, "main", "run-b", Duration::from_secs(5), HOUR).await
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        held.release().unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(read_holder(got.path()).unwrap().0, "run-b");
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.lock");
        let old = Utc::now().timestamp() - 10_000;
        std::fs::write(&path, format!("crashed-run:{old}")).unwrap();
        assert!(try_acquire(&path, "run-b", HOUR).unwrap());
        assert_eq!(read_holder(&path).unwrap().0, "run-b");
    }

    #[test]
    fn concurrent_breakers_yield_one_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.lock");
        let old = Utc::now().timestamp() - 10_000;
        std::fs::write(&path, format!("crashed-run:{old}")).unwrap();

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    try_acquire(&path, &format!("run-{i}"), HOUR).unwrap()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        let holder = read_holder(&path).unwrap().0;
        assert!(holder.starts_with("run-"), "{holder}");
        assert!(!guard_path(&path).exists());
    }

    #[test]
    fn fresh_lock_survives_a_late_breaker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.lock");
        std::fs::write(&path, format!("run-a:{}", Utc::now().timestamp())).unwrap();
        // A waiter that judged an earlier holder stale must re-check under the guard.
        assert!(!break_stale(&path, HOUR).unwrap());
        assert_eq!(read_holder(&path).unwrap().0, "run-a");
    }

    #[test]
    fn held_guard_blocks_breaking() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.lock");
        let old = Utc::now().timestamp() - 10_000;
        std::fs::write(&path, format!("crashed-run:{old}")).unwrap();
        std::fs::write(guard_path(&path), "").unwrap();

        assert!(!try_acquire(&path, "run-b", HOUR).unwrap());
        assert_eq!(read_holder(&path).unwrap().0, "crashed-run");
        assert!(guard_path(&path).exists());
    }

    #[test]
    fn release_leaves_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.lock");
        std::fs::write(&path, format!("run-a:{}", Utc::now().timestamp())).unwrap();
        release_owned(&path, "run-b").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn drop_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.lock");
        assert!(try_acquire(&path, "run-a", HOUR).unwrap());
        drop(RunLock {
            path: path.clone(),
            owner: "run-a".into(),
            released: false,
        });
        assert!(!path.exists());
    }
}
