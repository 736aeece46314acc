//! Cross-process file-based mutexes.
//!
//! A lock is a file under `<repoRoot>/.laneflow/locks/` created with
//! `O_CREAT | O_EXCL`, containing the owner's pid. If two processes race,
//! exactly one wins the create. Waiters poll with jittered backoff until a
//! configured timeout.
//!
//! A lock whose recorded pid is no longer alive is stale; stale locks are
//! swept before an acquisition attempt gives up.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {name:?} (held by pid {holder:?})")]
    Timeout {
        name: String,
        waited: Duration,
        holder: Option<u32>,
    },

    #[error("lock i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Check whether a pid refers to a live process.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // kill(pid, 0) probes existence without delivering a signal. EPERM
    // still means the process exists.
    let ret = unsafe { libc::kill(pid as i32, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // No portable liveness probe; assume alive so locks are never stolen.
    true
}

/// Manages named locks in a single directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    locks_dir: PathBuf,
    poll_interval: Duration,
}

/// RAII guard; releases the lock file on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock");
            }
        }
    }
}

impl LockManager {
    pub fn new(locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn locks_dir(&self) -> &Path {
        &self.locks_dir
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.locks_dir.join(format!("{name}.lock"))
    }

    /// Acquire a named lock, waiting up to `timeout`.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        let path = self.lock_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LockError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let started = Instant::now();
        let mut swept_stale = false;

        loop {
            match self.try_create(&path) {
                Ok(guard) => return Ok(guard),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = read_holder_pid(&path);

                    // Sweep a stale holder once per acquisition attempt.
                    if let Some(pid) = holder {
                        if !pid_alive(pid) && !swept_stale {
                            tracing::info!(
                                lock = name,
                                stale_pid = pid,
                                "removing stale lock"
                            );
                            let _ = std::fs::remove_file(&path);
                            swept_stale = true;
                            continue;
                        }
                    }

                    if started.elapsed() >= timeout {
                        return Err(LockError::Timeout {
                            name: name.to_string(),
                            waited: started.elapsed(),
                            holder,
                        });
                    }

                    tokio::time::sleep(jittered(self.poll_interval)).await;
                }
                Err(e) => {
                    return Err(LockError::Io {
                        path: path.clone(),
                        source: e,
                    });
                }
            }
        }
    }

    fn try_create(&self, path: &Path) -> std::io::Result<LockGuard> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(LockGuard {
            path: path.to_path_buf(),
        })
    }

    /// Remove every lock in the directory whose holder is dead.
    pub fn sweep_stale(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.locks_dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            match read_holder_pid(&path) {
                Some(pid) if pid_alive(pid) => {}
                _ => {
                    if std::fs::remove_file(&path).is_ok() {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }
}

fn read_holder_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn jittered(base: Duration) -> Duration {
    use rand::Rng;
    let jitter = rand::rng().random_range(0..base.as_millis().max(1) as u64);
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let mgr = LockManager::new(dir.path());

        let guard = mgr.acquire("worktree", Duration::from_secs(1)).await.unwrap();
        let lock_file = dir.path().join("worktree.lock");
        assert!(lock_file.exists());
        let pid: u32 = std::fs::read_to_string(&lock_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(pid, std::process::id());

        drop(guard);
        assert!(!lock_file.exists());
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let dir = TempDir::new().unwrap();
        let mgr = LockManager::new(dir.path());

        let _guard = mgr.acquire("a", Duration::from_secs(1)).await.unwrap();
        let err = mgr.acquire("a", Duration::from_millis(250)).await.unwrap_err();
        match err {
            LockError::Timeout { name, holder, .. } => {
                assert_eq!(name, "a");
                assert_eq!(holder, Some(std::process::id()));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_lock_is_swept_on_acquire() {
        let dir = TempDir::new().unwrap();
        let mgr = LockManager::new(dir.path());

        // Fabricate a lock held by a pid that cannot be alive.
        let path = dir.path().join("stale.lock");
        std::fs::write(&path, "999999999").unwrap();

        let guard = mgr.acquire("stale", Duration::from_secs(1)).await;
        assert!(guard.is_ok(), "stale lock should have been reclaimed");
    }

    #[tokio::test]
    async fn sweep_removes_only_dead_holders() {
        let dir = TempDir::new().unwrap();
        let mgr = LockManager::new(dir.path());

        std::fs::write(dir.path().join("dead.lock"), "999999999").unwrap();
        let _live = mgr.acquire("live", Duration::from_secs(1)).await.unwrap();

        let removed = mgr.sweep_stale();
        assert_eq!(removed, 1);
        assert!(dir.path().join("live.lock").exists());
        assert!(!dir.path().join("dead.lock").exists());
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }
}
