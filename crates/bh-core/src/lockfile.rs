//! PID lock files guarding task records across processes.
//!
//! A lock is a file created with `O_CREAT | O_EXCL` that holds the owner's
//! PID. Exactly one creator wins; the file is removed when the [`LockFile`]
//! guard drops.
//!
//! ## Stale lock recovery
//!
//! When the create fails because the file exists, the recorded PID is
//! checked with `kill(pid, 0)`. A lock left behind by a dead process is
//! removed and the create retried once. A lock whose PID was never written
//! only counts as stale once it is older than ten seconds.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

/// How long a lock file without a readable PID is trusted.
const UNWRITTEN_GRACE: Duration = Duration::from_secs(10);

const RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Held lock; the file is removed on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Take the lock if nobody alive holds it. `Ok(None)` means it is held.
    pub fn try_acquire(path: &Path) -> std::io::Result<Option<Self>> {
        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let lock = Self {
                        path: path.to_path_buf(),
                    };
                    // Dropping `lock` on a failed write removes the file again.
                    write!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    return Ok(Some(lock));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if attempt == 0 && is_stale(path) {
                        tracing::info!(path = %path.display(), "removing stale lock file");
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Wait up to `timeout` for the lock.
    pub fn acquire(path: &Path, timeout: Duration) -> std::io::Result<Option<Self>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(Some(lock));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// PID recorded in a lock file, if it has been written.
pub fn holder(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_stale(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(content) => match content.trim().parse::<u32>() {
            Ok(pid) => !pid_alive(pid),
            Err(_) => older_than(path, UNWRITTEN_GRACE),
        },
        // Released between our create and this read.
        Err(e) if e.kind() == ErrorKind::NotFound => true,
        Err(_) => false,
    }
}

fn older_than(path: &Path, age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|elapsed| elapsed > age)
}

/// EPERM still means the process exists, just not ours to signal.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs the existence and permission checks only.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lock");

        let held = LockFile::try_acquire(&path).unwrap().expect("first acquire");
        assert_eq!(holder(&path), Some(std::process::id()));
        assert!(LockFile::try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(!path.exists());
        assert!(LockFile::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn dead_holder_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lock");
        std::fs::write(&path, "4000000").unwrap();

        let lock = LockFile::try_acquire(&path).unwrap();
        assert!(lock.is_some());
        assert_eq!(holder(&path), Some(std::process::id()));
    }

    #[test]
    fn fresh_unwritten_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lock");
        std::fs::write(&path, "").unwrap();
        assert!(LockFile::try_acquire(&path).unwrap().is_none());
    }

    #[test]
    fn acquire_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lock");
        let _held = LockFile::try_acquire(&path).unwrap().unwrap();

        let started = Instant::now();
        let second = LockFile::acquire(&path, Duration::from_millis(50)).unwrap();
        assert!(second.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
