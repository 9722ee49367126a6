//! PID lock file and port discovery file (C12).
//!
//! One lock file under a user-config directory, created exclusively at
//! startup and cleaned on graceful exit (the `Drop` impl). A stale lock
//! (owning process no longer alive) is recognized and replaced rather than
//! blocking startup forever.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::errors::ConfigError;

const LOCK_FILE_NAME: &str = "loadgend.lock";
const DISCOVERY_FILE_NAME: &str = "loadgend.discovery";

/// Holds the daemon's PID lock for its lifetime; removes both the lock and
/// discovery file when dropped.
#[derive(Debug)]
pub struct LockFile {
    lock_path: PathBuf,
    discovery_path: PathBuf,
}

impl LockFile {
    /// Acquires the lock under `base_dir`, or under the platform's user
    /// config directory if `base_dir` is `None`. Replaces a stale lock
    /// (the recorded PID is no longer alive) rather than failing.
    pub fn acquire(base_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let dir = match base_dir {
            Some(d) => d.to_path_buf(),
            None => directories::ProjectDirs::from("dev", "loadgend", "loadgend")
                .map(|p| p.config_dir().to_path_buf())
                .ok_or_else(|| ConfigError::LockFileIo {
                    path: "<user config dir>".into(),
                    message: "could not determine the platform config directory".into(),
                })?,
        };
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let lock_path = dir.join(LOCK_FILE_NAME);
        let discovery_path = dir.join(DISCOVERY_FILE_NAME);

        if let Some(existing_pid) = read_pid(&lock_path) {
            if process_is_alive(existing_pid) {
                return Err(ConfigError::AlreadyRunning(existing_pid));
            }
            warn!(pid = existing_pid, path = %lock_path.display(), "replacing stale lock file");
            let _ = std::fs::remove_file(&lock_path);
        }

        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(mut file) => {
                write!(file, "{}", std::process::id()).map_err(|e| io_err(&lock_path, e))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Lost a race with another startup; report whoever won it.
                if let Some(pid) = read_pid(&lock_path) {
                    return Err(ConfigError::AlreadyRunning(pid));
                }
                return Err(io_err(&lock_path, e));
            }
            Err(e) => return Err(io_err(&lock_path, e)),
        }

        info!(path = %lock_path.display(), pid = std::process::id(), "acquired lock file");
        Ok(Self {
            lock_path,
            discovery_path,
        })
    }

    /// Records the bound listen port next to the lock, for a supervising
    /// UI that didn't specify a fixed port to discover it.
    pub fn write_discovery(&self, port: u16) -> Result<(), ConfigError> {
        std::fs::write(&self.discovery_path, port.to_string())
            .map_err(|e| io_err(&self.discovery_path, e))
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
        let _ = std::fs::remove_file(&self.discovery_path);
    }
}

fn io_err(path: &Path, e: std::io::Error) -> ConfigError {
    ConfigError::LockFileIo {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Best-effort liveness check. Accurate on Linux via `/proc`; elsewhere we
/// cannot verify without an extra dependency this daemon doesn't otherwise
/// need, so we conservatively assume the process is still alive (never
/// steal a lock we can't actually confirm is stale).
fn process_is_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn acquire_creates_lock_with_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::acquire(Some(dir.path())).unwrap();
        let contents = std::fs::read_to_string(lock.lock_path()).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    #[serial]
    fn second_acquire_while_held_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = LockFile::acquire(Some(dir.path())).unwrap();
        let result = LockFile::acquire(Some(dir.path()));
        assert!(matches!(result, Err(ConfigError::AlreadyRunning(pid)) if pid == std::process::id()));
    }

    #[test]
    #[serial]
    fn stale_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(LOCK_FILE_NAME);
        std::fs::write(&lock_path, "999999999").unwrap();
        let lock = LockFile::acquire(Some(dir.path()));
        assert!(lock.is_ok(), "stale lock should be replaced, got {lock:?}");
    }

    #[test]
    #[serial]
    fn drop_removes_lock_and_discovery_files() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path;
        let discovery_path = dir.path().join(DISCOVERY_FILE_NAME);
        {
            let lock = LockFile::acquire(Some(dir.path())).unwrap();
            lock.write_discovery(7077).unwrap();
            lock_path = lock.lock_path().to_path_buf();
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
        assert!(!discovery_path.exists());
    }
}
