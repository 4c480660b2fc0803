//! Single-run lock
//!
//! A lock file created with `create_new` semantics keeps two runs from
//! allocating ids against the same host pool. It is removed on drop; a file
//! older than `stale_after_secs` is assumed left behind by a crashed run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Self> {
        match Self::try_create(path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = Self::read_info(path);
                let stale = match &holder {
                    Some(info) => Self::age(info) > stale_after,
                    // unreadable: treat as crashed mid-write
                    None => true,
                };
                if !stale {
                    let info = holder.ok_or_else(|| lock_io(path, ErrorKind::InvalidData.into()))?;
                    return Err(OrchestratorError::ConcurrentRun {
                        pid: info.pid,
                        since: info.started_at.to_rfc3339(),
                    });
                }

                warn!("Removing stale run lock {}", path.display());
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(lock_io(path, e)),
                }
                Self::try_create(path).map_err(|e| lock_io(path, e))
            }
            Err(e) => Err(lock_io(path, e)),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let info = LockInfo {
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        let json = serde_json::to_string(&info).map_err(std::io::Error::other)?;
        file.write_all(json.as_bytes())?;
        debug!("Run lock {} acquired", path.display());
        Ok(Self { path: path.to_path_buf() })
    }

    fn read_info(path: &Path) -> Option<LockInfo> {
        let txt = fs::read_to_string(path).ok()?;
        serde_json::from_str(&txt).ok()
    }

    fn age(info: &LockInfo) -> Duration {
        (Utc::now() - info.started_at).to_std().unwrap_or_default()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove run lock {}: {}", self.path.display(), e);
        }
    }
}

fn lock_io(path: &Path, source: std::io::Error) -> OrchestratorError {
    OrchestratorError::Lock {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_second_run_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("range.lock");

        let first = RunLock::acquire(&path, HOUR).unwrap();
        let err = RunLock::acquire(&path, HOUR).unwrap_err();
        assert!(matches!(err, OrchestratorError::ConcurrentRun { pid, .. } if pid == std::process::id()));

        drop(first);
        assert!(!path.exists());
        RunLock::acquire(&path, HOUR).unwrap();
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("range.lock");
        let old = LockInfo {
            pid: 1,
            started_at: Utc::now() - chrono::Duration::hours(12),
        };
        fs::write(&path, serde_json::to_string(&old).unwrap()).unwrap();

        let lock = RunLock::acquire(&path, HOUR).unwrap();
        let info = RunLock::read_info(lock.path()).unwrap();
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn test_garbage_lock_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("range.lock");
        fs::write(&path, "not json").unwrap();
        assert!(RunLock::acquire(&path, HOUR).is_ok());
    }
}
