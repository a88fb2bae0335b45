//! Advisory dataset lock
//!
//! One crawl per dataset directory. The lock file is created with
//! `create_new`, so the check and the acquisition are a single filesystem
//! operation. It is removed when the guard drops.
//!
//! A lock left by a process that no longer runs on this host, or one older
//! than the configured TTL, is stale and gets replaced on acquire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::error::LockError;

/// Lock file name inside a dataset directory
pub const LOCK_FILE: &str = "crawl.lock";

/// Lock holder details written into the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub host: String,
    pub started_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: current_host(),
            started_at: Utc::now(),
        }
    }

    fn unknown() -> Self {
        Self {
            pid: 0,
            host: "unknown".to_string(),
            started_at: DateTime::<Utc>::default(),
        }
    }

    pub fn describe(&self) -> String {
        format!("pid {} on {} since {}", self.pid, self.host, self.started_at.to_rfc3339())
    }

    /// Why this holder no longer counts, if it doesn't
    pub fn stale_reason(&self, ttl: Option<Duration>) -> Option<String> {
        if self.host == current_host() && !process_alive(self.pid) {
            return Some(format!("process {} is gone", self.pid));
        }
        let age = Utc::now().signed_duration_since(self.started_at).to_std().ok()?;
        match ttl {
            Some(ttl) if age > ttl => Some(format!("held for {}s", age.as_secs())),
            _ => None,
        }
    }
}

fn current_host() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id() || Path::new("/proc").join(pid.to_string()).exists()
}

// No portable liveness check: rely on the TTL
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Guard holding the dataset lock for its lifetime
#[derive(Debug)]
pub struct DatasetLock {
    path: PathBuf,
    info: LockInfo,
}

impl DatasetLock {
    /// Acquire the lock for `dataset_dir`, failing if a live crawl holds it
    pub fn acquire(dataset_dir: &Path) -> Result<Self, LockError> {
        Self::acquire_with_ttl(dataset_dir, None)
    }

    /// Like [`DatasetLock::acquire`], also replacing locks older than `ttl`
    pub fn acquire_with_ttl(dataset_dir: &Path, ttl: Option<Duration>) -> Result<Self, LockError> {
        fs::create_dir_all(dataset_dir).map_err(|source| LockError::Io {
            path: dataset_dir.to_path_buf(),
            source,
        })?;

        let path = dataset_dir.join(LOCK_FILE);

        let mut file = match create_lock_file(&path)? {
            Some(file) => file,
            None => {
                let holder = Self::read_holder(dataset_dir);
                let stale = holder
                    .as_ref()
                    .and_then(|info| Some((info, info.stale_reason(ttl)?)));
                let Some((previous, reason)) = stale else {
                    return Err(held(path, holder.as_ref()));
                };

                tracing::warn!(
                    path = %path.display(),
                    holder = %previous.describe(),
                    reason = %reason,
                    "Replacing stale dataset lock"
                );
                if !take_stale(&path, previous)? {
                    return Err(held(path, Self::read_holder(dataset_dir).as_ref()));
                }
                match create_lock_file(&path)? {
                    Some(file) => file,
                    // Another process replaced it first
                    None => return Err(held(path, Self::read_holder(dataset_dir).as_ref())),
                }
            }
        };

        let info = LockInfo::current();
        let body = serde_json::to_string(&info).unwrap_or_default();
        if let Err(source) = file.write_all(body.as_bytes()).and_then(|_| file.sync_all()) {
            let _ = fs::remove_file(&path);
            return Err(LockError::Io { path, source });
        }

        tracing::info!(path = %path.display(), pid = info.pid, "Acquired dataset lock");
        Ok(Self { path, info })
    }

    /// Holder recorded in an existing lock file
    pub fn read_holder(dataset_dir: &Path) -> Option<LockInfo> {
        let content = fs::read_to_string(dataset_dir.join(LOCK_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Remove a lock left behind by a crashed process
    ///
    /// Returns the previous holder, or `None` if no lock file existed.
    pub fn force_release(dataset_dir: &Path) -> Result<Option<LockInfo>, LockError> {
        let path = dataset_dir.join(LOCK_FILE);
        let holder = Self::read_holder(dataset_dir);

        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::warn!(path = %path.display(), "Force-released dataset lock");
                Ok(holder.or_else(|| Some(LockInfo::unknown())))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

fn create_lock_file(path: &Path) -> Result<Option<fs::File>, LockError> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn held(path: PathBuf, holder: Option<&LockInfo>) -> LockError {
    let holder = holder
        .map(LockInfo::describe)
        .unwrap_or_else(|| "unknown holder".to_string());
    LockError::Held { path, holder }
}

/// Move the stale lock aside and delete it
///
/// Returns false when the file moved aside is not `stale` (another process
/// replaced it meanwhile); that lock is put back.
fn take_stale(path: &Path, stale: &LockInfo) -> Result<bool, LockError> {
    let aside = path.with_extension(format!("lock.stale-{}", std::process::id()));
    let io_err = |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    };

    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(source) => return Err(io_err(source)),
    }

    let moved: Option<LockInfo> = fs::read_to_string(&aside)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok());
    if moved.as_ref() != Some(stale) {
        // Restore without clobbering a lock created since
        let _ = fs::hard_link(&aside, path);
        let _ = fs::remove_file(&aside);
        return Ok(false);
    }

    fs::remove_file(&aside).map_err(io_err)?;
    Ok(true)
}

impl Drop for DatasetLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Released dataset lock"),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove lock file")
            }
        }
    }
}
