//! Inter-process catalog lock.
//!
//! Acquisition never blocks in the kernel: each attempt is non-blocking and
//! the caller polls on a short interval until the lock is obtained or the
//! configured timeout elapses. A crashed holder never wedges later
//! invocations: the kernel drops a dead process's file lock, and a directory
//! lock whose owner is gone (or older than the stale threshold) is reclaimed.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, trace, warn};

use crate::config::{
    EngineConfig, LockStrategy, DEFAULT_LOCK_RETRY_INTERVAL, DEFAULT_LOCK_STALE_AFTER,
    DEFAULT_LOCK_TIMEOUT,
};
use crate::error::LockError;
use crate::fsutil::ensure_dir;

const OWNER_FILE_NAME: &str = "owner";

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    strategy: LockStrategy,
    timeout: Duration,
    retry_interval: Duration,
    stale_after: Duration,
}

enum Attempt {
    Acquired(CatalogLock),
    Busy,
    Missing,
}

/// Written into a directory lock so contenders can tell a live holder from
/// a crashed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    label: String,
    acquired_at: DateTime<Utc>,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>, strategy: LockStrategy) -> Self {
        Self {
            path: path.into(),
            strategy,
            timeout: DEFAULT_LOCK_TIMEOUT,
            retry_interval: DEFAULT_LOCK_RETRY_INTERVAL,
            stale_after: DEFAULT_LOCK_STALE_AFTER,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.lock_path, config.lock_strategy)
            .with_timeout(config.lock_timeout)
            .with_retry_interval(config.lock_retry_interval)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Age past which a directory lock is reclaimed even if its owner still
    /// appears to be running.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn strategy(&self) -> LockStrategy {
        self.strategy
    }

    /// Polls for the lock until it is held or the timeout elapses. The
    /// returned guard releases on drop.
    pub fn acquire(&self, label: &str) -> Result<CatalogLock, LockError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent).map_err(|source| LockError::Io {
                    label: label.to_string(),
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let start = Instant::now();
        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            let cause = match self.try_acquire(label)? {
                Attempt::Acquired(lock) => {
                    trace!(label, attempts, strategy = self.strategy.as_str(), "catalog lock acquired");
                    return Ok(lock);
                }
                Attempt::Busy => {
                    let reclaimed =
                        self.strategy == LockStrategy::Directory && self.reclaim_stale(label)?;
                    if reclaimed && start.elapsed() < self.timeout {
                        continue;
                    }
                    "lock busy"
                }
                Attempt::Missing => "lock file missing",
            };
            let waited = start.elapsed();
            if waited >= self.timeout {
                debug!(label, attempts, cause, "catalog lock timed out");
                return Err(LockError::Timeout {
                    label: label.to_string(),
                    path: self.path.clone(),
                    waited_ms: waited.as_millis(),
                    cause: cause.to_string(),
                });
            }
            thread::sleep(self.retry_interval.min(self.timeout - waited));
        }
    }

    fn try_acquire(&self, label: &str) -> Result<Attempt, LockError> {
        let io_err = |path: &Path, source: io::Error| LockError::Io {
            label: label.to_string(),
            path: path.to_path_buf(),
            source,
        };
        match self.strategy {
            LockStrategy::Flock => {
                let file = match OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .truncate(false)
                    .open(&self.path)
                {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Attempt::Missing),
                    Err(e) => return Err(io_err(&self.path, e)),
                };
                match file.try_lock_exclusive() {
                    Ok(()) => Ok(Attempt::Acquired(CatalogLock {
                        label: label.to_string(),
                        held: Held::File(file),
                    })),
                    Err(e) if is_contended(&e) => Ok(Attempt::Busy),
                    Err(e) => Err(io_err(&self.path, e)),
                }
            }
            LockStrategy::Directory => {
                let dir = directory_lock_path(&self.path);
                match fs::create_dir(&dir) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(Attempt::Busy),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Attempt::Missing),
                    Err(e) => return Err(io_err(&dir, e)),
                }
                let owner = LockOwner {
                    pid: std::process::id(),
                    label: label.to_string(),
                    acquired_at: Utc::now(),
                };
                let written = serde_json::to_vec(&owner)
                    .map_err(io::Error::from)
                    .and_then(|bytes| fs::write(dir.join(OWNER_FILE_NAME), bytes));
                if let Err(e) = written {
                    let _ = fs::remove_dir_all(&dir);
                    return Err(io_err(&dir, e));
                }
                Ok(Attempt::Acquired(CatalogLock {
                    label: label.to_string(),
                    held: Held::Directory(dir),
                }))
            }
        }
    }

    /// Removes a directory lock left behind by a dead or long-gone holder.
    /// Returns true when the caller should retry at once.
    fn reclaim_stale(&self, label: &str) -> Result<bool, LockError> {
        let dir = directory_lock_path(&self.path);
        let owner_path = dir.join(OWNER_FILE_NAME);
        let observed = fs::read(&owner_path).ok();
        let reason = match observed.as_deref().map(serde_json::from_slice::<LockOwner>) {
            Some(Ok(owner)) => {
                let age = (Utc::now() - owner.acquired_at).to_std().unwrap_or_default();
                if !process_alive(owner.pid) {
                    format!("owner pid {} is gone", owner.pid)
                } else if age >= self.stale_after {
                    format!("held by '{}' for {}ms", owner.label, age.as_millis())
                } else {
                    return Ok(false);
                }
            }
            // Mid-acquire holders have not written their owner file yet; only
            // the directory's age can tell them from a crash.
            _ => {
                let modified = match fs::metadata(&dir).and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
                    Err(_) => return Ok(false),
                };
                let age = SystemTime::now().duration_since(modified).unwrap_or_default();
                if age < self.stale_after {
                    return Ok(false);
                }
                format!("no owner record after {}ms", age.as_millis())
            }
        };

        if fs::read(&owner_path).ok() != observed {
            return Ok(false);
        }
        let mut tomb_name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tomb_name.push(format!(
            ".stale-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let tomb = dir.with_file_name(tomb_name);
        match fs::rename(&dir, &tomb) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(source) => {
                return Err(LockError::Io {
                    label: label.to_string(),
                    path: dir,
                    source,
                })
            }
        }
        warn!(label, path = %dir.display(), reason = %reason, "reclaimed stale catalog lock");
        if let Err(e) = fs::remove_dir_all(&tomb) {
            debug!(path = %tomb.display(), err = %e, "failed to clean up reclaimed lock directory");
        }
        Ok(true)
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: alive but owned by someone else.
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

fn directory_lock_path(lock_path: &Path) -> PathBuf {
    let mut name = lock_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".d");
    lock_path.with_file_name(name)
}

enum Held {
    File(File),
    Directory(PathBuf),
    Released,
}

/// Scoped hold on the catalog lock.
pub struct CatalogLock {
    label: String,
    held: Held,
}

impl std::fmt::Debug for CatalogLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let held = match &self.held {
            Held::File(_) => "flock",
            Held::Directory(_) => "directory",
            Held::Released => "released",
        };
        f.debug_struct("CatalogLock")
            .field("label", &self.label)
            .field("held", &held)
            .finish()
    }
}

impl CatalogLock {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        match std::mem::replace(&mut self.held, Held::Released) {
            Held::File(file) => {
                if let Err(e) = FileExt::unlock(&file) {
                    debug!(label = %self.label, err = %e, "failed to unlock catalog lock file");
                }
            }
            Held::Directory(dir) => {
                let _ = fs::remove_file(dir.join(OWNER_FILE_NAME));
                if let Err(e) = fs::remove_dir(&dir) {
                    debug!(label = %self.label, path = %dir.display(), err = %e, "failed to remove lock directory");
                }
            }
            Held::Released => return,
        }
        trace!(label = %self.label, "catalog lock released");
    }
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        self.unlock();
    }
}
