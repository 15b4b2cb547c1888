use crate::cache_dir::{CacheDir, PROJECT_STATE_DIR};
use crate::error::{CacheError, Result};
use crate::util::canonical_project_path;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, TryLockError};
use std::time::{Duration, Instant, SystemTime};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lock waits longer than this are logged once per acquisition.
const CONTENTION_LOG_AFTER: Duration = Duration::from_secs(1);

pub const REGISTRY_LOCK_FILE: &str = "registry.lock";
pub const PROJECT_LOCK_FILE: &str = "project.lock";

/// Default acquisition timeouts per lock domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockTimeouts {
    pub registry: Duration,
    /// Long enough to cover a full toolchain download.
    pub toolchain: Duration,
    pub project: Duration,
}

impl Default for LockTimeouts {
    fn default() -> Self {
        Self {
            registry: Duration::from_secs(30),
            toolchain: Duration::from_secs(300),
            project: Duration::from_secs(10),
        }
    }
}

/// Named, timeout-bounded mutexes shared by every process using the same cache root.
///
/// Each lock is an OS advisory lock on a zero-byte file; the OS releases it if
/// the owning process dies. Within one process, an additional per-path mutex
/// makes threads exclude each other as well.
#[derive(Clone, Debug)]
pub struct LockManager {
    lock_dir: PathBuf,
    timeouts: LockTimeouts,
}

/// Holds a lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
    _process_guard: MutexGuard<'static, ()>,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::debug!(
                target = "toolchainkit.cache",
                path = %self.path.display(),
                error = %err,
                "failed to release lock"
            );
        }
    }
}

impl LockManager {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            timeouts: LockTimeouts::default(),
        }
    }

    pub fn for_cache(cache: &CacheDir) -> Self {
        Self::new(cache.lock_dir())
    }

    pub fn with_timeouts(mut self, timeouts: LockTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn timeouts(&self) -> LockTimeouts {
        self.timeouts
    }

    pub fn registry_lock_path(&self) -> PathBuf {
        self.lock_dir.join(REGISTRY_LOCK_FILE)
    }

    pub fn toolchain_lock_path(&self, toolchain_id: &str) -> Result<PathBuf> {
        if toolchain_id.is_empty() {
            return Err(CacheError::invalid_argument("toolchain id must not be empty"));
        }
        Ok(self
            .lock_dir
            .join(format!("toolchain-{}.lock", sanitize_lock_name(toolchain_id))))
    }

    /// `<project>/.toolchainkit/project.lock`; the project path is canonicalized first.
    pub fn project_lock_path(project: &Path) -> Result<PathBuf> {
        Ok(canonical_project_path(project)?
            .join(PROJECT_STATE_DIR)
            .join(PROJECT_LOCK_FILE))
    }

    pub fn lock_registry(&self) -> Result<LockGuard> {
        self.acquire(&self.registry_lock_path(), self.timeouts.registry)
    }

    pub fn lock_toolchain(&self, toolchain_id: &str) -> Result<LockGuard> {
        self.acquire(&self.toolchain_lock_path(toolchain_id)?, self.timeouts.toolchain)
    }

    pub fn lock_project(&self, project: &Path) -> Result<LockGuard> {
        self.acquire(&Self::project_lock_path(project)?, self.timeouts.project)
    }

    /// Blocks until the lock at `path` is held or `timeout` elapses.
    ///
    /// Timing out yields [`CacheError::LockTimeout`].
    pub fn acquire(&self, path: &Path, timeout: Duration) -> Result<LockGuard> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut logged_contention = false;
        loop {
            if let Some(guard) = try_lock_path(path)? {
                return Ok(guard);
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    target = "toolchainkit.cache",
                    path = %path.display(),
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for lock"
                );
                return Err(CacheError::LockTimeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            if !logged_contention && now.duration_since(started) >= CONTENTION_LOG_AFTER {
                logged_contention = true;
                tracing::info!(
                    target = "toolchainkit.cache",
                    path = %path.display(),
                    "waiting for lock held by another process"
                );
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Takes the lock at `path` only if it is free right now.
    pub fn try_acquire(&self, path: &Path) -> Result<Option<LockGuard>> {
        try_lock_path(path)
    }

    /// Deletes `*.lock` files in the lock directory older than `max_age`.
    ///
    /// Locks that are currently held (by any process) are left alone. Returns
    /// the number of files removed.
    pub fn cleanup_stale_locks(&self, max_age: Duration) -> Result<usize> {
        let entries = match fs::read_dir(&self.lock_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0usize;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::debug!(
                        target = "toolchainkit.cache",
                        dir = %self.lock_dir.display(),
                        error = %err,
                        "failed to read lock directory entry"
                    );
                    continue;
                }
            };
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "lock") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }

            if remove_if_unheld(&path) {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(
                target = "toolchainkit.cache",
                dir = %self.lock_dir.display(),
                removed,
                "removed stale lock files"
            );
        }
        Ok(removed)
    }
}

/// Replaces characters that are illegal in file names on some platform.
pub fn sanitize_lock_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect()
}

fn try_lock_path(path: &Path) -> Result<Option<LockGuard>> {
    let Some(process_guard) = try_process_lock(path) else {
        return Ok(None);
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;

    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(err) if is_contended(&err) => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    // Stale-lock cleanup may have unlinked the file between our open and lock;
    // holding a lock on an orphaned inode would not exclude anyone.
    if !still_linked(&file, path) {
        let _ = FileExt::unlock(&file);
        return Ok(None);
    }

    if let Err(err) = file.set_modified(SystemTime::now()) {
        tracing::debug!(
            target = "toolchainkit.cache",
            path = %path.display(),
            error = %err,
            "failed to refresh lock file mtime"
        );
    }

    Ok(Some(LockGuard {
        file,
        path: path.to_path_buf(),
        _process_guard: process_guard,
    }))
}

fn remove_if_unheld(path: &Path) -> bool {
    let Some(_process_guard) = try_process_lock(path) else {
        return false;
    };
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "toolchainkit.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to open lock file during stale lock cleanup"
                );
            }
            return false;
        }
    };
    if file.try_lock_exclusive().is_err() {
        tracing::debug!(
            target = "toolchainkit.cache",
            path = %path.display(),
            "stale-looking lock is still held; keeping it"
        );
        return false;
    }

    let removed = match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "toolchainkit.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to remove stale lock file"
                );
            }
            false
        }
    };
    let _ = FileExt::unlock(&file);
    removed
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt as _;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(linked)) => held.dev() == linked.dev() && held.ino() == linked.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}

fn try_process_lock(path: &Path) -> Option<MutexGuard<'static, ()>> {
    match process_lock_for_path(path).try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

fn process_lock_for_path(path: &Path) -> &'static Mutex<()> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> = OnceLock::new();
    let locks = PROCESS_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));

    let mut map = locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *map.entry(path.to_path_buf())
        .or_insert_with(|| &*Box::leak(Box::new(Mutex::new(()))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_path_separators_and_colons() {
        assert_eq!(sanitize_lock_name("llvm-18/linux:x64"), "llvm-18-linux-x64");
        assert_eq!(sanitize_lock_name("a\\b"), "a-b");
        assert_eq!(sanitize_lock_name("gcc-13.2.0-linux-x64"), "gcc-13.2.0-linux-x64");
    }

    #[test]
    fn lock_paths_are_deterministic() {
        let manager = LockManager::new("/cache/lock");
        assert_eq!(
            manager.registry_lock_path(),
            PathBuf::from("/cache/lock/registry.lock")
        );
        assert_eq!(
            manager.toolchain_lock_path("llvm-18.1.8-linux-x64").unwrap(),
            PathBuf::from("/cache/lock/toolchain-llvm-18.1.8-linux-x64.lock")
        );
        assert!(manager.toolchain_lock_path("").is_err());
    }

    #[test]
    fn second_acquire_times_out_while_first_is_held() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = LockManager::new(tmp.path());
        let path = manager.registry_lock_path();

        let held = manager.acquire(&path, Duration::from_secs(1)).unwrap();
        let err = manager
            .acquire(&path, Duration::from_millis(120))
            .unwrap_err();
        assert!(
            matches!(err, CacheError::LockTimeout { .. }),
            "unexpected error: {err:?}"
        );
        assert!(err.is_retryable());
        assert!(manager.try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(manager.try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn project_lock_lives_in_project_state_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("project");
        fs::create_dir_all(&project).unwrap();

        let manager = LockManager::new(tmp.path().join("lock"));
        let guard = manager.lock_project(&project).unwrap();
        assert_eq!(
            guard.path(),
            fs::canonicalize(&project)
                .unwrap()
                .join(".toolchainkit")
                .join("project.lock")
        );
        assert!(guard.path().is_file());
    }

    #[test]
    fn held_locks_survive_stale_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = LockManager::new(tmp.path());
        let guard = manager.lock_toolchain("llvm-18-linux-x64").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(manager.cleanup_stale_locks(Duration::ZERO).unwrap(), 0);
        assert!(guard.path().exists());

        drop(guard);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(manager.cleanup_stale_locks(Duration::ZERO).unwrap(), 1);
    }
}
