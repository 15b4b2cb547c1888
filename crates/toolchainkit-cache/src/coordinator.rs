use crate::error::{CacheError, Result};
use crate::lock::{LockGuard, LockManager};
use crate::util::is_non_empty_dir;
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// How long to wait for the per-toolchain lock.
    pub lock_timeout: Duration,
    /// How long to keep polling for another process's install after the lock wait failed.
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(300),
            wait_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Exclusive right to install one toolchain. Dropping it releases the toolchain lock.
#[derive(Debug)]
pub struct DownloadPermit {
    toolchain_id: String,
    _guard: LockGuard,
}

impl DownloadPermit {
    pub fn toolchain_id(&self) -> &str {
        &self.toolchain_id
    }
}

/// Outcome of [`DownloadCoordinator::coordinate`].
#[derive(Debug)]
pub enum Coordination {
    /// The install directory is complete; use it.
    Ready,
    /// This caller must download, extract, and register while holding the permit.
    Download(DownloadPermit),
}

impl Coordination {
    pub fn should_download(&self) -> bool {
        matches!(self, Coordination::Download(_))
    }
}

/// Ensures at most one process at a time installs a given toolchain id.
///
/// Callers that get [`Coordination::Download`] must publish the install
/// directory atomically (extract elsewhere, then rename into place) before
/// dropping the permit: any non-empty directory at the destination is taken as
/// a finished install by everyone else.
#[derive(Clone, Debug)]
pub struct DownloadCoordinator {
    locks: LockManager,
    options: CoordinatorOptions,
}

impl DownloadCoordinator {
    pub fn new(locks: LockManager) -> Self {
        Self {
            locks,
            options: CoordinatorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> CoordinatorOptions {
        self.options
    }

    pub fn coordinate(&self, toolchain_id: &str, destination: &Path) -> Result<Coordination> {
        if is_installed(destination) {
            return Ok(Coordination::Ready);
        }

        let lock_path = self.locks.toolchain_lock_path(toolchain_id)?;
        match self.locks.acquire(&lock_path, self.options.lock_timeout) {
            Ok(guard) => {
                // Another process may have finished while we waited for the lock.
                if is_installed(destination) {
                    return Ok(Coordination::Ready);
                }
                tracing::debug!(
                    target = "toolchainkit.cache",
                    toolchain_id,
                    "acquired toolchain lock; caller will install"
                );
                Ok(Coordination::Download(DownloadPermit {
                    toolchain_id: toolchain_id.to_owned(),
                    _guard: guard,
                }))
            }
            Err(CacheError::LockTimeout { .. }) => self.wait_for_install(toolchain_id, destination),
            Err(err) => Err(err),
        }
    }

    fn wait_for_install(&self, toolchain_id: &str, destination: &Path) -> Result<Coordination> {
        tracing::info!(
            target = "toolchainkit.cache",
            toolchain_id,
            "another process is installing this toolchain; waiting for it"
        );
        let started = Instant::now();
        loop {
            if is_installed(destination) {
                return Ok(Coordination::Ready);
            }
            let waited = started.elapsed();
            if waited >= self.options.wait_timeout {
                return Err(CacheError::CoordinatorTimeout {
                    id: toolchain_id.to_owned(),
                    waited,
                });
            }
            std::thread::sleep(self.options.poll_interval.min(self.options.wait_timeout - waited));
        }
    }
}

/// A toolchain counts as installed once its directory exists and is non-empty.
pub fn is_installed(destination: &Path) -> bool {
    is_non_empty_dir(destination)
}
