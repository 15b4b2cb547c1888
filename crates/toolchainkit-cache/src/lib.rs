//! Machine-wide toolchain cache shared by many projects and processes.
//!
//! Building blocks:
//! - [`LockManager`]: timeout-bounded cross-process locks (registry, per-toolchain, per-project)
//! - [`Registry`]: JSON index of installed toolchains and the projects using them
//! - [`DownloadCoordinator`]: at most one concurrent install per toolchain id
//! - [`ReferenceCounter`]: per-project usage of cached toolchains
//! - [`CleanupManager`]: eviction of unreferenced, stale toolchains
//! - [`ToolchainInstaller`]: download + extract + register, composed from the above
//!
//! ## On-disk layout
//!
//! Everything lives under one cache root (`~/.toolchainkit` unless
//! [`CACHE_DIR_ENV`] overrides it):
//! - `toolchains/<id>/`: extracted installs; dot-prefixed entries are
//!   staging or trash directories and never installs
//! - `downloads/`: archives (and `.part` files) being fetched
//! - `lock/registry.lock`, `lock/toolchain-<id>.lock`: lock files
//! - `registry.json`: the [`RegistryDocument`]
//!
//! Per-project state (the project lock) lives in `<project>/.toolchainkit/`.

mod archive;
mod cache_dir;
mod cleanup;
mod coordinator;
mod error;
mod installer;
mod lock;
mod refcount;
mod registry;
mod util;

pub use archive::{extract_archive, ArchiveFormat};
pub use cache_dir::{
    ensure_project_state_dir, CacheConfig, CacheDir, CACHE_DIR_ENV, PROJECT_STATE_DIR,
};
pub use cleanup::{
    CleanupFailure, CleanupManager, CleanupReport, CleanupStatistics, SkipReason,
    SkippedToolchain, UnusedToolchain,
};
pub use coordinator::{
    is_installed, Coordination, CoordinatorOptions, DownloadCoordinator, DownloadPermit,
};
pub use error::{CacheError, Result};
pub use installer::{
    InstallOutcome, InstallPhase, InstallProgress, ToolchainInstaller, ToolchainSource,
};
pub use lock::{
    sanitize_lock_name, LockGuard, LockManager, LockTimeouts, PROJECT_LOCK_FILE,
    REGISTRY_LOCK_FILE,
};
pub use refcount::ReferenceCounter;
pub use registry::{
    Registration, Registry, RegistryDocument, RegistryStats, RegistryTransaction,
    ToolchainRecord, UnknownAgePolicy, UnusedFilter, REGISTRY_FORMAT_VERSION,
};
pub use util::canonical_project_path;

pub use toolchainkit_download as download;
