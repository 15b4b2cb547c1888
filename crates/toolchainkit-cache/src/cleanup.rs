use crate::cache_dir::CacheDir;
use crate::error::Result;
use crate::registry::{Registry, UnusedFilter};
use crate::util::{dir_size_bytes, now_timestamp, remove_dir_under};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;

/// A zero-reference toolchain that is old enough to evict.
#[derive(Clone, Debug, PartialEq)]
pub struct UnusedToolchain {
    pub id: String,
    pub path: PathBuf,
    /// Measured on disk when listed.
    pub size_bytes: u64,
    /// `None` when the registry timestamp is missing or unparsable.
    pub last_used: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    NotRegistered,
    InUse { projects: usize },
    /// The install directory was gone; its registry entry was purged.
    MissingOnDisk,
    /// Another process holds the toolchain lock (installing or repairing it).
    Busy,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedToolchain {
    pub id: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub id: String,
    pub error: String,
}

/// Result summary from a cleanup run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    /// Removed toolchains (or, for a dry run, those that would be removed).
    pub removed: Vec<String>,
    pub skipped: Vec<SkippedToolchain>,
    pub failed: Vec<CleanupFailure>,
    pub bytes_reclaimed: u64,
}

impl CleanupReport {
    fn empty(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CleanupStatistics {
    pub total_toolchains: usize,
    pub total_size_bytes: u64,
    pub unused_toolchains: usize,
    pub reclaimable_bytes: u64,
    pub free_space_bytes: Option<u64>,
}

enum Outcome {
    Removed(u64),
    Skipped(SkipReason),
}

/// Evicts unreferenced toolchains.
///
/// Every eviction re-checks the registry under its lock, so a reference added
/// after [`CleanupManager::list_unused`] always wins over the cleanup.
#[derive(Clone, Debug)]
pub struct CleanupManager {
    registry: Registry,
    toolchains_dir: PathBuf,
}

impl CleanupManager {
    pub fn new(cache: &CacheDir, registry: Registry) -> Self {
        Self {
            registry,
            toolchains_dir: cache.toolchains_dir(),
        }
    }

    /// Zero-reference toolchains unused for at least `min_age`, oldest first.
    pub fn list_unused(&self, min_age: Duration) -> Result<Vec<UnusedToolchain>> {
        self.list_unused_with(&UnusedFilter::older_than(min_age))
    }

    pub fn list_unused_with(&self, filter: &UnusedFilter) -> Result<Vec<UnusedToolchain>> {
        let document = self.registry.snapshot()?;
        let now = OffsetDateTime::now_utc();
        let mut unused: Vec<UnusedToolchain> = document
            .toolchains
            .into_iter()
            .filter(|(_, record)| filter.admits(record, now))
            .map(|(id, record)| UnusedToolchain {
                size_bytes: dir_size_bytes(&record.path),
                last_used: record.last_used_at(),
                path: record.path,
                id,
            })
            .collect();

        // Unknown ages sort first: they are the first candidates for reclaiming.
        unused.sort_by(|a, b| a.last_used.cmp(&b.last_used).then_with(|| a.id.cmp(&b.id)));
        Ok(unused)
    }

    /// Removes each of `ids` that is still registered, unreferenced, and present on disk.
    ///
    /// A failure for one id is recorded in the report and does not stop the others.
    pub fn cleanup(&self, ids: &[String], dry_run: bool) -> CleanupReport {
        let mut report = CleanupReport::empty(dry_run);
        for id in ids {
            match self.cleanup_one(id, dry_run) {
                Ok(Outcome::Removed(bytes)) => {
                    report.removed.push(id.clone());
                    report.bytes_reclaimed = report.bytes_reclaimed.saturating_add(bytes);
                }
                Ok(Outcome::Skipped(reason)) => report.skipped.push(SkippedToolchain {
                    id: id.clone(),
                    reason,
                }),
                Err(err) => {
                    tracing::warn!(
                        target = "toolchainkit.cache",
                        toolchain_id = %id,
                        error = %err,
                        "failed to remove toolchain"
                    );
                    report.failed.push(CleanupFailure {
                        id: id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            target = "toolchainkit.cache",
            dry_run,
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            bytes_reclaimed = report.bytes_reclaimed,
            "toolchain cleanup finished"
        );
        report
    }

    /// Evicts everything unused for at least `max_age`.
    ///
    /// When `min_free_space` (bytes) is given and the cache volume already has
    /// that much available, nothing is removed.
    pub fn auto_cleanup(
        &self,
        max_age: Duration,
        min_free_space: Option<u64>,
        dry_run: bool,
    ) -> Result<CleanupReport> {
        if let Some(min_free_space) = min_free_space {
            let available = fs2::available_space(&self.toolchains_dir)?;
            if available >= min_free_space {
                tracing::debug!(
                    target = "toolchainkit.cache",
                    available,
                    min_free_space,
                    "enough free space; skipping automatic cleanup"
                );
                return Ok(CleanupReport::empty(dry_run));
            }
        }

        let ids: Vec<String> = self
            .list_unused(max_age)?
            .into_iter()
            .map(|unused| unused.id)
            .collect();
        Ok(self.cleanup(&ids, dry_run))
    }

    pub fn statistics(&self) -> Result<CleanupStatistics> {
        let document = self.registry.snapshot()?;
        let unused = UnusedFilter::default();
        let now = OffsetDateTime::now_utc();

        let mut stats = CleanupStatistics {
            total_toolchains: document.toolchains.len(),
            total_size_bytes: 0,
            unused_toolchains: 0,
            reclaimable_bytes: 0,
            free_space_bytes: fs2::available_space(&self.toolchains_dir).ok(),
        };
        for record in document.toolchains.values() {
            let size = dir_size_bytes(&record.path);
            stats.total_size_bytes = stats.total_size_bytes.saturating_add(size);
            if unused.admits(record, now) {
                stats.unused_toolchains += 1;
                stats.reclaimable_bytes = stats.reclaimable_bytes.saturating_add(size);
            }
        }
        Ok(stats)
    }

    fn cleanup_one(&self, id: &str, dry_run: bool) -> Result<Outcome> {
        let mut txn = self.registry.begin()?;
        let Some(record) = txn.record(id).cloned() else {
            return Ok(Outcome::Skipped(SkipReason::NotRegistered));
        };
        if record.is_referenced() {
            tracing::debug!(
                target = "toolchainkit.cache",
                toolchain_id = id,
                projects = record.ref_count(),
                "toolchain gained a reference; keeping it"
            );
            return Ok(Outcome::Skipped(SkipReason::InUse {
                projects: record.ref_count(),
            }));
        }

        if !record.path.exists() {
            if !dry_run {
                txn.document_mut().toolchains.remove(id);
                txn.commit()?;
                tracing::info!(
                    target = "toolchainkit.cache",
                    toolchain_id = id,
                    path = %record.path.display(),
                    "purged registry entry for missing install"
                );
            }
            return Ok(Outcome::Skipped(SkipReason::MissingOnDisk));
        }

        // Lock order is toolchain lock then registry lock everywhere else, so
        // only try it here.
        let locks = self.registry.locks();
        let Some(_toolchain_guard) = locks.try_acquire(&locks.toolchain_lock_path(id)?)? else {
            return Ok(Outcome::Skipped(SkipReason::Busy));
        };

        let size = dir_size_bytes(&record.path);
        if dry_run {
            return Ok(Outcome::Removed(size));
        }

        self.remove_install(&record.path)?;
        let document = txn.document_mut();
        document.toolchains.remove(id);
        document.last_cleanup = Some(now_timestamp());
        txn.commit()?;

        tracing::info!(
            target = "toolchainkit.cache",
            toolchain_id = id,
            path = %record.path.display(),
            bytes = size,
            "removed unused toolchain"
        );
        Ok(Outcome::Removed(size))
    }

    fn remove_install(&self, path: &Path) -> Result<()> {
        remove_dir_under(&self.toolchains_dir, path)
    }
}
