//! Durable index of installed toolchains and the projects that reference them.
//!
//! The registry is a single JSON document (`<cache_root>/registry.json`).
//! Every mutation loads, mutates, and atomically rewrites the document while
//! holding the registry lock, so writers from different processes are strictly
//! serialized.
//!
//! Install directories are the source of truth; the registry is an index that
//! can be rebuilt. A document that cannot be read as a registry (bad JSON or
//! missing top-level keys) is moved aside and rebuilt from `toolchains/`.

use crate::cache_dir::{validate_toolchain_id, CacheDir};
use crate::error::{CacheError, Result};
use crate::lock::{LockGuard, LockManager};
use crate::util::{
    atomic_write, canonical_project_path, dir_size_bytes, format_timestamp, is_non_empty_dir,
    now_millis, now_timestamp, parse_timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;

/// Current on-disk format version.
pub const REGISTRY_FORMAT_VERSION: u32 = 1;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One installed toolchain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolchainRecord {
    pub path: PathBuf,
    pub size_mb: f64,
    /// Canonical paths of the projects using this toolchain.
    #[serde(default)]
    pub projects: BTreeSet<PathBuf>,
    #[serde(default)]
    pub installed: String,
    #[serde(default)]
    pub last_used: String,
    /// `sha256:<hex>` of the archive this install came from; empty when unknown.
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub verified: bool,
}

impl ToolchainRecord {
    pub fn ref_count(&self) -> usize {
        self.projects.len()
    }

    pub fn is_referenced(&self) -> bool {
        !self.projects.is_empty()
    }

    pub fn installed_at(&self) -> Option<OffsetDateTime> {
        parse_timestamp(&self.installed)
    }

    pub fn last_used_at(&self) -> Option<OffsetDateTime> {
        parse_timestamp(&self.last_used)
    }

    pub fn size_bytes(&self) -> u64 {
        (self.size_mb * BYTES_PER_MB).round().max(0.0) as u64
    }
}

/// The whole `registry.json` document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: u32,
    pub toolchains: BTreeMap<String, ToolchainRecord>,
    #[serde(default)]
    pub total_size_mb: f64,
    #[serde(default)]
    pub last_cleanup: Option<String>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: REGISTRY_FORMAT_VERSION,
            toolchains: BTreeMap::new(),
            total_size_mb: 0.0,
            last_cleanup: None,
        }
    }
}

impl RegistryDocument {
    /// Recomputes `total_size_mb` from the records.
    pub fn recompute_total_size(&mut self) {
        self.total_size_mb = self.toolchains.values().map(|record| record.size_mb).sum();
    }
}

/// Details for a new or replaced record.
#[derive(Clone, Debug, PartialEq)]
pub struct Registration {
    pub path: PathBuf,
    pub size_mb: f64,
    pub hash: String,
    pub source_url: String,
    pub verified: bool,
}

/// What to do with records whose `last_used` timestamp is missing or unparsable
/// when filtering by age.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnknownAgePolicy {
    /// Treat them as old enough to reclaim.
    #[default]
    Reclaim,
    /// Keep them until their age can be established.
    Retain,
}

/// Selects zero-reference toolchains for eviction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnusedFilter {
    /// Only include records last used at least this long ago.
    pub older_than: Option<Duration>,
    pub unknown_age: UnknownAgePolicy,
}

impl UnusedFilter {
    pub fn older_than(age: Duration) -> Self {
        Self {
            older_than: Some(age),
            unknown_age: UnknownAgePolicy::default(),
        }
    }

    pub fn with_unknown_age(mut self, policy: UnknownAgePolicy) -> Self {
        self.unknown_age = policy;
        self
    }

    pub(crate) fn admits(&self, record: &ToolchainRecord, now: OffsetDateTime) -> bool {
        if record.is_referenced() {
            return false;
        }
        let Some(min_age) = self.older_than else {
            return true;
        };
        match record.last_used_at() {
            // Timestamps in the future only pass a zero-age filter.
            Some(last_used) => match Duration::try_from(now - last_used) {
                Ok(age) => age >= min_age,
                Err(_) => min_age.is_zero(),
            },
            None => self.unknown_age == UnknownAgePolicy::Reclaim,
        }
    }
}

/// Aggregate numbers for display.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total_toolchains: usize,
    pub total_size_mb: f64,
    pub unused_toolchains: usize,
    pub reclaimable_size_mb: f64,
    pub last_cleanup: Option<String>,
}

/// Handle to `registry.json`. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Registry {
    path: PathBuf,
    toolchains_dir: PathBuf,
    locks: LockManager,
}

/// The registry lock plus the document loaded under it.
///
/// Changes are written by [`RegistryTransaction::commit`]; dropping the
/// transaction without committing discards them. The lock is released when
/// the transaction goes away either way.
#[derive(Debug)]
pub struct RegistryTransaction<'a> {
    registry: &'a Registry,
    document: RegistryDocument,
    _guard: LockGuard,
}

impl RegistryTransaction<'_> {
    pub fn document(&self) -> &RegistryDocument {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut RegistryDocument {
        &mut self.document
    }

    pub fn record(&self, toolchain_id: &str) -> Option<&ToolchainRecord> {
        self.document.toolchains.get(toolchain_id)
    }

    pub fn commit(mut self) -> Result<()> {
        self.document.recompute_total_size();
        self.registry.persist(&self.document)
    }
}

impl Registry {
    pub fn new(cache: &CacheDir, locks: LockManager) -> Self {
        Self {
            path: cache.registry_path(),
            toolchains_dir: cache.toolchains_dir(),
            locks,
        }
    }

    pub fn open(cache: &CacheDir) -> Self {
        Self::new(cache, LockManager::for_cache(cache))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Takes the registry lock and loads the current document.
    pub fn begin(&self) -> Result<RegistryTransaction<'_>> {
        let guard = self.locks.lock_registry()?;
        let document = self.load_locked()?;
        Ok(RegistryTransaction {
            registry: self,
            document,
            _guard: guard,
        })
    }

    /// Reads the document without taking the lock.
    ///
    /// The result may be stale by the time it is used; never base a write on it.
    pub fn snapshot(&self) -> Result<RegistryDocument> {
        match self.read_document()? {
            Loaded::Document(document) => Ok(document),
            Loaded::Missing => Ok(RegistryDocument::default()),
            // Repairing needs the lock.
            Loaded::Corrupt(_) => Ok(self.begin()?.document),
        }
    }

    /// Creates or replaces the record for `toolchain_id`.
    pub fn register(&self, toolchain_id: &str, registration: Registration) -> Result<()> {
        validate_toolchain_id(toolchain_id)?;
        let path = if registration.path.is_absolute() {
            registration.path
        } else {
            std::path::absolute(&registration.path)?
        };

        let mut txn = self.begin()?;
        let now = now_timestamp();
        let projects = match txn.document.toolchains.get(toolchain_id) {
            // Re-registering an install keeps the projects that still use it.
            Some(existing) => existing.projects.clone(),
            None => BTreeSet::new(),
        };
        txn.document.toolchains.insert(
            toolchain_id.to_owned(),
            ToolchainRecord {
                path: path.clone(),
                size_mb: registration.size_mb,
                projects,
                installed: now.clone(),
                last_used: now,
                hash: registration.hash,
                source_url: registration.source_url,
                verified: registration.verified,
            },
        );
        txn.commit()?;

        tracing::info!(
            target = "toolchainkit.cache",
            toolchain_id,
            path = %path.display(),
            size_mb = registration.size_mb,
            "registered toolchain"
        );
        Ok(())
    }

    /// Records that `project` uses `toolchain_id`; returns the new reference count.
    ///
    /// Adding an existing reference only refreshes `last_used`. A record whose
    /// install directory has disappeared is purged and reported as not cached.
    pub fn add_ref(&self, toolchain_id: &str, project: &Path) -> Result<usize> {
        let project = canonical_project_path(project)?;
        let mut txn = self.begin()?;
        let Some(record) = txn.document.toolchains.get_mut(toolchain_id) else {
            return Err(CacheError::ToolchainNotInCache {
                id: toolchain_id.to_owned(),
            });
        };

        if !record.path.exists() {
            tracing::warn!(
                target = "toolchainkit.cache",
                toolchain_id,
                path = %record.path.display(),
                "registry entry points at a missing install; purging it"
            );
            txn.document.toolchains.remove(toolchain_id);
            txn.commit()?;
            return Err(CacheError::ToolchainNotInCache {
                id: toolchain_id.to_owned(),
            });
        }

        record.projects.insert(project);
        record.last_used = now_timestamp();
        let count = record.ref_count();
        txn.commit()?;
        Ok(count)
    }

    /// Drops the reference from `project`.
    ///
    /// Returns the remaining count, or `None` when `toolchain_id` is unknown.
    pub fn remove_ref(&self, toolchain_id: &str, project: &Path) -> Result<Option<usize>> {
        let project = canonical_project_path(project)?;
        let mut txn = self.begin()?;
        let Some(record) = txn.document.toolchains.get_mut(toolchain_id) else {
            tracing::warn!(
                target = "toolchainkit.cache",
                toolchain_id,
                "cannot remove reference from unknown toolchain"
            );
            return Ok(None);
        };

        let removed = record.projects.remove(&project);
        let count = record.ref_count();
        if removed {
            txn.commit()?;
        }
        Ok(Some(count))
    }

    /// Number of projects referencing `toolchain_id`.
    pub fn ref_count(&self, toolchain_id: &str) -> Result<usize> {
        self.snapshot()?
            .toolchains
            .get(toolchain_id)
            .map(ToolchainRecord::ref_count)
            .ok_or_else(|| CacheError::ToolchainNotInCache {
                id: toolchain_id.to_owned(),
            })
    }

    /// Ids of zero-reference toolchains matching `filter`, sorted by id.
    pub fn unused_toolchains(&self, filter: &UnusedFilter) -> Result<Vec<String>> {
        let document = self.snapshot()?;
        let now = OffsetDateTime::now_utc();
        Ok(document
            .toolchains
            .iter()
            .filter(|(_, record)| filter.admits(record, now))
            .map(|(id, _)| id.clone())
            .collect())
    }

    /// Removes the record for `toolchain_id`. Does not touch the install directory.
    ///
    /// Fails with [`CacheError::ToolchainInUse`] (leaving the document untouched)
    /// while any project still references it. Unknown ids are a no-op.
    pub fn unregister(&self, toolchain_id: &str) -> Result<()> {
        let mut txn = self.begin()?;
        let Some(record) = txn.document.toolchains.get(toolchain_id) else {
            tracing::warn!(
                target = "toolchainkit.cache",
                toolchain_id,
                "cannot unregister unknown toolchain"
            );
            return Ok(());
        };
        if record.is_referenced() {
            return Err(CacheError::ToolchainInUse {
                id: toolchain_id.to_owned(),
                projects: record.projects.iter().cloned().collect(),
            });
        }

        txn.document.toolchains.remove(toolchain_id);
        txn.commit()?;
        tracing::info!(
            target = "toolchainkit.cache",
            toolchain_id,
            "unregistered toolchain"
        );
        Ok(())
    }

    pub fn get(&self, toolchain_id: &str) -> Result<Option<ToolchainRecord>> {
        Ok(self.snapshot()?.toolchains.remove(toolchain_id))
    }

    pub fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.snapshot()?.toolchains.into_keys().collect())
    }

    /// Refreshes `last_used` for `toolchain_id`.
    pub fn touch(&self, toolchain_id: &str) -> Result<()> {
        let mut txn = self.begin()?;
        let Some(record) = txn.document.toolchains.get_mut(toolchain_id) else {
            return Err(CacheError::ToolchainNotInCache {
                id: toolchain_id.to_owned(),
            });
        };
        record.last_used = now_timestamp();
        txn.commit()
    }

    pub fn mark_cleanup(&self) -> Result<()> {
        let mut txn = self.begin()?;
        txn.document.last_cleanup = Some(now_timestamp());
        txn.commit()
    }

    /// Purges records whose install directory no longer exists; returns their ids.
    pub fn prune_missing(&self) -> Result<Vec<String>> {
        let mut txn = self.begin()?;
        let missing: Vec<String> = txn
            .document
            .toolchains
            .iter()
            .filter(|(_, record)| !record.path.exists())
            .map(|(id, _)| id.clone())
            .collect();
        if missing.is_empty() {
            return Ok(missing);
        }
        for id in &missing {
            txn.document.toolchains.remove(id);
        }
        txn.commit()?;
        tracing::info!(
            target = "toolchainkit.cache",
            purged = missing.len(),
            "purged registry entries for missing installs"
        );
        Ok(missing)
    }

    pub fn stats(&self) -> Result<RegistryStats> {
        let document = self.snapshot()?;
        let unused = UnusedFilter::default();
        let now = OffsetDateTime::now_utc();
        let (unused_toolchains, reclaimable_size_mb) = document
            .toolchains
            .values()
            .filter(|record| unused.admits(record, now))
            .fold((0usize, 0.0f64), |(count, size), record| {
                (count + 1, size + record.size_mb)
            });
        Ok(RegistryStats {
            total_toolchains: document.toolchains.len(),
            total_size_mb: document.toolchains.values().map(|r| r.size_mb).sum(),
            unused_toolchains,
            reclaimable_size_mb,
            last_cleanup: document.last_cleanup,
        })
    }

    fn persist(&self, document: &RegistryDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        atomic_write(&self.path, &bytes).map_err(|err| self.registry_error(err.to_string()))
    }

    fn load_locked(&self) -> Result<RegistryDocument> {
        match self.read_document()? {
            Loaded::Document(document) => Ok(document),
            Loaded::Missing => Ok(RegistryDocument::default()),
            Loaded::Corrupt(reason) => self.rebuild(&reason),
        }
    }

    fn read_document(&self) -> Result<Loaded> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Loaded::Missing),
            Err(err) => return Err(self.registry_error(format!("failed to read: {err}"))),
        };

        let value: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => return Ok(Loaded::Corrupt(CacheError::from(err).to_string())),
        };
        let has_required_keys = value
            .as_object()
            .is_some_and(|object| object.contains_key("version") && object.contains_key("toolchains"));
        if !has_required_keys {
            return Ok(Loaded::Corrupt("missing required top-level keys".to_owned()));
        }

        let document: RegistryDocument = match serde_json::from_value(value) {
            Ok(document) => document,
            Err(err) => return Ok(Loaded::Corrupt(CacheError::from(err).to_string())),
        };
        if document.version > REGISTRY_FORMAT_VERSION {
            return Err(self.registry_error(format!(
                "format version {} is newer than supported version {REGISTRY_FORMAT_VERSION}",
                document.version
            )));
        }
        Ok(Loaded::Document(document))
    }

    /// Moves the unreadable document aside and rebuilds the index from disk.
    fn rebuild(&self, reason: &str) -> Result<RegistryDocument> {
        let quarantine = self.path.with_file_name(format!(
            "registry.json.corrupt-{}-{}",
            std::process::id(),
            now_millis()
        ));
        std::fs::rename(&self.path, &quarantine)
            .map_err(|err| self.registry_error(format!("failed to quarantine: {err}")))?;

        let document = rebuild_from_disk(&self.toolchains_dir)?;
        tracing::warn!(
            target = "toolchainkit.cache",
            path = %self.path.display(),
            quarantined = %quarantine.display(),
            reason,
            recovered = document.toolchains.len(),
            "registry was unreadable; rebuilt it from installed toolchains"
        );
        self.persist(&document)?;
        Ok(document)
    }

    fn registry_error(&self, message: String) -> CacheError {
        CacheError::Registry {
            path: self.path.clone(),
            message,
        }
    }
}

enum Loaded {
    Document(RegistryDocument),
    Missing,
    Corrupt(String),
}

/// One zero-reference record per non-empty, non-hidden directory in `toolchains_dir`.
///
/// `last_used` is set to now so a rebuild never makes installs immediately
/// eligible for age-based eviction.
fn rebuild_from_disk(toolchains_dir: &Path) -> Result<RegistryDocument> {
    let mut document = RegistryDocument::default();
    let entries = match std::fs::read_dir(toolchains_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(document),
        Err(err) => return Err(err.into()),
    };

    let now = now_timestamp();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if name.starts_with('.') || !entry.file_type()?.is_dir() || !is_non_empty_dir(&path) {
            continue;
        }

        let installed = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .map(|modified| format_timestamp(OffsetDateTime::from(modified)))
            .unwrap_or_default();
        document.toolchains.insert(
            name,
            ToolchainRecord {
                size_mb: dir_size_bytes(&path) as f64 / BYTES_PER_MB,
                path,
                projects: BTreeSet::new(),
                installed,
                last_used: now.clone(),
                hash: String::new(),
                source_url: String::new(),
                verified: false,
            },
        );
    }
    document.recompute_total_size();
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::format_description::well_known::Rfc3339;

    fn record(last_used: &str, projects: &[&str]) -> ToolchainRecord {
        ToolchainRecord {
            path: PathBuf::from("/cache/toolchains/x"),
            size_mb: 1.0,
            projects: projects.iter().map(PathBuf::from).collect(),
            installed: last_used.to_owned(),
            last_used: last_used.to_owned(),
            hash: String::new(),
            source_url: String::new(),
            verified: false,
        }
    }

    #[test]
    fn filter_excludes_referenced_records() {
        let now = OffsetDateTime::now_utc();
        let filter = UnusedFilter::default();
        assert!(filter.admits(&record("", &[]), now));
        assert!(!filter.admits(&record("", &["/p"]), now));
    }

    #[test]
    fn age_filter_compares_last_used() {
        let now = OffsetDateTime::now_utc();
        let old = (now - time::Duration::days(40)).format(&Rfc3339).unwrap();
        let fresh = (now - time::Duration::days(2)).format(&Rfc3339).unwrap();
        let filter = UnusedFilter::older_than(Duration::from_secs(30 * 24 * 3600));

        assert!(filter.admits(&record(&old, &[]), now));
        assert!(!filter.admits(&record(&fresh, &[]), now));
    }

    #[test]
    fn unknown_age_policy_is_explicit() {
        let now = OffsetDateTime::now_utc();
        let filter = UnusedFilter::older_than(Duration::from_secs(3600));
        assert!(filter.admits(&record("not a timestamp", &[]), now));
        assert!(filter.admits(&record("", &[]), now));

        let retain = filter.with_unknown_age(UnknownAgePolicy::Retain);
        assert!(!retain.admits(&record("not a timestamp", &[]), now));
    }

    #[test]
    fn document_serializes_with_documented_keys() {
        let mut document = RegistryDocument::default();
        document
            .toolchains
            .insert("llvm-18-linux-x64".into(), record("2024-01-01T00:00:00Z", &["/p"]));
        document.recompute_total_size();

        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["total_size_mb"], 1.0);
        assert!(value["last_cleanup"].is_null());
        let entry = &value["toolchains"]["llvm-18-linux-x64"];
        for key in [
            "path",
            "size_mb",
            "projects",
            "installed",
            "last_used",
            "hash",
            "source_url",
            "verified",
        ] {
            assert!(entry.get(key).is_some(), "missing {key}");
        }
        assert_eq!(entry["projects"], serde_json::json!(["/p"]));
    }
}
