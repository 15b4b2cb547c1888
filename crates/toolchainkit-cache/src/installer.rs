use crate::archive::{extract_archive, install_root};
use crate::cache_dir::CacheDir;
use crate::coordinator::{is_installed, Coordination, CoordinatorOptions, DownloadCoordinator};
use crate::error::{CacheError, Result};
use crate::lock::LockManager;
use crate::registry::{Registration, Registry};
use crate::util::{dir_size_bytes, is_non_empty_dir, remove_file_best_effort};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use toolchainkit_download::{
    hash_file, sanitize_url, DownloadProgress, Downloader, ExpectedHash, HashAlgorithm,
};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// A resolved toolchain download: where it comes from and what it should hash to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolchainSource {
    pub name: String,
    pub version: String,
    pub platform: String,
    pub url: String,
    /// Expected SHA-256 of the archive (`<hex>` or `sha256:<hex>`).
    pub sha256: Option<String>,
}

impl ToolchainSource {
    /// `<name>-<version>-<platform>`, e.g. `llvm-18.1.8-linux-x64`.
    pub fn toolchain_id(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.platform)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallPhase {
    Downloading,
    Extracting,
    Complete,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstallProgress {
    pub phase: InstallPhase,
    /// Overall progress: downloading covers 0..50, extracting 50..100.
    pub percentage: f64,
    pub message: String,
    pub download: Option<DownloadProgress>,
}

impl InstallProgress {
    fn new(phase: InstallPhase, percentage: f64, message: String) -> Self {
        Self {
            phase,
            percentage,
            message,
            download: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallOutcome {
    pub toolchain_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// The install directory already existed; nothing was downloaded.
    pub was_cached: bool,
    pub download_time: Duration,
    pub extraction_time: Duration,
}

/// Downloads, extracts, and registers toolchains in the shared cache.
pub struct ToolchainInstaller {
    cache: CacheDir,
    registry: Registry,
    coordinator: DownloadCoordinator,
    downloader: Downloader,
}

impl ToolchainInstaller {
    pub fn new(cache: CacheDir, downloader: Downloader) -> Self {
        let locks = LockManager::for_cache(&cache);
        Self {
            registry: Registry::new(&cache, locks.clone()),
            coordinator: DownloadCoordinator::new(locks),
            cache,
            downloader,
        }
    }

    pub fn with_coordinator_options(mut self, options: CoordinatorOptions) -> Self {
        self.coordinator = self.coordinator.with_options(options);
        self
    }

    pub fn cache(&self) -> &CacheDir {
        &self.cache
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Makes `source` available in the cache and, if given, records `project` as a user.
    ///
    /// Only one caller per toolchain id downloads at a time; the others wait
    /// and reuse its result.
    pub fn install(
        &self,
        source: &ToolchainSource,
        project: Option<&Path>,
        progress: &mut dyn FnMut(&InstallProgress),
    ) -> Result<InstallOutcome> {
        let toolchain_id = source.toolchain_id();
        let dest = self.cache.toolchain_path(&toolchain_id)?;
        let expected = source
            .sha256
            .as_deref()
            .map(ExpectedHash::parse)
            .transpose()?;

        let outcome = loop {
            match self.coordinator.coordinate(&toolchain_id, &dest)? {
                Coordination::Ready => {
                    let outcome = self.reuse_installed(source, &toolchain_id, &dest)?;
                    match self.record_use(&toolchain_id, project) {
                        Ok(()) => break outcome,
                        // Evicted between the check and the reference; install it again.
                        Err(CacheError::ToolchainNotInCache { .. }) if !is_installed(&dest) => {
                            continue
                        }
                        Err(err) => return Err(err),
                    }
                }
                Coordination::Download(permit) => {
                    let outcome = self.download_and_extract(
                        source,
                        &toolchain_id,
                        &dest,
                        expected.as_ref(),
                        progress,
                    )?;
                    // Referenced before the permit goes, so cleanup cannot race the install.
                    self.record_use(&toolchain_id, project)?;
                    drop(permit);
                    break outcome;
                }
            }
        };

        progress(&InstallProgress::new(
            InstallPhase::Complete,
            100.0,
            format!("{toolchain_id} is ready"),
        ));
        Ok(outcome)
    }

    fn record_use(&self, toolchain_id: &str, project: Option<&Path>) -> Result<()> {
        match project {
            Some(project) => self.registry.add_ref(toolchain_id, project).map(drop),
            None => self.registry.touch(toolchain_id),
        }
    }

    /// The install directory exists; make sure the registry knows about it.
    fn reuse_installed(
        &self,
        source: &ToolchainSource,
        toolchain_id: &str,
        dest: &Path,
    ) -> Result<InstallOutcome> {
        let size_bytes = dir_size_bytes(dest);
        if self.registry.get(toolchain_id)?.is_none() {
            tracing::info!(
                target = "toolchainkit.cache",
                toolchain_id,
                path = %dest.display(),
                "adopting installed toolchain missing from the registry"
            );
            self.registry.register(
                toolchain_id,
                Registration {
                    path: dest.to_path_buf(),
                    size_mb: size_bytes as f64 / BYTES_PER_MIB,
                    hash: String::new(),
                    source_url: sanitize_url(&source.url),
                    verified: false,
                },
            )?;
        }

        Ok(InstallOutcome {
            toolchain_id: toolchain_id.to_owned(),
            path: dest.to_path_buf(),
            size_bytes,
            was_cached: true,
            download_time: Duration::ZERO,
            extraction_time: Duration::ZERO,
        })
    }

    /// Must only run while holding the toolchain's download permit.
    fn download_and_extract(
        &self,
        source: &ToolchainSource,
        toolchain_id: &str,
        dest: &Path,
        expected: Option<&ExpectedHash>,
        progress: &mut dyn FnMut(&InstallProgress),
    ) -> Result<InstallOutcome> {
        let archive = self
            .cache
            .downloads_dir()
            .join(format!("{toolchain_id}-{}", archive_file_name(&source.url)));

        progress(&InstallProgress::new(
            InstallPhase::Downloading,
            0.0,
            format!("Downloading {toolchain_id}"),
        ));
        let started = Instant::now();
        self.downloader.download_with_progress(
            &source.url,
            &archive,
            expected,
            &mut |download: &DownloadProgress| {
                progress(&InstallProgress {
                    phase: InstallPhase::Downloading,
                    percentage: download.percentage / 2.0,
                    message: format!("Downloading {toolchain_id}: {download}"),
                    download: Some(download.clone()),
                })
            },
        )?;
        let download_time = started.elapsed();
        let hash = format!(
            "{}:{}",
            HashAlgorithm::Sha256,
            hash_file(&archive, HashAlgorithm::Sha256)?
        );

        progress(&InstallProgress::new(
            InstallPhase::Extracting,
            50.0,
            format!("Extracting {toolchain_id}"),
        ));
        let started = Instant::now();
        let extracted = self.extract_into_place(&archive, dest);
        remove_file_best_effort(&archive, "installer.archive_consumed");
        extracted?;
        let extraction_time = started.elapsed();

        let size_bytes = dir_size_bytes(dest);
        self.registry.register(
            toolchain_id,
            Registration {
                path: dest.to_path_buf(),
                size_mb: size_bytes as f64 / BYTES_PER_MIB,
                hash,
                source_url: sanitize_url(&source.url),
                verified: expected.is_some(),
            },
        )?;

        tracing::info!(
            target = "toolchainkit.cache",
            toolchain_id,
            path = %dest.display(),
            size_bytes,
            download_ms = download_time.as_millis() as u64,
            extraction_ms = extraction_time.as_millis() as u64,
            "installed toolchain"
        );
        Ok(InstallOutcome {
            toolchain_id: toolchain_id.to_owned(),
            path: dest.to_path_buf(),
            size_bytes,
            was_cached: false,
            download_time,
            extraction_time,
        })
    }

    /// Extracts next to `dest` and publishes the result with a single rename.
    fn extract_into_place(&self, archive: &Path, dest: &Path) -> Result<()> {
        // Dot-prefixed so registry rebuilds never mistake it for an install.
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(self.cache.toolchains_dir())?;
        extract_archive(archive, staging.path())?;

        let root = install_root(staging.path())?;
        if !is_non_empty_dir(&root) {
            return Err(CacheError::Archive {
                path: archive.to_path_buf(),
                message: "archive contains no files".to_owned(),
            });
        }

        // A leftover empty directory would make the rename fail.
        if dest.is_dir() {
            fs::remove_dir(dest)?;
        }
        fs::rename(&root, dest)?;
        Ok(())
    }
}

/// Last path segment of `url`, without query or fragment.
fn archive_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() && name != "." && name != ".." => name.to_owned(),
        _ => "archive".to_owned(),
    }
}
