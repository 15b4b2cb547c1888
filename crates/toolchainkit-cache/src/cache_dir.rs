use crate::error::{CacheError, Result};
use std::path::{Path, PathBuf};

/// Environment variable that overrides the machine-wide cache root.
pub const CACHE_DIR_ENV: &str = "TOOLCHAINKIT_CACHE_DIR";

/// Name of the hidden per-project state directory.
pub const PROJECT_STATE_DIR: &str = ".toolchainkit";

const TOOLCHAINS_DIR: &str = "toolchains";
const DOWNLOADS_DIR: &str = "downloads";
const LOCK_DIR: &str = "lock";
const REGISTRY_FILE: &str = "registry.json";

/// Configuration for selecting the on-disk cache root.
#[derive(Clone, Debug, Default)]
pub struct CacheConfig {
    /// Use this directory instead of `~/.toolchainkit`.
    pub cache_root_override: Option<PathBuf>,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            cache_root_override: std::env::var_os(CACHE_DIR_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
        }
    }
}

/// The machine-wide cache root and its fixed layout.
///
/// ```text
/// <root>/
///   toolchains/<id>/   extracted installs
///   downloads/         archives being fetched
///   lock/              registry and per-toolchain lock files
///   registry.json
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    /// Resolves the root once and creates the layout.
    pub fn new(config: CacheConfig) -> Result<Self> {
        let root = match config.cache_root_override {
            Some(root) => root,
            None => default_cache_root()?,
        };
        Self::at(root)
    }

    pub fn at(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root.join(TOOLCHAINS_DIR))?;
        std::fs::create_dir_all(root.join(DOWNLOADS_DIR))?;
        std::fs::create_dir_all(root.join(LOCK_DIR))?;

        // Deletion safety checks compare against this, so it must be the real path.
        let root = std::fs::canonicalize(root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn toolchains_dir(&self) -> PathBuf {
        self.root.join(TOOLCHAINS_DIR)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join(DOWNLOADS_DIR)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(LOCK_DIR)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    /// Install directory for `toolchain_id`.
    pub fn toolchain_path(&self, toolchain_id: &str) -> Result<PathBuf> {
        validate_toolchain_id(toolchain_id)?;
        Ok(self.toolchains_dir().join(toolchain_id))
    }
}

/// Creates (if needed) and returns `<project>/.toolchainkit`.
pub fn ensure_project_state_dir(project: &Path) -> Result<PathBuf> {
    let dir = project.join(PROJECT_STATE_DIR);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Rejects ids that could escape `toolchains/` or collide with internal entries.
pub(crate) fn validate_toolchain_id(toolchain_id: &str) -> Result<()> {
    if toolchain_id.trim().is_empty() {
        return Err(CacheError::invalid_argument("toolchain id must not be empty"));
    }
    if toolchain_id.starts_with('.')
        || toolchain_id.contains(['/', '\\'])
        || toolchain_id.contains("..")
    {
        return Err(CacheError::invalid_argument(format!(
            "toolchain id {toolchain_id:?} is not a plain directory name"
        )));
    }
    Ok(())
}

pub(crate) fn default_cache_root() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(PROJECT_STATE_DIR))
}
