use std::path::PathBuf;
use std::time::Duration;

use toolchainkit_download::DownloadError;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the toolchain cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {message}")]
    Json { message: String },

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Another process (or thread) held the lock for the whole timeout.
    #[error("timed out after {timeout:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("registry {path} is unusable: {message}")]
    Registry { path: PathBuf, message: String },

    #[error("toolchain {id} is not in the cache")]
    ToolchainNotInCache { id: String },

    #[error("toolchain {id} is still used by {} project(s)", .projects.len())]
    ToolchainInUse { id: String, projects: Vec<PathBuf> },

    #[error("timed out after {waited:?} waiting for another process to install {id}")]
    CoordinatorTimeout { id: String, waited: Duration },

    #[error("path {path} is not under cache root {cache_root}")]
    PathNotUnderCacheRoot { path: PathBuf, cache_root: PathBuf },

    #[error("archive {path} could not be extracted: {message}")]
    Archive { path: PathBuf, message: String },

    #[error(transparent)]
    Download(#[from] DownloadError),
}

impl CacheError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Whether retrying later can succeed without any caller-side change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::LockTimeout { .. } | CacheError::CoordinatorTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        // Registry documents embed user project paths; report only the error
        // class and position instead of serde's message, which quotes values.
        let class = match err.classify() {
            serde_json::error::Category::Io => "io failure",
            serde_json::error::Category::Syntax => "syntax error",
            serde_json::error::Category::Data => "unexpected data",
            serde_json::error::Category::Eof => "unexpected end of input",
        };
        Self::Json {
            message: format!("{class} at line {} column {}", err.line(), err.column()),
        }
    }
}
