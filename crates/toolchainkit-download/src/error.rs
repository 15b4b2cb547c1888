use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Errors produced by the download engine.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The caller passed an argument that can never succeed (empty URL, malformed hash, ...).
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The server answered with a status that retrying will not fix (e.g. 404).
    #[error("server returned status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("download of {url} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("checksum mismatch for {path}: expected {expected}, found {found}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

impl DownloadError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}
