use crate::error::{DownloadError, Result};
use crate::hasher::{hash_file, verify_checksum, ExpectedHash, HashAlgorithm, StreamingHasher};
use crate::progress::{DownloadProgress, ProgressTracker};
use crate::transport::{sanitize_url, Transport, TransportError, TransportRequest, UreqTransport};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const CHUNK_BYTES: usize = 64 * 1024;

/// Suffix of the sidecar file that holds an in-flight (resumable) download.
pub const PARTIAL_SUFFIX: &str = ".part";

#[derive(Clone, Debug, PartialEq)]
pub struct DownloadOptions {
    /// Continue an interrupted download from its partial file.
    pub resume: bool,
    /// Connect/read timeout for each request.
    pub timeout: Duration,
    /// Total number of attempts before giving up.
    pub max_retries: u32,
    /// First backoff delay; doubles after every failed attempt.
    pub backoff_unit: Duration,
    /// Minimum spacing between progress callbacks.
    pub progress_interval: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            resume: true,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff_unit: Duration::from_secs(1),
            progress_interval: Duration::from_millis(500),
        }
    }
}

/// Blocking delay used between retries.
pub trait Sleep: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleep;

impl Sleep for ThreadSleep {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Resumable, retried, checksum-verified downloader.
///
/// Bytes are streamed into `<destination>.part` and hashed as they arrive. The
/// destination path only ever holds a complete file: the partial file is
/// renamed into place after the transfer finished and (when an expected hash
/// was supplied) verified. With resume enabled, a destination file that is not
/// a verified hit is moved back to the partial file and continued from its
/// length.
#[derive(Clone)]
pub struct Downloader {
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleep>,
    options: DownloadOptions,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::http()
    }
}

enum AttemptError {
    Transient(String),
    Fatal(DownloadError),
}

impl From<io::Error> for AttemptError {
    fn from(err: io::Error) -> Self {
        AttemptError::Fatal(DownloadError::Io(err))
    }
}

impl Downloader {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            sleeper: Arc::new(ThreadSleep),
            options: DownloadOptions::default(),
        }
    }

    pub fn http() -> Self {
        Self::new(Arc::new(UreqTransport::new()))
    }

    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleep>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    pub fn download(
        &self,
        url: &str,
        destination: &Path,
        expected: Option<&ExpectedHash>,
    ) -> Result<PathBuf> {
        self.download_with_progress(url, destination, expected, &mut |_: &DownloadProgress| {})
    }

    /// Downloads `url` to `destination`, returning the destination path.
    ///
    /// If `destination` already exists and matches `expected`, no request is made.
    pub fn download_with_progress(
        &self,
        url: &str,
        destination: &Path,
        expected: Option<&ExpectedHash>,
        progress: &mut dyn FnMut(&DownloadProgress),
    ) -> Result<PathBuf> {
        if url.trim().is_empty() {
            return Err(DownloadError::invalid_argument("url must not be empty"));
        }
        if destination.as_os_str().is_empty() {
            return Err(DownloadError::invalid_argument(
                "destination must not be empty",
            ));
        }
        let safe_url = sanitize_url(url);

        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let partial = partial_path(destination);
        let mut adopted_destination = false;
        if destination.is_file() {
            if let Some(expected) = expected {
                let actual = hash_file(destination, expected.algorithm())?;
                if expected.matches(&actual) {
                    tracing::debug!(
                        target = "toolchainkit.download",
                        url = %safe_url,
                        path = %destination.display(),
                        "destination already matches expected hash; skipping download"
                    );
                    return Ok(destination.to_path_buf());
                }
                tracing::debug!(
                    target = "toolchainkit.download",
                    path = %destination.display(),
                    expected = %expected,
                    found = %actual,
                    "existing file does not match expected hash"
                );
            }
            if self.options.resume && !partial.exists() {
                // Treat the unverified destination as the start of the transfer.
                tracing::info!(
                    target = "toolchainkit.download",
                    path = %destination.display(),
                    "resuming from existing destination file"
                );
                fs::rename(destination, &partial)?;
                adopted_destination = true;
            } else {
                fs::remove_file(destination)?;
            }
        }

        if !self.options.resume {
            remove_if_exists(&partial)?;
        }
        let unverified_partial = self.options.resume && !adopted_destination && partial.is_file();
        if let Some(expected) = expected.filter(|_| unverified_partial) {
            // A previous run may have finished the transfer without publishing it.
            if verify_checksum(&partial, expected)? {
                fs::rename(&partial, destination)?;
                return Ok(destination.to_path_buf());
            }
        }
        let algorithm = expected.map_or(HashAlgorithm::Sha256, ExpectedHash::algorithm);

        let attempts = self.options.max_retries.max(1);
        let mut last_error = String::new();
        let mut hasher = None;
        for attempt in 0..attempts {
            match self.fetch_once(url, &safe_url, &partial, algorithm, progress) {
                Ok(done) => {
                    hasher = Some(done);
                    break;
                }
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Transient(message)) => {
                    tracing::warn!(
                        target = "toolchainkit.download",
                        url = %safe_url,
                        attempt = attempt + 1,
                        attempts,
                        error = %message,
                        "download attempt failed"
                    );
                    last_error = message;
                    if attempt + 1 < attempts {
                        let delay = self
                            .options
                            .backoff_unit
                            .saturating_mul(2u32.saturating_pow(attempt));
                        self.sleeper.sleep(delay);
                    }
                }
            }
        }

        let Some(hasher) = hasher else {
            return Err(DownloadError::RetriesExhausted {
                url: safe_url,
                attempts,
                last_error,
            });
        };

        let bytes = hasher.bytes_hashed();
        let actual = hasher.finalize_hex();
        if let Some(expected) = expected {
            if !expected.matches(&actual) {
                remove_if_exists(&partial)?;
                tracing::warn!(
                    target = "toolchainkit.download",
                    url = %safe_url,
                    expected = %expected,
                    found = %actual,
                    "downloaded content failed checksum verification"
                );
                return Err(DownloadError::ChecksumMismatch {
                    path: destination.to_path_buf(),
                    expected: expected.to_string(),
                    found: format!("{}:{actual}", expected.algorithm()),
                });
            }
        }

        fs::rename(&partial, destination)?;
        tracing::info!(
            target = "toolchainkit.download",
            url = %safe_url,
            path = %destination.display(),
            bytes,
            "download complete"
        );
        Ok(destination.to_path_buf())
    }

    fn fetch_once(
        &self,
        url: &str,
        safe_url: &str,
        partial: &Path,
        algorithm: HashAlgorithm,
        progress: &mut dyn FnMut(&DownloadProgress),
    ) -> std::result::Result<StreamingHasher, AttemptError> {
        let mut restarted = false;
        loop {
            let mut hasher = StreamingHasher::new(algorithm);
            let mut resume_from = 0u64;
            if self.options.resume {
                match File::open(partial) {
                    Ok(existing) => resume_from = hasher.update_from_reader(existing)?,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }

            let request = TransportRequest {
                url,
                range_start: (resume_from > 0).then_some(resume_from),
                timeout: self.options.timeout,
            };
            let response = match self.transport.get(&request) {
                Ok(response) => response,
                Err(TransportError::Status { status: 416 }) if resume_from > 0 && !restarted => {
                    tracing::debug!(
                        target = "toolchainkit.download",
                        url = %safe_url,
                        resume_from,
                        "server rejected resume range; restarting from the beginning"
                    );
                    remove_if_exists(partial)?;
                    restarted = true;
                    continue;
                }
                Err(err) if err.is_transient() => return Err(AttemptError::Transient(err.to_string())),
                Err(TransportError::Status { status }) => {
                    return Err(AttemptError::Fatal(DownloadError::HttpStatus {
                        url: safe_url.to_owned(),
                        status,
                    }))
                }
                Err(err) => return Err(AttemptError::Transient(err.to_string())),
            };

            let mut file = if resume_from > 0 && response.status == 206 {
                tracing::debug!(
                    target = "toolchainkit.download",
                    url = %safe_url,
                    resume_from,
                    "resuming partial download"
                );
                OpenOptions::new().append(true).open(partial)?
            } else {
                if resume_from > 0 {
                    tracing::debug!(
                        target = "toolchainkit.download",
                        url = %safe_url,
                        status = response.status,
                        "server ignored range request; restarting from the beginning"
                    );
                    hasher = StreamingHasher::new(algorithm);
                    resume_from = 0;
                }
                File::create(partial)?
            };

            let total = response
                .content_length
                .map_or(0, |len| len.saturating_add(resume_from));
            let mut tracker =
                ProgressTracker::new(resume_from, total, self.options.progress_interval);
            let mut body = response.body;
            let mut buf = vec![0u8; CHUNK_BYTES];
            loop {
                let n = match body.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        file.flush()?;
                        return Err(AttemptError::Transient(format!(
                            "connection interrupted: {err}"
                        )));
                    }
                };
                file.write_all(&buf[..n])?;
                hasher.update(&buf[..n]);
                tracker.advance(n as u64, progress);
            }
            file.sync_all()?;

            if total > 0 && hasher.bytes_hashed() < total {
                return Err(AttemptError::Transient(format!(
                    "connection closed after {} of {total} bytes",
                    hasher.bytes_hashed()
                )));
            }

            tracker.finish(progress);
            return Ok(hasher);
        }
    }
}

/// Path of the sidecar file used while `destination` is being downloaded.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from("download"));
    name.push(PARTIAL_SUFFIX);
    destination.with_file_name(name)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
