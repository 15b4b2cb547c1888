//! Robust artifact downloads for the toolchain cache.
//!
//! - [`StreamingHasher`]: incremental SHA-256/SHA-512 hashing
//! - [`Downloader`]: resumable, retried, checksum-verified fetches with
//!   throttled [`DownloadProgress`] reports
//! - [`Transport`]: the seam between the engine and the network
//!   ([`UreqTransport`] in production, in-memory fakes in tests)
//!
//! In-flight bytes live in `<destination>.part`; the destination itself only
//! ever holds a complete (and, when a hash was supplied, verified) file.

mod engine;
mod error;
mod hasher;
mod progress;
mod transport;

pub use engine::{
    partial_path, DownloadOptions, Downloader, Sleep, ThreadSleep, PARTIAL_SUFFIX,
};
pub use error::{DownloadError, Result};
pub use hasher::{hash_file, verify_checksum, ExpectedHash, HashAlgorithm, StreamingHasher};
pub use progress::DownloadProgress;
pub use transport::{
    sanitize_url, Transport, TransportError, TransportRequest, TransportResponse, UreqTransport,
};
