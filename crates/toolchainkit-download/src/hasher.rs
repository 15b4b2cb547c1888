use crate::error::{DownloadError, Result};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Digest algorithms accepted for artifact verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Prefix used in `<algorithm>:<hex>` strings.
    pub fn prefix(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Length of the lowercase hex digest.
    pub fn hex_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Clone)]
enum HasherState {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Incremental content hasher.
///
/// Bytes are fed as they arrive; the digest of everything seen so far can be
/// read at any point with [`StreamingHasher::hex_digest`] without consuming the
/// hasher, so memory use is independent of the size of the hashed content.
#[derive(Clone)]
pub struct StreamingHasher {
    algorithm: HashAlgorithm,
    state: HasherState,
    bytes_hashed: u64,
}

impl StreamingHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
        };
        Self {
            algorithm,
            state,
            bytes_hashed: 0,
        }
    }

    pub fn sha256() -> Self {
        Self::new(HashAlgorithm::Sha256)
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(hasher) => hasher.update(bytes),
            HasherState::Sha512(hasher) => hasher.update(bytes),
        }
        self.bytes_hashed = self.bytes_hashed.saturating_add(bytes.len() as u64);
    }

    /// Feeds everything `reader` yields into the hasher, returning the number of bytes read.
    pub fn update_from_reader(&mut self, mut reader: impl Read) -> io::Result<u64> {
        let mut buf = vec![0u8; READ_BUFFER_BYTES];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            self.update(&buf[..n]);
            total = total.saturating_add(n as u64);
        }
        Ok(total)
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    /// Lowercase hex digest of the bytes hashed so far.
    pub fn hex_digest(&self) -> String {
        match &self.state {
            HasherState::Sha256(hasher) => hex::encode(hasher.clone().finalize()),
            HasherState::Sha512(hasher) => hex::encode(hasher.clone().finalize()),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self.state {
            HasherState::Sha256(hasher) => hex::encode(hasher.finalize()),
            HasherState::Sha512(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

impl fmt::Debug for StreamingHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingHasher")
            .field("algorithm", &self.algorithm)
            .field("bytes_hashed", &self.bytes_hashed)
            .finish()
    }
}

/// A digest the downloaded content must match.
///
/// Accepts either `<algorithm>:<hex>` or bare hex (assumed SHA-256). Comparison
/// is case-insensitive.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExpectedHash {
    algorithm: HashAlgorithm,
    hex: String,
}

impl ExpectedHash {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (algorithm, hex) = match value.split_once(':') {
            Some((prefix, hex)) => {
                let algorithm = HashAlgorithm::from_prefix(prefix).ok_or_else(|| {
                    DownloadError::invalid_argument(format!(
                        "unsupported hash algorithm {prefix:?}"
                    ))
                })?;
                (algorithm, hex)
            }
            None => (HashAlgorithm::Sha256, value),
        };

        if hex.len() != algorithm.hex_len() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DownloadError::invalid_argument(format!(
                "expected a {}-character {algorithm} hex digest",
                algorithm.hex_len()
            )));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn matches(&self, actual_hex: &str) -> bool {
        self.hex.eq_ignore_ascii_case(actual_hex.trim())
    }
}

impl fmt::Display for ExpectedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl std::str::FromStr for ExpectedHash {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Hashes the file at `path` in fixed-size chunks.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> io::Result<String> {
    let file = File::open(path)?;
    let mut hasher = StreamingHasher::new(algorithm);
    hasher.update_from_reader(file)?;
    Ok(hasher.finalize_hex())
}

pub fn verify_checksum(path: &Path, expected: &ExpectedHash) -> io::Result<bool> {
    let actual = hash_file(path, expected.algorithm())?;
    Ok(expected.matches(&actual))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn empty_input_has_well_known_digest() {
        assert_eq!(StreamingHasher::sha256().finalize_hex(), EMPTY_SHA256);
    }

    #[test]
    fn chunked_updates_match_single_update() {
        let mut chunked = StreamingHasher::sha256();
        chunked.update(b"he");
        chunked.update(b"");
        chunked.update(b"llo");

        assert_eq!(chunked.bytes_hashed(), 5);
        assert_eq!(chunked.hex_digest(), HELLO_SHA256);
    }

    #[test]
    fn hex_digest_does_not_consume_state() {
        let mut hasher = StreamingHasher::sha256();
        hasher.update(b"hel");
        let partial = hasher.hex_digest();
        hasher.update(b"lo");

        assert_ne!(partial, HELLO_SHA256);
        assert_eq!(hasher.finalize_hex(), HELLO_SHA256);
    }

    #[test]
    fn sha512_digest_has_expected_length() {
        let mut hasher = StreamingHasher::new(HashAlgorithm::Sha512);
        hasher.update(b"hello");
        assert_eq!(hasher.finalize_hex().len(), 128);
    }

    #[test]
    fn expected_hash_accepts_prefix_and_mixed_case() {
        let upper = HELLO_SHA256.to_ascii_uppercase();
        let parsed = ExpectedHash::parse(&format!("SHA256:{upper}")).unwrap();
        assert_eq!(parsed.algorithm(), HashAlgorithm::Sha256);
        assert_eq!(parsed.hex(), HELLO_SHA256);
        assert!(parsed.matches(HELLO_SHA256));
        assert_eq!(parsed.to_string(), format!("sha256:{HELLO_SHA256}"));

        let bare = ExpectedHash::parse(HELLO_SHA256).unwrap();
        assert_eq!(bare, parsed);
    }

    #[test]
    fn expected_hash_rejects_malformed_values() {
        for bad in ["", "abc", "md5:d41d8cd98f00b204e9800998ecf8427e", "sha256:zz"] {
            assert!(
                matches!(
                    ExpectedHash::parse(bad),
                    Err(DownloadError::InvalidArgument { .. })
                ),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn verify_checksum_reads_file_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        let good = ExpectedHash::parse(HELLO_SHA256).unwrap();
        let bad = ExpectedHash::parse(EMPTY_SHA256).unwrap();
        assert!(verify_checksum(&path, &good).unwrap());
        assert!(!verify_checksum(&path, &bad).unwrap());
    }
}
