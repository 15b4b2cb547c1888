use crate::error::{CacheError, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current time as an RFC 3339 UTC timestamp.
pub(crate) fn now_timestamp() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}

pub(crate) fn format_timestamp(at: OffsetDateTime) -> String {
    // Formatting a UTC `OffsetDateTime` as RFC 3339 only fails for years outside 0..=9999.
    at.format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// Parses an ISO 8601 timestamp; values without an offset are read as UTC.
pub(crate) fn parse_timestamp(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    OffsetDateTime::parse(value, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(&format!("{value}Z"), &Rfc3339))
        .ok()
}

/// Writes `bytes` to a unique temp file next to `path`, syncs it, then renames it over `path`.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        Some(_) => Path::new("."),
        None => return Err(io::Error::other("path has no parent").into()),
    };
    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let written = file.write_all(bytes).and_then(|()| file.sync_all());
    drop(file);
    if let Err(err) = written {
        remove_file_best_effort(&tmp_path, "atomic_write.write_failed");
        return Err(err.into());
    }

    if let Err(err) = rename_replacing(&tmp_path, path) {
        remove_file_best_effort(&tmp_path, "atomic_write.rename_failed");
        return Err(err.into());
    }
    sync_dir_best_effort(parent);
    Ok(())
}

fn rename_replacing(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        // `rename` does not replace an existing file on Windows.
        Err(err) if cfg!(windows) && to.exists() => {
            fs::remove_file(to)?;
            fs::rename(from, to).map_err(|_| err)
        }
        Err(err) => Err(err),
    }
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(".tmp.{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(err) = fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            tracing::debug!(
                target = "toolchainkit.cache",
                dir = %dir.display(),
                error = %err,
                "failed to sync directory (best effort)"
            );
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::debug!(
            target = "toolchainkit.cache",
            path = %path.display(),
            reason,
            error = %err,
            "failed to remove file"
        ),
    }
}

/// Resolves `project` to the absolute path used as its reference key.
///
/// Existing directories are canonicalized (symlinks resolved); paths that do not
/// exist yet are made absolute and normalized lexically.
pub fn canonical_project_path(project: &Path) -> Result<PathBuf> {
    if project.as_os_str().is_empty() {
        return Err(CacheError::invalid_argument("project path must not be empty"));
    }
    match fs::canonicalize(project) {
        Ok(path) => Ok(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Ok(normalize_lexically(&std::path::absolute(project)?))
        }
        Err(err) => Err(err.into()),
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Sum of file sizes under `root`, without following symlinks.
pub(crate) fn dir_size_bytes(root: &Path) -> u64 {
    walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::debug!(
                    target = "toolchainkit.cache",
                    path = ?err.path(),
                    error = %err,
                    "failed to walk directory while computing size"
                );
                None
            }
        })
        .filter(|entry| !entry.file_type().is_dir())
        .filter_map(|entry| entry.path().symlink_metadata().ok())
        .fold(0u64, |total, meta| total.saturating_add(meta.len()))
}

/// Whether `path` is a directory with at least one entry.
pub(crate) fn is_non_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Deletes the directory tree at `path`, refusing anything not strictly inside `root`.
///
/// The tree is first renamed to a hidden sibling so a concurrent reader never
/// sees a half-deleted install under its real name.
pub(crate) fn remove_dir_under(root: &Path, path: &Path) -> Result<()> {
    let resolved = fs::canonicalize(path)?;
    let root = fs::canonicalize(root)?;
    if resolved == root || resolved.strip_prefix(&root).is_err() {
        return Err(CacheError::PathNotUnderCacheRoot {
            path: path.to_path_buf(),
            cache_root: root,
        });
    }

    let name = resolved
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = resolved.parent().unwrap_or(&root);
    let trash = unique_hidden_sibling(parent, &name, "trash");
    let target = match fs::rename(&resolved, &trash) {
        Ok(()) => trash,
        Err(err) => {
            tracing::debug!(
                target = "toolchainkit.cache",
                path = %resolved.display(),
                error = %err,
                "failed to move directory aside; deleting in place"
            );
            resolved
        }
    };
    remove_tree_nofollow(&target)
}

fn remove_tree_nofollow(path: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(path)
        .follow_links(false)
        .contents_first(true)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                continue
            }
            Err(err) => return Err(err.into()),
        };
        let result = if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// A not-yet-existing `.<name>.<suffix>-<pid>-<millis>-<n>` path in `parent`.
pub(crate) fn unique_hidden_sibling(parent: &Path, name: &str, suffix: &str) -> PathBuf {
    let pid = std::process::id();
    let ts = now_millis();
    let mut attempt = 0u32;
    loop {
        let candidate = parent.join(format!(".{name}.{suffix}-{pid}-{ts}-{attempt}"));
        if !candidate.exists() || attempt == u32::MAX {
            return candidate;
        }
        attempt += 1;
    }
}
