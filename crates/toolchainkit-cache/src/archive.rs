use crate::error::{CacheError, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];
const BZIP2_MAGIC: [u8; 3] = [b'B', b'Z', b'h'];
const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];
const EMPTY_ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x05, 0x06];

/// Toolchain archive formats that can be installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarZst,
    TarXz,
    TarBz2,
    Tar,
    Zip,
}

impl ArchiveFormat {
    /// Picks the format from a file name or URL path.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            Some(Self::TarZst)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(Self::TarXz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".tbz") {
            Some(Self::TarBz2)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }

    /// Falls back to sniffing the compression magic when the name says nothing.
    pub fn detect(path: &Path) -> io::Result<Self> {
        let by_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::from_name);
        if let Some(format) = by_name {
            return Ok(format);
        }

        let mut magic = [0u8; 6];
        let mut file = File::open(path)?;
        let mut read = 0;
        while read < magic.len() {
            match file.read(&mut magic[read..])? {
                0 => break,
                n => read += n,
            }
        }
        Ok(Self::sniff(&magic[..read]))
    }

    fn sniff(magic: &[u8]) -> Self {
        if magic.starts_with(&GZIP_MAGIC) {
            Self::TarGz
        } else if magic.starts_with(&ZSTD_MAGIC) {
            Self::TarZst
        } else if magic.starts_with(&XZ_MAGIC) {
            Self::TarXz
        } else if magic.starts_with(&BZIP2_MAGIC) {
            Self::TarBz2
        } else if magic.starts_with(&ZIP_MAGIC) || magic.starts_with(&EMPTY_ZIP_MAGIC) {
            Self::Zip
        } else {
            Self::Tar
        }
    }
}

/// Unpacks `archive` into `dest`, which must already exist.
///
/// Entries with absolute paths or `..` components fail the whole extraction,
/// whatever the format; the caller is expected to discard `dest` in that case.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<ArchiveFormat> {
    let format = ArchiveFormat::detect(archive)?;
    let file = BufReader::new(File::open(archive)?);
    match format {
        ArchiveFormat::TarGz => unpack(archive, flate2::read::GzDecoder::new(file), dest)?,
        ArchiveFormat::TarZst => unpack(archive, zstd::Decoder::with_buffer(file)?, dest)?,
        ArchiveFormat::TarXz => unpack(archive, xz2::read::XzDecoder::new(file), dest)?,
        ArchiveFormat::TarBz2 => unpack(archive, bzip2::read::BzDecoder::new(file), dest)?,
        ArchiveFormat::Tar => unpack(archive, file, dest)?,
        ArchiveFormat::Zip => unpack_zip(archive, dest)?,
    }
    tracing::debug!(
        target = "toolchainkit.cache",
        archive = %archive.display(),
        dest = %dest.display(),
        ?format,
        "extracted archive"
    );
    Ok(format)
}

fn unpack(archive_path: &Path, reader: impl Read, dest: &Path) -> Result<()> {
    let archive_error = |message: String| CacheError::Archive {
        path: archive_path.to_path_buf(),
        message,
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let entries = archive
        .entries()
        .map_err(|err| archive_error(err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| archive_error(err.to_string()))?;
        let entry_path = entry
            .path()
            .map_err(|err| archive_error(err.to_string()))?
            .into_owned();
        validate_entry_path(&entry_path).map_err(archive_error)?;

        let unpacked = entry
            .unpack_in(dest)
            .map_err(|err| archive_error(format!("{}: {err}", entry_path.display())))?;
        if !unpacked {
            return Err(archive_error(format!(
                "entry {} escapes the destination",
                entry_path.display()
            )));
        }
    }
    Ok(())
}

fn unpack_zip(archive_path: &Path, dest: &Path) -> Result<()> {
    let archive_error = |message: String| CacheError::Archive {
        path: archive_path.to_path_buf(),
        message,
    };

    let mut archive = zip::ZipArchive::new(File::open(archive_path)?)
        .map_err(|err| archive_error(err.to_string()))?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| archive_error(err.to_string()))?;
        let name = entry.name().replace('\\', "/");
        validate_entry_path(Path::new(&name)).map_err(archive_error)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(archive_error(format!("entry {name} escapes the destination")));
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)
            .map_err(|err| archive_error(format!("{name}: {err}")))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }
    Ok(())
}

fn validate_entry_path(path: &Path) -> std::result::Result<(), String> {
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(format!("entry {} has an unsafe path", path.display())),
        }
    }
    Ok(())
}

/// The directory that holds the toolchain inside an extraction directory.
///
/// Archives usually wrap everything in one top-level folder; in that case the
/// folder itself is the install root.
pub(crate) fn install_root(extracted: &Path) -> io::Result<PathBuf> {
    let mut entries = fs::read_dir(extracted)?;
    let (Some(first), None) = (entries.next().transpose()?, entries.next()) else {
        return Ok(extracted.to_path_buf());
    };
    if first.file_type()?.is_dir() {
        Ok(first.path())
    } else {
        Ok(extracted.to_path_buf())
    }
}
