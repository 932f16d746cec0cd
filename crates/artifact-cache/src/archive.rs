//! Gzipped tarballs of results directories

use crate::{Error, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

/// Default gzip level for new artifacts
pub const DEFAULT_COMPRESSION: u32 = 6;

/// Packs paths under a root into a `.tgz` stream and unpacks them back to
/// the same relative locations.
#[derive(Debug, Clone, Copy)]
pub struct TarGzArchiver {
    level: Compression,
}

impl Default for TarGzArchiver {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION)
    }
}

impl TarGzArchiver {
    /// Archiver using gzip `level` (0-9, clamped)
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    /// Write a tarball of `paths` to `writer`. Entries are named relative to
    /// `root`; symlinks are stored as links, not followed.
    ///
    /// # Errors
    ///
    /// Returns an `Archive` error if a path is missing or lies outside
    /// `root`, or if writing fails.
    pub fn create<W: Write>(&self, writer: W, root: &Path, paths: &[PathBuf]) -> Result<W> {
        let mut builder = tar::Builder::new(GzEncoder::new(writer, self.level));
        builder.follow_symlinks(false);

        for path in paths {
            let absolute = if path.is_absolute() {
                path.clone()
            } else {
                root.join(path)
            };
            let name = entry_name(root, &absolute)?;
            let metadata = absolute
                .symlink_metadata()
                .map_err(|e| Error::archive(format!("cannot archive missing path: {e}"), &absolute))?;

            let appended = if metadata.is_dir() {
                builder.append_dir_all(&name, &absolute)
            } else {
                builder.append_path_with_name(&absolute, &name)
            };
            appended.map_err(|e| Error::archive(format!("tar append failed: {e}"), &absolute))?;
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| Error::archive(format!("tar finalize failed: {e}"), root))?;
        encoder
            .finish()
            .map_err(|e| Error::archive(format!("gzip finish failed: {e}"), root))
    }

    /// Unpack a tarball read from `reader` under `dest`
    ///
    /// # Errors
    ///
    /// Returns an `Archive` error if the stream is not a valid tarball or an
    /// entry cannot be written.
    pub fn extract<R: Read>(&self, reader: R, dest: &Path) -> Result<()> {
        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        archive.set_overwrite(true);
        archive.set_preserve_permissions(true);
        archive
            .unpack(dest)
            .map_err(|e| Error::archive(format!("tar extract failed: {e}"), dest))
    }
}

/// Name of `path` inside an archive rooted at `root`
fn entry_name(root: &Path, path: &Path) -> Result<PathBuf> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| Error::archive(format!("path is not under {}", root.display()), path))?;
    if relative
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(Error::archive("path escapes the artifact root", path));
    }
    if relative.as_os_str().is_empty() {
        Ok(PathBuf::from("."))
    } else {
        Ok(relative.to_path_buf())
    }
}
