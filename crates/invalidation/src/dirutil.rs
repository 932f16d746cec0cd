//! Filesystem helpers for results directories

use crate::{Error, Result};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[cfg(unix)]
use std::os::unix::fs::symlink;
#[cfg(windows)]
use std::os::windows::fs::symlink_dir as symlink;

/// What occupied a link path before [`relative_symlink`] replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replaced {
    /// The path did not exist
    Nothing,
    /// A symlink (possibly dangling)
    Symlink,
    /// A regular file
    File,
    /// A real directory, removed recursively
    Directory,
}

/// True if `path` exists without following a final symlink.
#[must_use]
pub fn lexists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// True if `path` is a directory and not a symlink to one.
#[must_use]
pub fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.is_dir())
}

/// Remove `path` whatever it is. A symlink is unlinked, never followed.
/// A missing path is not an error.
///
/// # Errors
///
/// Returns an error if the path exists but cannot be removed.
pub fn safe_rmtree(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(e, path, "stat")),
    };
    let removed = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        remove_link_or_file(path)
    };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(e, path, "remove")),
    }
}

#[cfg(unix)]
fn remove_link_or_file(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

#[cfg(windows)]
fn remove_link_or_file(path: &Path) -> io::Result<()> {
    // Directory symlinks must be removed with remove_dir on Windows
    fs::remove_file(path).or_else(|_| fs::remove_dir(path))
}

/// Remove `path` and recreate it as an empty directory, parents included.
///
/// # Errors
///
/// Returns an error if the path cannot be removed or created.
pub fn safe_mkdir_clean(path: &Path) -> Result<()> {
    safe_rmtree(path)?;
    fs::create_dir_all(path).map_err(|e| Error::io(e, path, "create directory"))
}

/// Point `link` at `target` with a relative symlink, replacing whatever is
/// at `link`.
///
/// The link is created under a temporary name in the same directory and
/// renamed into place, so readers see either the old or the new link.
/// A real directory cannot be renamed over and is removed first.
///
/// # Errors
///
/// Returns an error if the parent cannot be created or the link cannot be
/// created or renamed.
pub fn relative_symlink(target: &Path, link: &Path) -> Result<Replaced> {
    let parent = link
        .parent()
        .ok_or_else(|| Error::configuration(format!("{} has no parent", link.display())))?;
    fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create directory"))?;

    let replaced = match fs::symlink_metadata(link) {
        Err(_) => Replaced::Nothing,
        Ok(meta) if meta.file_type().is_symlink() => Replaced::Symlink,
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(link).map_err(|e| Error::io(e, link, "remove directory"))?;
            Replaced::Directory
        }
        Ok(_) => Replaced::File,
    };

    let relative = relative_path(target, parent);
    let file_name = link
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staged = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".tmp")
        .make_in(parent, |temp| symlink(&relative, temp))
        .map_err(|e| Error::io(e, parent, "symlink"))?;
    // A failed rename drops the staged link
    staged
        .persist(link)
        .map_err(|e| Error::io(e.error, link, "rename symlink"))?;
    debug!(link = %link.display(), target = %relative.display(), ?replaced, "Repointed symlink");
    Ok(replaced)
}

/// Express `target` relative to the directory `base`.
///
/// Falls back to `target` unchanged when the two share no common root.
fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let target_parts: Vec<Component<'_>> = target.components().collect();
    let base_parts: Vec<Component<'_>> = base.components().collect();
    let common = target_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 && target.is_absolute() {
        return target.to_path_buf();
    }

    let mut relative = PathBuf::new();
    for _ in common..base_parts.len() {
        relative.push("..");
    }
    for part in &target_parts[common..] {
        relative.push(part.as_os_str());
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}

/// Recursively copy `src` into `dst`, creating `dst` if needed.
///
/// Files are copied, never hard linked, so later edits to `dst` cannot
/// change `src`. Symlinks inside the tree are recreated as symlinks.
///
/// # Errors
///
/// Returns an error if the tree cannot be walked or any entry cannot be
/// copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            Error::io(io::Error::other(e.to_string()), path, "walk")
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::configuration(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::io(e, &target, "create directory"))?;
        } else if file_type.is_symlink() {
            let points_to =
                fs::read_link(entry.path()).map_err(|e| Error::io(e, entry.path(), "readlink"))?;
            symlink(&points_to, &target).map_err(|e| Error::io(e, &target, "symlink"))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| Error::io(e, &target, "copy"))?;
            copied += 1;
        }
    }
    Ok(copied)
}
