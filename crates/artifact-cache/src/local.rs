//! Artifact cache on the local filesystem
//!
//! Artifacts live at `<cache_root>/<target id>/<key hash>.tgz`. Writes go to
//! a temporary file in the cache root and are renamed into place, so readers
//! never see a partial artifact.

use crate::archive::TarGzArchiver;
use crate::cache::{ArtifactCache, CacheOutcome, UnreadableArtifact};
use crate::config::ArtifactCacheConfig;
use crate::{Error, Result};
use rebuilt_invalidation::{CacheKey, safe_mkdir_clean, sanitize_component};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

const ARTIFACT_EXTENSION: &str = "tgz";

/// A packaged artifact that has not been stored yet.
///
/// The temporary file is removed when the guard is dropped, whether the
/// caller stored it, failed, or unwound.
#[derive(Debug)]
pub struct ScopedArtifact {
    file: NamedTempFile,
}

impl ScopedArtifact {
    /// Location of the temporary tarball
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Open the tarball for reading from the start
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be reopened.
    pub fn open(&self) -> Result<File> {
        self.file
            .reopen()
            .map_err(|e| Error::io(e, self.file.path(), "reopen"))
    }

    fn persist(self, dest: &Path) -> Result<()> {
        self.file
            .persist(dest)
            .map_err(|e| Error::io(e.error, dest, "persist"))?;
        Ok(())
    }
}

/// The local tier: a directory of tarballs.
#[derive(Debug, Clone)]
pub struct LocalArtifactCache {
    artifact_root: PathBuf,
    cache_root: PathBuf,
    archiver: TarGzArchiver,
    max_entries_per_target: Option<usize>,
}

impl LocalArtifactCache {
    /// Open a cache described by `config`
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error if the configuration is invalid.
    pub fn new(config: &ArtifactCacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            artifact_root: config.artifact_root().to_path_buf(),
            cache_root: config.cache_root().to_path_buf(),
            archiver: TarGzArchiver::new(config.compression()),
            max_entries_per_target: config.max_entries_per_target(),
        })
    }

    /// Directory holding the artifacts
    #[must_use]
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Where the artifact for `key` is stored
    #[must_use]
    pub fn cache_file_for_key(&self, key: &CacheKey) -> PathBuf {
        self.cache_root
            .join(&*sanitize_component(key.id()))
            .join(format!(
                "{}.{ARTIFACT_EXTENSION}",
                sanitize_component(key.hash())
            ))
    }

    /// Package `paths` into a temporary tarball without storing it
    ///
    /// # Errors
    ///
    /// Returns an error if the cache root cannot be created or the paths
    /// cannot be archived.
    pub fn insert_paths(&self, key: &CacheKey, paths: &[PathBuf]) -> Result<ScopedArtifact> {
        let file = self.temp_file()?;
        let writer = self.archiver.create(
            BufWriter::new(file.as_file()),
            &self.artifact_root,
            paths,
        )?;
        writer
            .into_inner()
            .map_err(|e| Error::io(e.into_error(), file.path(), "flush"))?;
        debug!(key = %key, artifact = %file.path().display(), "Packaged artifact");
        Ok(ScopedArtifact { file })
    }

    /// Save a downloaded artifact and extract it
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `reader` fails or the artifact cannot be
    /// stored. A corrupt download is reported as
    /// [`CacheOutcome::Unreadable`].
    pub fn store_and_use_artifact(
        &self,
        key: &CacheKey,
        reader: &mut dyn Read,
        results_dir: Option<&Path>,
    ) -> Result<CacheOutcome> {
        let file = self.temp_file()?;
        let mut out = file.as_file();
        io::copy(reader, &mut out).map_err(|e| Error::io(e, file.path(), "download"))?;
        self.store(key, ScopedArtifact { file })?;
        self.use_cached_files(key, results_dir)
    }

    /// Keep only the newest `max_entries_per_target` artifacts of every
    /// target, by modification time. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be listed or a stale artifact
    /// cannot be removed.
    pub fn prune(&self, max_entries_per_target: usize) -> Result<usize> {
        if !self.cache_root.is_dir() {
            return Ok(0);
        }
        prune_artifacts(&self.cache_root, 2, max_entries_per_target)
    }

    fn temp_file(&self) -> Result<NamedTempFile> {
        fs::create_dir_all(&self.cache_root)
            .map_err(|e| Error::io(e, &self.cache_root, "create directory"))?;
        tempfile::Builder::new()
            .prefix(".artifact-")
            .suffix(".tmp")
            .tempfile_in(&self.cache_root)
            .map_err(|e| Error::io(e, &self.cache_root, "create temp file"))
    }

    pub(crate) fn store(&self, key: &CacheKey, artifact: ScopedArtifact) -> Result<PathBuf> {
        let dest = self.cache_file_for_key(key);
        let parent = dest.parent().unwrap_or(&self.cache_root).to_path_buf();
        fs::create_dir_all(&parent).map_err(|e| Error::io(e, &parent, "create directory"))?;
        artifact.persist(&dest)?;
        debug!(key = %key, artifact = %dest.display(), "Stored artifact");

        if let Some(max) = self.max_entries_per_target {
            prune_artifacts(&parent, 1, max)?;
        }
        Ok(dest)
    }
}

impl ArtifactCache for LocalArtifactCache {
    fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    fn try_insert(&self, key: &CacheKey, paths: &[PathBuf]) -> Result<()> {
        let artifact = self.insert_paths(key, paths)?;
        self.store(key, artifact)?;
        Ok(())
    }

    fn has(&self, key: &CacheKey) -> bool {
        self.cache_file_for_key(key).is_file()
    }

    fn use_cached_files(
        &self,
        key: &CacheKey,
        results_dir: Option<&Path>,
    ) -> Result<CacheOutcome> {
        let path = self.cache_file_for_key(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CacheOutcome::NotFound),
            Err(e) => return Err(Error::io(e, &path, "open")),
        };

        if let Some(dir) = results_dir {
            safe_mkdir_clean(dir)?;
        }

        match self.archiver.extract(BufReader::new(file), &self.artifact_root) {
            Ok(()) => {
                debug!(key = %key, "Restored artifact");
                Ok(CacheOutcome::Restored)
            }
            Err(e) => {
                warn!(key = %key, artifact = %path.display(), "Discarding unreadable artifact: {e}");
                if let Err(rm) = fs::remove_file(&path) {
                    debug!(artifact = %path.display(), "Could not remove unreadable artifact: {rm}");
                }
                Ok(CacheOutcome::Unreadable(UnreadableArtifact::new(
                    key.clone(),
                    e.to_string(),
                )))
            }
        }
    }

    fn delete(&self, key: &CacheKey) -> Result<()> {
        let path = self.cache_file_for_key(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &path, "remove")),
        }
    }
}

/// Remove all but the newest `keep` artifacts in each directory found
/// `depth` levels below `root`.
fn prune_artifacts(root: &Path, depth: usize, keep: usize) -> Result<usize> {
    let mut groups: BTreeMap<PathBuf, Vec<(SystemTime, PathBuf)>> = BTreeMap::new();
    for entry in WalkDir::new(root).min_depth(depth).max_depth(depth) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            Error::io(io::Error::other(e.to_string()), path, "walk")
        })?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|ext| ext.to_str()) != Some(ARTIFACT_EXTENSION)
        {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|metadata| metadata.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let parent = path.parent().unwrap_or(root).to_path_buf();
        groups
            .entry(parent)
            .or_default()
            .push((modified, path.to_path_buf()));
    }

    let mut removed = 0;
    for (dir, mut artifacts) in groups {
        artifacts.sort_by(|a, b| b.cmp(a));
        for (_, stale) in artifacts.into_iter().skip(keep) {
            match fs::remove_file(&stale) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(e, &stale, "remove")),
            }
        }
        debug!(dir = %dir.display(), keep, "Pruned artifacts");
    }
    Ok(removed)
}
