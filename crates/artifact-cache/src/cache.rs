//! The artifact cache capability shared by every tier

use crate::Result;
use rebuilt_invalidation::CacheKey;
use std::fmt;
use std::path::{Path, PathBuf};

/// An artifact that exists but could not be extracted.
///
/// Returned as a value so callers can fall back to rebuilding; the broken
/// artifact has already been discarded by the time this is seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableArtifact {
    key: CacheKey,
    reason: String,
}

impl UnreadableArtifact {
    /// Record that the artifact for `key` could not be read
    #[must_use]
    pub fn new(key: CacheKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }

    /// Key of the unreadable artifact
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Why extraction failed
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for UnreadableArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unreadable artifact {}: {}", self.key, self.reason)
    }
}

/// Result of trying to restore results from a cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The artifact was extracted into the artifact root
    Restored,
    /// No artifact exists for the key
    NotFound,
    /// An artifact exists but is corrupt
    Unreadable(UnreadableArtifact),
}

impl CacheOutcome {
    /// Whether results were restored
    #[must_use]
    pub fn is_restored(&self) -> bool {
        matches!(self, Self::Restored)
    }
}

/// Stores tarballs of results directories keyed by [`CacheKey`].
///
/// Archived paths are stored relative to [`ArtifactCache::artifact_root`] and
/// restored to the same place, so the root must contain every results
/// directory the cache is asked to store.
pub trait ArtifactCache: Send + Sync {
    /// Directory that archived paths are relative to
    fn artifact_root(&self) -> &Path;

    /// Archive `paths` under `key`
    ///
    /// # Errors
    ///
    /// Returns an error if the paths cannot be archived or the artifact
    /// cannot be stored.
    fn try_insert(&self, key: &CacheKey, paths: &[PathBuf]) -> Result<()>;

    /// Whether an artifact exists for `key`
    fn has(&self, key: &CacheKey) -> bool;

    /// Restore the artifact for `key`, clearing `results_dir` first
    ///
    /// # Errors
    ///
    /// Returns an error only when local files cannot be read or written;
    /// missing and corrupt artifacts are reported through [`CacheOutcome`].
    fn use_cached_files(&self, key: &CacheKey, results_dir: Option<&Path>)
    -> Result<CacheOutcome>;

    /// Remove the artifact for `key`, if any
    ///
    /// # Errors
    ///
    /// Returns an error if a local artifact exists but cannot be removed.
    fn delete(&self, key: &CacheKey) -> Result<()>;
}
