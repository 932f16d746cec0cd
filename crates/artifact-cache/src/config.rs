//! Artifact cache configuration

use crate::archive::DEFAULT_COMPRESSION;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where artifacts are read from and stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactCacheConfig {
    artifact_root: PathBuf,
    cache_root: PathBuf,
    #[serde(default)]
    max_entries_per_target: Option<usize>,
    #[serde(default = "default_compression")]
    compression: u32,
}

fn default_compression() -> u32 {
    DEFAULT_COMPRESSION
}

impl ArtifactCacheConfig {
    /// Cache storing artifacts in `cache_root` for paths under
    /// `artifact_root`
    #[must_use]
    pub fn new(artifact_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            artifact_root: artifact_root.into(),
            cache_root: cache_root.into(),
            max_entries_per_target: None,
            compression: DEFAULT_COMPRESSION,
        }
    }

    /// Artifacts for everything in a working directory, stored in
    /// `<workdir>/artifact_cache`
    #[must_use]
    pub fn for_workdir(workdir: &Path) -> Self {
        Self::new(workdir, workdir.join("artifact_cache"))
    }

    /// Keep at most `max` artifacts per target id
    #[must_use]
    pub fn with_max_entries_per_target(mut self, max: usize) -> Self {
        self.max_entries_per_target = Some(max);
        self
    }

    /// Gzip level for new artifacts
    #[must_use]
    pub fn with_compression(mut self, level: u32) -> Self {
        self.compression = level;
        self
    }

    /// Directory archived paths are relative to
    #[must_use]
    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    /// Directory holding the artifacts
    #[must_use]
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Per-target retention limit, if any
    #[must_use]
    pub fn max_entries_per_target(&self) -> Option<usize> {
        self.max_entries_per_target
    }

    /// Gzip level
    #[must_use]
    pub fn compression(&self) -> u32 {
        self.compression
    }

    /// Reject configurations that cannot work
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.artifact_root.as_os_str().is_empty() || self.cache_root.as_os_str().is_empty() {
            return Err(Error::configuration("artifact and cache roots must not be empty"));
        }
        if self.max_entries_per_target == Some(0) {
            return Err(Error::configuration(
                "max_entries_per_target must keep at least one artifact",
            ));
        }
        if self.compression > 9 {
            return Err(Error::configuration(format!(
                "compression level {} is out of range 0-9",
                self.compression
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_workdir_layout() {
        let config = ArtifactCacheConfig::for_workdir(Path::new("/work"));
        assert_eq!(config.artifact_root(), Path::new("/work"));
        assert_eq!(config.cache_root(), Path::new("/work/artifact_cache"));
        assert_eq!(config.max_entries_per_target(), None);
        assert_eq!(config.compression(), DEFAULT_COMPRESSION);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = ArtifactCacheConfig::new("/a", "/c");
        assert!(base.clone().with_max_entries_per_target(0).validate().is_err());
        assert!(base.clone().with_compression(10).validate().is_err());
        assert!(ArtifactCacheConfig::new("", "/c").validate().is_err());
        base.with_max_entries_per_target(3).validate().unwrap();
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: ArtifactCacheConfig =
            serde_json::from_str(r#"{"artifact_root":"/a","cache_root":"/c"}"#).unwrap();
        assert_eq!(config, ArtifactCacheConfig::new("/a", "/c"));
    }
}
