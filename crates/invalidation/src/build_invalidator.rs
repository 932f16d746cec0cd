//! Durable record of the last successfully built key per target id

use crate::cache_key::CacheKey;
use crate::layout::sanitize_component;
use crate::{Error, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, trace};

/// Stores one JSON record `{ "id": ..., "hash": ... }` per target id.
///
/// Records are replaced atomically. A record whose stored id does not match
/// the requested id is ignored, so sanitizer collisions can never make an
/// unrelated target look valid.
#[derive(Debug, Clone)]
pub struct BuildInvalidator {
    root: PathBuf,
}

impl BuildInvalidator {
    /// Invalidator storing its records under `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the records
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root
            .join(format!("{}.json", sanitize_component(id).as_ref()))
    }

    /// Last key committed for `key.id()`, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read or parsed.
    pub fn previous_key(&self, key: &CacheKey) -> Result<Option<CacheKey>> {
        let path = self.record_path(key.id());
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        let stored: CacheKey = serde_json::from_slice(&content).map_err(|e| {
            Error::serialization(format!("Failed to parse invalidation record: {e}"), &path)
        })?;
        if stored.id() == key.id() {
            Ok(Some(stored))
        } else {
            debug!(
                requested = key.id(),
                stored = stored.id(),
                "Ignoring invalidation record written for another id"
            );
            Ok(None)
        }
    }

    /// Record `key` as the last good key for its id
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn update(&self, key: &CacheKey) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| Error::io(e, &self.root, "create_dir_all"))?;
        let path = self.record_path(key.id());
        let json = serde_json::to_vec(key).map_err(|e| {
            Error::serialization(format!("Failed to serialize cache key: {e}"), &path)
        })?;

        let mut temp =
            NamedTempFile::new_in(&self.root).map_err(|e| Error::io(e, &self.root, "tempfile"))?;
        temp.write_all(&json)
            .map_err(|e| Error::io(e, temp.path(), "write"))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| Error::io(e, temp.path(), "sync"))?;
        temp.persist(&path)
            .map_err(|e| Error::io(e.error, &path, "rename"))?;
        trace!(key = %key, "Committed cache key");
        Ok(())
    }

    /// Forget the last good key for `key.id()`. Missing records are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing record cannot be removed.
    pub fn force_invalidate(&self, key: &CacheKey) -> Result<()> {
        let path = self.record_path(key.id());
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(id = key.id(), "Removed invalidation record");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &path, "remove")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_record_is_none() {
        let tmp = TempDir::new().unwrap();
        let invalidator = BuildInvalidator::new(tmp.path());
        assert_eq!(invalidator.previous_key(&CacheKey::new("a", "1")).unwrap(), None);
    }

    #[test]
    fn test_update_then_read_back() {
        let tmp = TempDir::new().unwrap();
        let invalidator = BuildInvalidator::new(tmp.path().join("nested"));
        let key = CacheKey::new("src/java:lib", "abc");
        invalidator.update(&key).unwrap();
        invalidator.update(&key).unwrap();
        assert_eq!(invalidator.previous_key(&key).unwrap(), Some(key.clone()));

        let newer = CacheKey::new("src/java:lib", "def");
        assert_eq!(invalidator.previous_key(&newer).unwrap(), Some(key));
    }

    #[test]
    fn test_force_invalidate_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let invalidator = BuildInvalidator::new(tmp.path());
        let key = CacheKey::new("a", "1");
        invalidator.update(&key).unwrap();
        invalidator.force_invalidate(&key).unwrap();
        invalidator.force_invalidate(&key).unwrap();
        assert_eq!(invalidator.previous_key(&key).unwrap(), None);
    }

    #[test]
    fn test_records_are_per_id() {
        let tmp = TempDir::new().unwrap();
        let invalidator = BuildInvalidator::new(tmp.path());
        invalidator.update(&CacheKey::new("src/lib", "1")).unwrap();
        assert_eq!(
            invalidator.previous_key(&CacheKey::new("src:lib", "1")).unwrap(),
            None
        );
    }

    #[test]
    fn test_mismatched_stored_id_is_absent() {
        let tmp = TempDir::new().unwrap();
        let invalidator = BuildInvalidator::new(tmp.path());
        fs::write(tmp.path().join("a.json"), r#"{"id":"b","hash":"1"}"#).unwrap();
        assert_eq!(invalidator.previous_key(&CacheKey::new("a", "1")).unwrap(), None);
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let invalidator = BuildInvalidator::new(tmp.path());
        fs::write(tmp.path().join("a.json"), "not json").unwrap();
        let err = invalidator.previous_key(&CacheKey::new("a", "1")).unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
