//! Remote tier backed by any object store
//!
//! Every read goes through the local cache first and downloads are stored
//! locally before extraction. The remote side fails open: a store that is
//! unreachable or misbehaving only ever costs a rebuild.

use crate::cache::{ArtifactCache, CacheOutcome, UnreadableArtifact};
use crate::error::RemoteError;
use crate::local::LocalArtifactCache;
use crate::{Error, Result};
use rebuilt_invalidation::CacheKey;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A flat key/value store of artifact bytes.
pub trait RemoteStore: Send + Sync {
    /// Succeeds if `key` exists
    ///
    /// # Errors
    ///
    /// `NotFound` when the object is missing, otherwise the store failure.
    fn exists(&self, key: &str) -> std::result::Result<(), RemoteError>;

    /// Stream the object stored under `key`
    ///
    /// # Errors
    ///
    /// `NotFound` when the object is missing, otherwise the store failure.
    fn get(&self, key: &str) -> std::result::Result<Box<dyn Read + Send>, RemoteError>;

    /// Store everything `body` yields under `key`
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    fn put(&self, key: &str, body: &mut dyn Read) -> std::result::Result<(), RemoteError>;

    /// Remove the object stored under `key`
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    fn delete(&self, key: &str) -> std::result::Result<(), RemoteError>;
}

impl<S: RemoteStore + ?Sized> RemoteStore for Arc<S> {
    fn exists(&self, key: &str) -> std::result::Result<(), RemoteError> {
        (**self).exists(key)
    }

    fn get(&self, key: &str) -> std::result::Result<Box<dyn Read + Send>, RemoteError> {
        (**self).get(key)
    }

    fn put(&self, key: &str, body: &mut dyn Read) -> std::result::Result<(), RemoteError> {
        (**self).put(key, body)
    }

    fn delete(&self, key: &str) -> std::result::Result<(), RemoteError> {
        (**self).delete(key)
    }
}

impl RemoteError {
    /// Classify an I/O failure against object `key`
    #[must_use]
    pub fn from_io(err: &io::Error, key: &str) -> Self {
        match classify_io(err.kind()) {
            ErrorClass::NotFound => Self::NotFound {
                key: key.to_string(),
            },
            ErrorClass::Network => Self::Network {
                message: err.to_string(),
            },
            ErrorClass::Unknown => Self::Other {
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    NotFound,
    Network,
    Unknown,
}

fn classify_io(kind: io::ErrorKind) -> ErrorClass {
    use io::ErrorKind;
    match kind {
        ErrorKind::NotFound => ErrorClass::NotFound,
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::TimedOut
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::Interrupted => ErrorClass::Network,
        _ => ErrorClass::Unknown,
    }
}

fn log_and_classify(err: &RemoteError, verb: &str, object: &str) -> ErrorClass {
    let class = match err {
        RemoteError::NotFound { .. } => ErrorClass::NotFound,
        RemoteError::Network { .. } => ErrorClass::Network,
        RemoteError::Other { .. } => ErrorClass::Unknown,
    };
    match class {
        ErrorClass::NotFound => debug!(object, "{verb} failed: object not found"),
        ErrorClass::Network => debug!(object, "{verb} failed: network error: {err}"),
        ErrorClass::Unknown => debug!(object, "{verb} failed: unknown error: {err}"),
    }
    class
}

/// Local cache in front of a [`RemoteStore`].
///
/// Objects are named `<prefix>/<target id>/<key hash>.tgz`.
#[derive(Debug)]
pub struct RemoteArtifactCache<S> {
    local: LocalArtifactCache,
    store: S,
    prefix: String,
}

impl<S: RemoteStore> RemoteArtifactCache<S> {
    /// Layer `store` behind `local`, naming objects under `prefix`
    #[must_use]
    pub fn new(local: LocalArtifactCache, store: S, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self {
            local,
            store,
            prefix,
        }
    }

    /// The local tier
    #[must_use]
    pub fn local(&self) -> &LocalArtifactCache {
        &self.local
    }

    /// The remote store
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Object name for `key`
    #[must_use]
    pub fn object_key(&self, key: &CacheKey) -> String {
        if self.prefix.is_empty() {
            format!("{}/{}.tgz", key.id(), key.hash())
        } else {
            format!("{}/{}/{}.tgz", self.prefix, key.id(), key.hash())
        }
    }
}

impl<S: RemoteStore> ArtifactCache for RemoteArtifactCache<S> {
    fn artifact_root(&self) -> &Path {
        self.local.artifact_root()
    }

    /// Packages once, uploads, and keeps a local copy even when the upload
    /// fails.
    fn try_insert(&self, key: &CacheKey, paths: &[PathBuf]) -> Result<()> {
        let artifact = self.local.insert_paths(key, paths)?;
        let object = self.object_key(key);

        let mut body = BufReader::new(artifact.open()?);
        let uploaded = self.store.put(&object, &mut body);
        drop(body);
        self.local.store(key, artifact)?;

        match uploaded {
            Ok(()) => {
                debug!(object, "Uploaded artifact");
                Ok(())
            }
            Err(e) => {
                log_and_classify(&e, "PUT", &object);
                Err(Error::Nonfatal {
                    key: object,
                    message: e.to_string(),
                })
            }
        }
    }

    fn has(&self, key: &CacheKey) -> bool {
        if self.local.has(key) {
            return true;
        }
        let object = self.object_key(key);
        match self.store.exists(&object) {
            Ok(()) => true,
            Err(e) => {
                log_and_classify(&e, "HEAD", &object);
                false
            }
        }
    }

    fn use_cached_files(
        &self,
        key: &CacheKey,
        results_dir: Option<&Path>,
    ) -> Result<CacheOutcome> {
        if self.local.has(key) {
            return self.local.use_cached_files(key, results_dir);
        }

        let object = self.object_key(key);
        let mut body = match self.store.get(&object) {
            Ok(body) => body,
            Err(e) => {
                log_and_classify(&e, "GET", &object);
                return Ok(CacheOutcome::NotFound);
            }
        };

        match self.local.store_and_use_artifact(key, &mut body, results_dir) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let remote = match &e {
                    Error::Io { source, .. } => RemoteError::from_io(source, &object),
                    other => RemoteError::Other {
                        message: other.to_string(),
                    },
                };
                match log_and_classify(&remote, "GET", &object) {
                    ErrorClass::Unknown => Ok(CacheOutcome::Unreadable(UnreadableArtifact::new(
                        key.clone(),
                        e.to_string(),
                    ))),
                    ErrorClass::NotFound | ErrorClass::Network => Ok(CacheOutcome::NotFound),
                }
            }
        }
    }

    fn delete(&self, key: &CacheKey) -> Result<()> {
        self.local.delete(key)?;
        let object = self.object_key(key);
        if let Err(e) = self.store.delete(&object) {
            log_and_classify(&e, "DELETE", &object);
        }
        Ok(())
    }
}

/// A [`RemoteStore`] kept in a directory, typically on a shared mount.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Store objects below `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the objects
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> std::result::Result<PathBuf, RemoteError> {
        let relative = Path::new(key);
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(RemoteError::Other {
                message: format!("invalid object key: {key}"),
            });
        }
        Ok(self.root.join(relative))
    }
}

impl RemoteStore for DirectoryStore {
    fn exists(&self, key: &str) -> std::result::Result<(), RemoteError> {
        let path = self.object_path(key)?;
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => Ok(()),
            Ok(_) => Err(RemoteError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(RemoteError::from_io(&e, key)),
        }
    }

    fn get(&self, key: &str) -> std::result::Result<Box<dyn Read + Send>, RemoteError> {
        let path = self.object_path(key)?;
        let file = File::open(&path).map_err(|e| RemoteError::from_io(&e, key))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn put(&self, key: &str, body: &mut dyn Read) -> std::result::Result<(), RemoteError> {
        let path = self.object_path(key)?;
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(|e| RemoteError::from_io(&e, key))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| RemoteError::from_io(&e, key))?;
        io::copy(body, &mut temp).map_err(|e| RemoteError::from_io(&e, key))?;
        temp.persist(&path)
            .map_err(|e| RemoteError::from_io(&e.error, key))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> std::result::Result<(), RemoteError> {
        let path = self.object_path(key)?;
        fs::remove_file(&path).map_err(|e| RemoteError::from_io(&e, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_io_classification() {
        let missing = io::Error::from(io::ErrorKind::NotFound);
        assert!(matches!(
            RemoteError::from_io(&missing, "k"),
            RemoteError::NotFound { .. }
        ));
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            RemoteError::from_io(&refused, "k"),
            RemoteError::Network { .. }
        ));
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            RemoteError::from_io(&denied, "k"),
            RemoteError::Other { .. }
        ));
    }

    #[test]
    fn test_directory_store_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = DirectoryStore::new(tmp.path());

        assert!(matches!(
            store.exists("p/t/h.tgz"),
            Err(RemoteError::NotFound { .. })
        ));
        store.put("p/t/h.tgz", &mut &b"bytes"[..]).unwrap();
        store.exists("p/t/h.tgz").unwrap();

        let mut read = String::new();
        store.get("p/t/h.tgz").unwrap().read_to_string(&mut read).unwrap();
        assert_eq!(read, "bytes");

        store.delete("p/t/h.tgz").unwrap();
        assert!(matches!(
            store.get("p/t/h.tgz"),
            Err(RemoteError::NotFound { .. })
        ));
    }

    #[test]
    fn test_directory_store_rejects_escaping_keys() {
        let tmp = TempDir::new().unwrap();
        let store = DirectoryStore::new(tmp.path().join("store"));
        assert!(matches!(
            store.put("../outside", &mut &b"x"[..]),
            Err(RemoteError::Other { .. })
        ));
        assert!(!tmp.path().join("outside").exists());
    }

    #[test]
    fn test_object_key_layout() {
        let tmp = TempDir::new().unwrap();
        let local = LocalArtifactCache::new(&crate::ArtifactCacheConfig::for_workdir(tmp.path()))
            .unwrap();
        let key = CacheKey::new("src/java:lib", "abc");

        let cache = RemoteArtifactCache::new(local.clone(), DirectoryStore::new(tmp.path()), "/artifacts/");
        assert_eq!(cache.object_key(&key), "artifacts/src/java:lib/abc.tgz");

        let bare = RemoteArtifactCache::new(local, DirectoryStore::new(tmp.path()), "");
        assert_eq!(bare.object_key(&key), "src/java:lib/abc.tgz");
    }
}
