//! Deterministic results-directory paths
//!
//! ```text
//! <root>/<hash_value(task)>/<id>/current            -> symlink to the unique dir
//! <root>/<hash_value(task)>/<id>/<hash_value(hash)>/ -> real directory
//! ```
//!
//! Everything in this module is pure: no function touches the filesystem.

use crate::cache_key::{CacheKey, hash_value};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// Name of the stable symlink inside each target's directory.
pub const STABLE_DIR_NAME: &str = "current";

const SUFFIX_LEN: usize = 8;

/// Name and implementation version of the task that owns a set of results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskIdentity {
    name: String,
    version: String,
}

impl TaskIdentity {
    /// Create a task identity
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Task name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Implementation version string
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Digest namespacing this task's results; changes whenever the name or
    /// version changes.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hash_value(&format!("{}_{}", self.name, self.version))
    }
}

impl Default for TaskIdentity {
    fn default() -> Self {
        Self::new("UNKNOWN", "0")
    }
}

/// Computes stable, unique and previous results paths for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsLayout {
    root: PathBuf,
    task_hash: String,
}

impl ResultsLayout {
    /// Layout rooted at `root` for the given task
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, task: &TaskIdentity) -> Self {
        Self {
            root: root.into(),
            task_hash: task.fingerprint(),
        }
    }

    /// Root directory shared by every task version
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Digest of the owning task identity
    #[must_use]
    pub fn task_hash(&self) -> &str {
        &self.task_hash
    }

    /// Directory holding every target's results for this task version
    #[must_use]
    pub fn task_dir(&self) -> PathBuf {
        self.root.join(&self.task_hash)
    }

    /// Results path for `key`: the stable symlink when `stable` is true,
    /// otherwise the directory unique to the key's hash.
    #[must_use]
    pub fn results_path(&self, key: &CacheKey, stable: bool) -> PathBuf {
        let dir_name = if stable {
            STABLE_DIR_NAME.to_string()
        } else {
            hash_value(key.hash())
        };
        self.task_dir()
            .join(sanitize_component(key.id()).as_ref())
            .join(dir_name)
    }

    /// Stable path consumers read from
    #[must_use]
    pub fn stable_path(&self, key: &CacheKey) -> PathBuf {
        self.results_path(key, true)
    }

    /// Directory unique to the key's content hash
    #[must_use]
    pub fn unique_path(&self, key: &CacheKey) -> PathBuf {
        self.results_path(key, false)
    }
}

/// Make an id usable as a single path component.
///
/// Ids made of `[A-Za-z0-9._+=@,-]` are returned unchanged. Anything else
/// (path separators, colons, whitespace, `.`/`..`) is replaced by `_` and
/// suffixed with a short digest of the raw id so distinct ids stay distinct.
#[must_use]
pub fn sanitize_component(raw: &str) -> Cow<'_, str> {
    let safe = |c: char| c.is_ascii_alphanumeric() || "._+=@,-".contains(c);
    if !raw.is_empty() && raw != "." && raw != ".." && raw.chars().all(safe) {
        return Cow::Borrowed(raw);
    }
    let cleaned: String = raw
        .chars()
        .map(|c| if safe(c) { c } else { '_' })
        .collect();
    let digest = hash_value(raw);
    Cow::Owned(format!("{cleaned}-{}", &digest[..SUFFIX_LEN]))
}
