//! Target fingerprinting and cache key generation
//!
//! A [`FingerprintStrategy`] turns one target into a content digest. A
//! [`CacheKeyGenerator`] turns that digest into a [`CacheKey`], optionally
//! folding in the keys of every dependency so that a change anywhere below a
//! target invalidates it.

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use crate::cache_key::{CacheKey, hash_all};
use miette::Diagnostic;
use rebuilt_target_graph::{TargetGraph, TargetNode};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::trace;

/// Version of the key derivation scheme. Bumping it invalidates every key.
pub const KEY_GENERATOR_VERSION: &str = "1";

/// Why a target could not be fingerprinted
#[derive(Error, Debug, Diagnostic)]
pub enum FingerprintError {
    /// A declared source could not be read
    #[error("cannot read source {}", path.display())]
    #[diagnostic(code(rebuilt::fingerprint::unreadable_source))]
    UnreadableSource {
        /// The source path, resolved against the build root
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A dependency is not known to the key generator
    #[error("unknown dependency {id}")]
    #[diagnostic(
        code(rebuilt::fingerprint::unknown_target),
        help("Build the key generator from the full dependency closure of the targets being checked")
    )]
    UnknownTarget {
        /// The missing target id
        id: String,
    },

    /// A custom strategy failed
    #[error("{message}")]
    #[diagnostic(code(rebuilt::fingerprint::strategy))]
    Strategy {
        /// Description of the failure
        message: String,
    },
}

impl FingerprintError {
    /// Create a strategy failure
    #[must_use]
    pub fn strategy(msg: impl Into<String>) -> Self {
        Self::Strategy {
            message: msg.into(),
        }
    }
}

/// A build target as seen by the invalidation layer.
pub trait Target: TargetNode + Send + Sync {
    /// Location of the target definition, used in diagnostics
    fn spec_path(&self) -> &str;

    /// Source files, relative to the build root
    fn sources(&self) -> &[PathBuf] {
        &[]
    }
}

/// Computes the content digest of a single target.
pub trait FingerprintStrategy<T>: Send + Sync {
    /// Name mixed into every key so that strategies never share keys
    fn name(&self) -> &str;

    /// Digest of the target's own inputs, or `None` to opt the target out of
    /// invalidation entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if the target's inputs cannot be read.
    fn fingerprint_target(&self, target: &T) -> Result<Option<String>, FingerprintError>;
}

/// Produces cache keys for targets.
pub trait CacheKeyGenerator<T: TargetNode>: Send + Sync {
    /// Key for `target` under `strategy`. Transitive keys also reflect every
    /// dependency's key. `None` means the target was opted out.
    ///
    /// # Errors
    ///
    /// Returns an error if the target or one of its dependencies cannot be
    /// fingerprinted.
    fn key_for_target(
        &self,
        target: &T,
        transitive: bool,
        strategy: &dyn FingerprintStrategy<T>,
    ) -> Result<Option<CacheKey>, FingerprintError>;

    /// Full dependency graph behind the keys, when the generator has one.
    /// Topological checks order batches over it, so dependency paths through
    /// targets outside the batch still count.
    fn dependency_graph(&self) -> Option<&TargetGraph<T>> {
        None
    }
}

/// Hashes the target id plus every declared source, path and bytes, in
/// sorted path order.
#[derive(Debug, Clone)]
pub struct SourceFingerprintStrategy {
    buildroot: PathBuf,
}

impl SourceFingerprintStrategy {
    /// Strategy reading sources relative to `buildroot`
    #[must_use]
    pub fn new(buildroot: impl Into<PathBuf>) -> Self {
        Self {
            buildroot: buildroot.into(),
        }
    }

    /// Root that source paths are resolved against
    #[must_use]
    pub fn buildroot(&self) -> &Path {
        &self.buildroot
    }
}

impl<T: Target> FingerprintStrategy<T> for SourceFingerprintStrategy {
    fn name(&self) -> &str {
        "sources"
    }

    fn fingerprint_target(&self, target: &T) -> Result<Option<String>, FingerprintError> {
        let mut sources: Vec<&PathBuf> = target.sources().iter().collect();
        sources.sort();
        sources.dedup();

        let mut hasher = Sha256::new();
        hasher.update(target.id().as_bytes());
        hasher.update([0u8]);
        for relative in sources {
            let path = self.buildroot.join(relative);
            let bytes = std::fs::read(&path)
                .map_err(|source| FingerprintError::UnreadableSource { path, source })?;
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(&bytes);
            hasher.update([0u8]);
        }
        Ok(Some(hex::encode(hasher.finalize())))
    }
}

type MemoKey = (String, String, bool);

/// Key generator aware of the dependency graph.
///
/// Every key is salted with [`KEY_GENERATOR_VERSION`] and a caller-supplied
/// salt (normally the task fingerprint). Computed hashes are memoised per
/// generator until [`TransitiveKeyGenerator::clear`] is called, so the
/// generator must be rebuilt or cleared whenever sources change.
pub struct TransitiveKeyGenerator<T: Target> {
    graph: TargetGraph<T>,
    salt: String,
    memo: Mutex<HashMap<MemoKey, Option<String>>>,
}

impl<T: Target> TransitiveKeyGenerator<T> {
    /// Generator over an already built graph
    #[must_use]
    pub fn new(graph: TargetGraph<T>, salt: impl Into<String>) -> Self {
        Self {
            graph,
            salt: salt.into(),
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Generator over the dependency closure `targets`
    ///
    /// # Errors
    ///
    /// Returns an error if a dependency is missing or the targets form a
    /// cycle.
    pub fn from_targets(
        targets: impl IntoIterator<Item = T>,
        salt: impl Into<String>,
    ) -> rebuilt_target_graph::Result<Self> {
        Ok(Self::new(TargetGraph::from_closure(targets)?, salt))
    }

    /// The graph used to resolve dependencies
    #[must_use]
    pub fn graph(&self) -> &TargetGraph<T> {
        &self.graph
    }

    /// Drop every memoised hash
    pub fn clear(&self) {
        if let Ok(mut memo) = self.memo.lock() {
            memo.clear();
        }
    }

    fn memoised(&self, key: &MemoKey) -> Option<Option<String>> {
        self.memo.lock().ok().and_then(|memo| memo.get(key).cloned())
    }

    fn remember(&self, key: MemoKey, value: Option<String>) {
        if let Ok(mut memo) = self.memo.lock() {
            memo.insert(key, value);
        }
    }

    fn hash_for(
        &self,
        target: &T,
        transitive: bool,
        strategy: &dyn FingerprintStrategy<T>,
    ) -> Result<Option<String>, FingerprintError> {
        let memo_key = (
            target.id().to_string(),
            strategy.name().to_string(),
            transitive,
        );
        if let Some(cached) = self.memoised(&memo_key) {
            return Ok(cached);
        }

        let own = strategy.fingerprint_target(target)?;
        let mut dep_hashes = Vec::new();
        if transitive {
            for dep_id in target.dependency_ids() {
                let dep = self
                    .graph
                    .get(dep_id)
                    .ok_or_else(|| FingerprintError::UnknownTarget {
                        id: dep_id.to_string(),
                    })?;
                if let Some(hash) = self.hash_for(dep, true, strategy)? {
                    dep_hashes.push(hash);
                }
            }
            dep_hashes.sort_unstable();
        }

        let hash = if own.is_none() && dep_hashes.is_empty() {
            None
        } else {
            let own = own.unwrap_or_default();
            let parts = [
                KEY_GENERATOR_VERSION,
                self.salt.as_str(),
                strategy.name(),
                own.as_str(),
            ]
            .into_iter()
            .chain(dep_hashes.iter().map(String::as_str));
            Some(hash_all(parts))
        };

        trace!(target = target.id(), transitive, opted_out = hash.is_none(), "Computed target hash");
        self.remember(memo_key, hash.clone());
        Ok(hash)
    }
}

impl<T: Target> CacheKeyGenerator<T> for TransitiveKeyGenerator<T> {
    fn key_for_target(
        &self,
        target: &T,
        transitive: bool,
        strategy: &dyn FingerprintStrategy<T>,
    ) -> Result<Option<CacheKey>, FingerprintError> {
        Ok(self
            .hash_for(target, transitive, strategy)?
            .map(|hash| CacheKey::new(target.id(), hash)))
    }

    fn dependency_graph(&self) -> Option<&TargetGraph<T>> {
        Some(&self.graph)
    }
}
