//! Artifact caches for rebuilt results directories
//!
//! Results directories of committed targets can be shared between
//! workspaces and machines as gzipped tarballs:
//! - [`LocalArtifactCache`] keeps them in a directory
//! - [`RemoteArtifactCache`] puts a [`RemoteStore`] behind the local tier
//! - [`ArtifactWriter`] stores every committed results directory
//! - [`CachedResults`] restores invalid targets before they are rebuilt
//!
//! # Layout
//!
//! ```text
//! <cache_root>/<target id>/<key hash>.tgz
//! <prefix>/<target id>/<key hash>.tgz      (remote objects)
//! ```
//!
//! Archived paths are relative to the artifact root, which must contain the
//! results roots of every task whose artifacts are cached.

mod archive;
mod cache;
mod config;
mod error;
mod facade;
mod local;
mod remote;
mod writer;

// Re-export error types at crate root
pub use error::{Error, RemoteError, Result};

// Re-export main types
pub use archive::{DEFAULT_COMPRESSION, TarGzArchiver};
pub use cache::{ArtifactCache, CacheOutcome, UnreadableArtifact};
pub use config::ArtifactCacheConfig;
pub use facade::{CachedResults, WriteMode};
pub use local::{LocalArtifactCache, ScopedArtifact};
pub use remote::{DirectoryStore, RemoteArtifactCache, RemoteStore};
pub use writer::{ArtifactWriter, WriteSummary};
