//! Error types for the artifact cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for artifact cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error while reading or writing artifacts
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(rebuilt::artifact_cache::io),
        help("Check file permissions and available disk space")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "persist")
        operation: String,
    },

    /// An artifact could not be packed or unpacked
    #[error("Archive error{}: {message}", path.as_ref().map_or(String::new(), |p| format!(" for {}", p.display())))]
    #[diagnostic(
        code(rebuilt::artifact_cache::archive),
        help("Artifacts may only contain paths under the cache's artifact root")
    )]
    Archive {
        /// Error message describing the archive issue
        message: String,
        /// The file involved, if any
        path: Option<Box<Path>>,
    },

    /// An upload failed; the build can carry on without the artifact
    #[error("Failed to write artifact {key}: {message}")]
    #[diagnostic(code(rebuilt::artifact_cache::nonfatal))]
    Nonfatal {
        /// Object key that could not be written
        key: String,
        /// Error message from the store
        message: String,
    },

    /// Configuration or validation error
    #[error("Artifact cache configuration error: {message}")]
    #[diagnostic(code(rebuilt::artifact_cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Error from the results directory layer
    #[error(transparent)]
    #[diagnostic(transparent)]
    Invalidation(#[from] rebuilt_invalidation::Error),
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create an archive error tied to a file
    #[must_use]
    pub fn archive(msg: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::Archive {
            message: msg.into(),
            path: Some(path.as_ref().into()),
        }
    }

    /// Whether this failure can be ignored by a build that only wanted to
    /// share its results
    #[must_use]
    pub fn is_nonfatal(&self) -> bool {
        matches!(self, Self::Nonfatal { .. })
    }
}

/// Failure reported by a remote store.
///
/// The cache treats every variant as a miss; the split only decides what
/// gets logged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum RemoteError {
    /// The object does not exist
    #[error("Object not found: {key}")]
    #[diagnostic(code(rebuilt::artifact_cache::remote::not_found))]
    NotFound {
        /// Object key that was requested
        key: String,
    },

    /// The store could not be reached
    #[error("Network error: {message}")]
    #[diagnostic(
        code(rebuilt::artifact_cache::remote::network),
        help("Check connectivity to the remote artifact store")
    )]
    Network {
        /// Error message from the transport
        message: String,
    },

    /// Any other store failure
    #[error("Remote store error: {message}")]
    #[diagnostic(code(rebuilt::artifact_cache::remote::other))]
    Other {
        /// Error message from the store
        message: String,
    },
}

/// Result type for artifact cache operations
pub type Result<T> = std::result::Result<T, Error>;
