//! Error types for the invalidation crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use crate::fingerprint::FingerprintError;
use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for invalidation operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error while touching the invalidation store or results directories
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(rebuilt::invalidation::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "rename", "symlink")
        operation: String,
    },

    /// The on-disk stable/unique results directory invariant is broken
    #[error(
        "Illegal results directory state:{}",
        violations.iter().map(|v| format!("\n\t* {v}")).collect::<String>()
    )]
    #[diagnostic(
        code(rebuilt::invalidation::illegal_results_dir),
        help("Results directories should not be manually cleaned or recreated by tasks")
    )]
    IllegalResultsDir {
        /// Every broken invariant that was found, each naming its path
        violations: Vec<String>,
    },

    /// Computing the cache key of a target failed
    #[error("Problem validating target {target} in {spec_path}: {source}")]
    #[diagnostic(code(rebuilt::invalidation::cache_validation))]
    CacheValidation {
        /// Id of the target whose fingerprint failed
        target: String,
        /// Location of the target definition
        spec_path: String,
        /// The underlying fingerprint failure
        #[source]
        source: FingerprintError,
    },

    /// A results directory was requested before it was created
    #[error("No results_dir was created for {owner}: {}", path.display())]
    #[diagnostic(
        code(rebuilt::invalidation::missing_results_dir),
        help("Call create_results_dir() on invalid targets before reading their results")
    )]
    MissingResultsDir {
        /// Display name of the versioned target
        owner: String,
        /// The path that does not exist
        path: Box<Path>,
    },

    /// A target set was constructed from no targets
    #[error("Cannot version an empty set of targets")]
    #[diagnostic(code(rebuilt::invalidation::empty_target_set))]
    EmptyTargetSet,

    /// Versioned targets from different managers were combined
    #[error("Cannot combine versioned targets {first} and {other} owned by different cache managers")]
    #[diagnostic(code(rebuilt::invalidation::mixed_managers))]
    MixedManagers {
        /// The first versioned target of the set
        first: String,
        /// The target that belongs to another manager
        other: String,
    },

    /// Target ordering failed
    #[error("Failed to order targets: {0}")]
    #[diagnostic(code(rebuilt::invalidation::graph))]
    Graph(#[from] rebuilt_target_graph::Error),

    /// An invalidation record or report could not be (de)serialized
    #[error("Serialization error{}: {message}", path.as_ref().map_or(String::new(), |p| format!(" in {}", p.display())))]
    #[diagnostic(
        code(rebuilt::invalidation::serialization),
        help("The record may be corrupt; delete it to force the target to rebuild")
    )]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
        /// The file involved, if any
        path: Option<Box<Path>>,
    },

    /// Configuration or validation error
    #[error("Invalidation configuration error: {message}")]
    #[diagnostic(code(rebuilt::invalidation::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },
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

    /// Create a serialization error tied to a file
    #[must_use]
    pub fn serialization(msg: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::Serialization {
            message: msg.into(),
            path: Some(path.as_ref().into()),
        }
    }

    /// Create a missing results directory error
    #[must_use]
    pub fn missing_results_dir(owner: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::MissingResultsDir {
            owner: owner.into(),
            path: path.as_ref().into(),
        }
    }
}

/// Result type for invalidation operations
pub type Result<T> = std::result::Result<T, Error>;
