//! Error types for target graph operations.

use std::fmt;

/// Result type for target graph operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during target graph operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A dependency cycle was detected in the graph.
    CycleDetected {
        /// Ids of the targets participating in the cycle, sorted.
        targets: Vec<String>,
    },

    /// One or more targets depend on targets that were never added.
    MissingDependencies {
        /// List of (target, missing_dependency) pairs.
        missing: Vec<(String, String)>,
    },

    /// A target was looked up that is not part of the graph.
    UnknownTarget {
        /// The id that was requested.
        id: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CycleDetected { targets } => {
                write!(f, "Cycle detected in target graph: {}", targets.join(" -> "))
            }
            Self::MissingDependencies { missing } => {
                let list = missing
                    .iter()
                    .map(|(target, dep)| format!("'{target}' depends on missing target '{dep}'"))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "Missing dependencies: {list}")
            }
            Self::UnknownTarget { id } => write!(f, "Target '{id}' is not part of the graph"),
        }
    }
}

impl std::error::Error for Error {}
