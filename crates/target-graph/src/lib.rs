//! Target dependency graph for rebuilt.
//!
//! Build targets are opaque to the invalidation layer: all it needs is a
//! stable id per target and the ids of the targets it depends on. This crate
//! stores such targets in a petgraph DAG and answers the two questions the
//! invalidation layer asks of it:
//!
//! - in which order should a batch of targets be visited so that
//!   dependencies come before dependents, and
//! - what are the direct dependencies of a target, for transitive
//!   fingerprinting.
//!
//! # Example
//!
//! ```ignore
//! use rebuilt_target_graph::{TargetGraph, TargetNode};
//!
//! #[derive(Clone)]
//! struct Lib {
//!     id: String,
//!     deps: Vec<String>,
//! }
//!
//! impl TargetNode for Lib {
//!     fn id(&self) -> &str {
//!         &self.id
//!     }
//!
//!     fn dependency_ids(&self) -> impl Iterator<Item = &str> {
//!         self.deps.iter().map(String::as_str)
//!     }
//! }
//!
//! let graph = TargetGraph::from_closure(targets)?;
//! let ordered = graph.topological_sort()?;
//! ```

mod error;
mod graph;

pub use error::{Error, Result};
pub use graph::TargetGraph;

/// Trait for targets that can be stored in a [`TargetGraph`].
pub trait TargetNode: Clone {
    /// Stable, human-readable identifier of the target (e.g. its address).
    fn id(&self) -> &str;

    /// Ids of the targets this target directly depends on.
    fn dependency_ids(&self) -> impl Iterator<Item = &str>;
}
