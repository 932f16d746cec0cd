//! Build invalidation and versioned results directories for rebuilt
//!
//! This crate decides which targets of a task must be rebuilt and gives
//! every target a results directory whose contents match its inputs:
//! - Deterministic cache keys per target, optionally covering dependencies
//! - A durable record of the last successfully built key per target
//! - Unique results directories per key behind a stable symlink
//! - Incremental seeding from the previous build's results
//!
//! # Overview
//!
//! A task calls [`InvalidationCacheManager::check`] with its targets, gets
//! back an [`InvalidationCheck`], builds the invalid targets into their
//! results directories and calls `update()` on each. The next check with the
//! same inputs reports everything as valid.
//!
//! # Results layout
//!
//! ```text
//! <results_root>/<task digest>/<target id>/current -> <key digest>
//! <results_root>/<task digest>/<target id>/<key digest>/
//! ```
//!
//! Changing the task version changes the task digest, so old results are
//! never reused across task versions.

mod build_invalidator;
mod cache_key;
mod config;
mod dirutil;
mod error;
mod fingerprint;
mod layout;
mod manager;
mod report;
mod versioned;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use build_invalidator::BuildInvalidator;
pub use cache_key::{CacheKey, DIGEST_LEN, combine_cache_keys, hash_all, hash_value};
pub use config::{InvalidationConfig, WORKDIR_ENV, default_workdir};
pub use dirutil::{copy_tree, safe_mkdir_clean, safe_rmtree};
pub use fingerprint::{
    CacheKeyGenerator, FingerprintError, FingerprintStrategy, KEY_GENERATOR_VERSION,
    SourceFingerprintStrategy, Target, TransitiveKeyGenerator,
};
pub use layout::{ResultsLayout, STABLE_DIR_NAME, TaskIdentity, sanitize_component};
pub use manager::{InvalidationCacheManager, InvalidationCheck};
pub use report::{InvalidationReport, ReportEntry, ReportPhase};
pub use versioned::{
    CompletedResults, ResultsDir, ResultsDirHandle, SingleTargetVersion, TargetGroupVersion,
    WriteCallback,
};

pub use rebuilt_target_graph::TargetNode;
