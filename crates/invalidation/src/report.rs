//! Per-run record of target validity

use crate::cache_key::CacheKey;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// When an entry was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportPhase {
    /// A versioned target was created by `check`
    Init,
    /// A versioned target was committed
    Update,
    /// A versioned target was forcibly invalidated
    ForceInvalidate,
}

/// One observation of a versioned target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    /// Task that owns the versioned target
    pub task: String,
    /// When in the lifecycle this was recorded
    pub phase: ReportPhase,
    /// Ids of the targets covered by the key
    pub target_ids: Vec<String>,
    /// The key at the time of recording
    pub cache_key: CacheKey,
    /// Whether the key matched the last committed key
    pub valid: bool,
    /// Wall clock time of the observation
    pub recorded_at: DateTime<Utc>,
}

/// Thread-safe, append-only collection of [`ReportEntry`] values.
#[derive(Debug, Default)]
pub struct InvalidationReport {
    entries: Mutex<Vec<ReportEntry>>,
}

impl InvalidationReport {
    /// Create an empty report
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observation
    pub fn record(
        &self,
        task: &str,
        phase: ReportPhase,
        target_ids: &[String],
        cache_key: &CacheKey,
        valid: bool,
    ) {
        let entry = ReportEntry {
            task: task.to_string(),
            phase,
            target_ids: target_ids.to_vec(),
            cache_key: cache_key.clone(),
            valid,
            recorded_at: Utc::now(),
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    /// Snapshot of every entry in recording order
    #[must_use]
    pub fn entries(&self) -> Vec<ReportEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Entries recorded in `phase`
    #[must_use]
    pub fn entries_in(&self, phase: ReportPhase) -> Vec<ReportEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.phase == phase)
            .collect()
    }

    /// Atomically write the report as pretty JSON
    ///
    /// # Errors
    ///
    /// Returns an error if the report cannot be serialized or written.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.entries()).map_err(|e| {
            Error::serialization(format!("Failed to serialize invalidation report: {e}"), path)
        })?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| Error::io(e, dir, "create_dir_all"))?;
        let mut temp = NamedTempFile::new_in(dir).map_err(|e| Error::io(e, dir, "tempfile"))?;
        temp.write_all(&json)
            .map_err(|e| Error::io(e, temp.path(), "write"))?;
        temp.persist(path)
            .map_err(|e| Error::io(e.error, path, "rename"))?;
        Ok(())
    }
}
