//! Invalidation configuration and working directory resolution

use crate::layout::{TaskIdentity, sanitize_component};
use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable overriding the working directory
pub const WORKDIR_ENV: &str = "REBUILT_WORKDIR";

/// Where and how one task's targets are versioned.
///
/// Immutable once built; every `with_*` method returns a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationConfig {
    task: TaskIdentity,
    results_root: PathBuf,
    invalidator_dir: PathBuf,
    #[serde(default = "default_true")]
    invalidate_dependents: bool,
    #[serde(default)]
    as_target_set: bool,
}

fn default_true() -> bool {
    true
}

impl InvalidationConfig {
    /// Configuration with explicit directories
    #[must_use]
    pub fn new(
        task: TaskIdentity,
        results_root: impl Into<PathBuf>,
        invalidator_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            task,
            results_root: results_root.into(),
            invalidator_dir: invalidator_dir.into(),
            invalidate_dependents: true,
            as_target_set: false,
        }
    }

    /// Conventional layout under a shared working directory:
    /// results in `<workdir>/<task>` and invalidation records in
    /// `<workdir>/build_invalidator/<task>`.
    #[must_use]
    pub fn for_task(workdir: &Path, task: TaskIdentity) -> Self {
        let name = sanitize_component(task.name()).into_owned();
        let results_root = workdir.join(&name);
        let invalidator_dir = workdir.join("build_invalidator").join(&name);
        Self::new(task, results_root, invalidator_dir)
    }

    /// Same as [`InvalidationConfig::for_task`] under [`default_workdir`]
    ///
    /// # Errors
    ///
    /// Returns an error if no writable working directory can be found.
    pub fn for_task_in_default_workdir(task: TaskIdentity) -> Result<Self> {
        Ok(Self::for_task(&default_workdir()?, task))
    }

    /// Whether keys fold in the keys of dependencies
    #[must_use]
    pub fn with_invalidate_dependents(mut self, invalidate_dependents: bool) -> Self {
        self.invalidate_dependents = invalidate_dependents;
        self
    }

    /// Whether tasks should treat every check as one target set
    #[must_use]
    pub fn with_as_target_set(mut self, as_target_set: bool) -> Self {
        self.as_target_set = as_target_set;
        self
    }

    /// Owning task
    #[must_use]
    pub fn task(&self) -> &TaskIdentity {
        &self.task
    }

    /// Root of the results tree
    #[must_use]
    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    /// Directory of invalidation records
    #[must_use]
    pub fn invalidator_dir(&self) -> &Path {
        &self.invalidator_dir
    }

    /// Whether keys are transitive
    #[must_use]
    pub fn invalidate_dependents(&self) -> bool {
        self.invalidate_dependents
    }

    /// Whether checks are meant to be handled as one target set
    #[must_use]
    pub fn as_target_set(&self) -> bool {
        self.as_target_set
    }

    /// Reject configurations that would mix records and results
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.task.name().trim().is_empty() {
            return Err(Error::configuration("task name must not be empty"));
        }
        if self.results_root.as_os_str().is_empty() {
            return Err(Error::configuration("results root must not be empty"));
        }
        if self.invalidator_dir.as_os_str().is_empty() {
            return Err(Error::configuration("invalidator directory must not be empty"));
        }
        if self.results_root == self.invalidator_dir {
            return Err(Error::configuration(format!(
                "results root and invalidator directory must differ: {}",
                self.results_root.display()
            )));
        }
        Ok(())
    }
}

/// Placeholder home of sandboxed Nix builds, never writable
const NIX_SANDBOX_HOME: &str = "/homeless-shelter";

/// Environment-derived locations the working directory may live in
#[derive(Debug, Clone, Default)]
struct WorkdirInputs {
    override_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

impl WorkdirInputs {
    /// Candidate directories, most preferred first
    fn candidates(self) -> Vec<PathBuf> {
        let cache_homes = [self.xdg_cache_home, self.os_cache_dir]
            .into_iter()
            .flatten()
            .map(|dir| dir.join("rebuilt"));
        self.override_dir
            .filter(|dir| !dir.as_os_str().is_empty())
            .into_iter()
            .chain(cache_homes)
            .chain(self.home_dir.map(|home| home.join(".rebuilt").join("cache")))
            .chain(std::iter::once(self.temp_dir.join("rebuilt").join("cache")))
            .filter(|dir| !dir.starts_with(NIX_SANDBOX_HOME))
            .collect()
    }
}

/// Whether files can be created in `dir`, creating it first when missing.
/// Existing read-only cache directories are common on CI runners.
fn is_usable_workdir(dir: &Path) -> bool {
    fs::create_dir_all(dir).is_ok() && tempfile::tempfile_in(dir).is_ok()
}

fn workdir_from_inputs(inputs: WorkdirInputs) -> Result<PathBuf> {
    let candidates = inputs.candidates();
    if let Some(dir) = candidates.iter().find(|dir| is_usable_workdir(dir)) {
        debug!(workdir = %dir.display(), "Resolved working directory");
        return Ok(dir.clone());
    }
    let tried: Vec<String> = candidates.iter().map(|dir| dir.display().to_string()).collect();
    Err(Error::configuration(format!(
        "no writable working directory among: {}",
        tried.join(", ")
    )))
}

fn non_empty_env(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

/// Resolve the shared working directory from the environment
///
/// # Errors
///
/// Returns an error if none of the candidates is writable.
pub fn default_workdir() -> Result<PathBuf> {
    workdir_from_inputs(WorkdirInputs {
        override_dir: non_empty_env(WORKDIR_ENV),
        xdg_cache_home: non_empty_env("XDG_CACHE_HOME"),
        os_cache_dir: cache_dir(),
        home_dir: home_dir(),
        temp_dir: std::env::temp_dir(),
    })
}
