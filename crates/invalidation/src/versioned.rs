//! Versioned targets and the results directory protocol
//!
//! A versioned target pairs one or more targets with their current
//! [`CacheKey`] and the key that was last committed for them. It owns two
//! paths computed by [`ResultsLayout`]:
//!
//! - the *unique* directory, named after the key's hash, which is where the
//!   task writes its outputs, and
//! - the *stable* path, a symlink that always points at the unique directory
//!   of the most recently created results.
//!
//! Consumers read through the stable path. Tasks that can build
//! incrementally may seed the unique directory with a copy of the previous
//! results.

use crate::build_invalidator::BuildInvalidator;
use crate::cache_key::{CacheKey, combine_cache_keys};
use crate::dirutil::{
    Replaced, copy_tree, is_real_dir, lexists, relative_symlink, safe_mkdir_clean, safe_rmtree,
};
use crate::fingerprint::Target;
use crate::layout::{ResultsLayout, TaskIdentity};
use crate::manager::InvalidationCheck;
use crate::report::{InvalidationReport, ReportPhase};
use crate::{Error, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Invoked with the finalized results of every versioned target that
/// `update()` flips from invalid to valid.
pub type WriteCallback = Arc<dyn Fn(&CompletedResults) + Send + Sync>;

/// Results of a versioned target that was just committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedResults {
    /// The committed key
    pub cache_key: CacheKey,
    /// Ids of the targets the key covers
    pub target_ids: Vec<String>,
    /// The unique results directory for the key
    pub results_dir: PathBuf,
    /// Whether a results directory was created at all
    pub has_results_dir: bool,
}

/// State shared by every versioned target produced by one manager.
#[derive(Clone)]
pub(crate) struct ManagerContext {
    pub(crate) invalidator: BuildInvalidator,
    pub(crate) layout: ResultsLayout,
    pub(crate) task: TaskIdentity,
    pub(crate) write_callback: Option<WriteCallback>,
    pub(crate) report: Option<Arc<InvalidationReport>>,
}

impl ManagerContext {
    fn record(&self, phase: ReportPhase, dir: &ResultsDir) {
        if let Some(report) = &self.report {
            report.record(
                self.task.name(),
                phase,
                &dir.target_ids,
                &dir.cache_key,
                dir.valid,
            );
        }
    }
}

/// Key, validity and on-disk paths of one versioned target or group.
pub struct ResultsDir {
    context: Arc<ManagerContext>,
    target_ids: Vec<String>,
    cache_key: CacheKey,
    previous_cache_key: Option<CacheKey>,
    valid: bool,
    is_incremental: bool,
}

impl fmt::Debug for ResultsDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultsDir")
            .field("target_ids", &self.target_ids)
            .field("cache_key", &self.cache_key)
            .field("previous_cache_key", &self.previous_cache_key)
            .field("valid", &self.valid)
            .field("is_incremental", &self.is_incremental)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ResultsDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.valid { "valid" } else { "invalid" };
        if let [only] = self.target_ids.as_slice() {
            write!(f, "VT({only}, {state})")
        } else {
            write!(f, "VTS({}, {state})", self.target_ids.join(","))
        }
    }
}

impl ResultsDir {
    pub(crate) fn open(
        context: Arc<ManagerContext>,
        cache_key: CacheKey,
        target_ids: Vec<String>,
    ) -> Result<Self> {
        let previous_cache_key = context.invalidator.previous_key(&cache_key)?;
        let valid = previous_cache_key.as_ref() == Some(&cache_key);
        let dir = Self {
            context,
            target_ids,
            cache_key,
            previous_cache_key,
            valid,
            is_incremental: false,
        };
        dir.context.record(ReportPhase::Init, &dir);
        Ok(dir)
    }

    /// Current key
    #[must_use]
    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    /// Key committed by the last successful build, if any
    #[must_use]
    pub fn previous_cache_key(&self) -> Option<&CacheKey> {
        self.previous_cache_key.as_ref()
    }

    /// Whether the current key equals the previous key
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Whether the unique directory was seeded from previous results
    #[must_use]
    pub fn is_incremental(&self) -> bool {
        self.is_incremental
    }

    /// Ids of the targets this key covers
    #[must_use]
    pub fn target_ids(&self) -> &[String] {
        &self.target_ids
    }

    /// Owning task
    #[must_use]
    pub fn task(&self) -> &TaskIdentity {
        &self.context.task
    }

    fn stable_path(&self) -> PathBuf {
        self.context.layout.stable_path(&self.cache_key)
    }

    fn unique_path(&self) -> PathBuf {
        self.context.layout.unique_path(&self.cache_key)
    }

    fn previous_path(&self) -> Option<PathBuf> {
        self.previous_cache_key
            .as_ref()
            .map(|key| self.context.layout.unique_path(key))
    }

    fn results_dir(&self) -> Result<PathBuf> {
        let stable = self.stable_path();
        if stable.is_dir() {
            Ok(stable)
        } else {
            Err(Error::missing_results_dir(self.to_string(), stable))
        }
    }

    fn unique_results_dir(&self) -> Result<PathBuf> {
        let unique = self.unique_path();
        if unique.is_dir() {
            Ok(unique)
        } else {
            Err(Error::missing_results_dir(self.to_string(), unique))
        }
    }

    fn previous_results_dir(&self) -> Option<PathBuf> {
        self.previous_path().filter(|path| is_real_dir(path))
    }

    fn has_results_dir(&self) -> bool {
        lexists(&self.stable_path())
    }

    fn live_dirs(&self) -> Vec<PathBuf> {
        if self.has_results_dir() {
            vec![self.stable_path(), self.unique_path()]
        } else {
            Vec::new()
        }
    }

    fn violations(&self) -> Vec<String> {
        let stable = self.stable_path();
        let Ok(meta) = fs::symlink_metadata(&stable) else {
            return Vec::new();
        };
        let mut violations = Vec::new();
        if !meta.file_type().is_symlink() {
            violations.push(format!(
                "The results_dir is no longer a symlink: {}",
                stable.display()
            ));
        }
        let unique = self.unique_path();
        if !is_real_dir(&unique) {
            violations.push(format!(
                "The unique_results_dir directory was not found: {}",
                unique.display()
            ));
        }
        if let Some(target) = link_target(&stable) {
            if !same_dir(&target, &unique) {
                violations.push(format!(
                    "The results_dir {} points at {} instead of {}",
                    stable.display(),
                    target.display(),
                    unique.display()
                ));
            }
        }
        violations
    }

    fn create(&mut self, allow_incremental: bool) -> Result<()> {
        let stable = self.stable_path();
        let unique = self.unique_path();

        if self.valid {
            if self.points_elsewhere(&stable, &unique) {
                relative_symlink(&unique, &stable)?;
                debug!(vt = %self, "Repointed stable results path at committed results");
            }
            return ensure_legal(self.violations());
        }

        safe_rmtree(&unique)?;
        self.is_incremental = false;
        if allow_incremental {
            if let Some(previous) = self.previous_results_dir().filter(|p| *p != unique) {
                let copied = copy_tree(&previous, &unique)?;
                self.is_incremental = true;
                debug!(vt = %self, copied, previous = %previous.display(), "Seeded results from previous build");
            }
        }
        if !self.is_incremental {
            safe_mkdir_clean(&unique)?;
        }

        if relative_symlink(&unique, &stable)? == Replaced::Directory {
            warn!(
                vt = %self,
                path = %stable.display(),
                "Removed a real directory found at the stable results path"
            );
        }
        ensure_legal(self.violations())
    }

    fn points_elsewhere(&self, stable: &Path, unique: &Path) -> bool {
        is_real_dir(unique) && link_target(stable).is_some_and(|target| !same_dir(&target, unique))
    }

    fn copy_previous_results(&mut self) -> Result<()> {
        let unique = self.unique_path();
        if let Some(previous) = self.previous_results_dir().filter(|p| *p != unique) {
            safe_rmtree(&unique)?;
            copy_tree(&previous, &unique)?;
            self.is_incremental = true;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.context.invalidator.update(&self.cache_key)?;
        self.valid = true;
        self.context.record(ReportPhase::Update, self);
        Ok(())
    }

    fn notify(&self) {
        if let Some(callback) = &self.context.write_callback {
            callback(&CompletedResults {
                cache_key: self.cache_key.clone(),
                target_ids: self.target_ids.clone(),
                results_dir: self.unique_path(),
                has_results_dir: self.has_results_dir(),
            });
        }
    }

    fn invalidate(&mut self) -> Result<()> {
        self.context.invalidator.force_invalidate(&self.cache_key)?;
        self.valid = false;
        self.context.record(ReportPhase::ForceInvalidate, self);
        Ok(())
    }

    fn same_manager(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.context, &other.context)
    }
}

/// Where the symlink at `link` points, resolved against its parent.
fn link_target(link: &Path) -> Option<PathBuf> {
    let target = fs::read_link(link).ok()?;
    Some(link.parent()?.join(target))
}

fn same_dir(a: &Path, b: &Path) -> bool {
    a == b
        || matches!(
            (fs::canonicalize(a), fs::canonicalize(b)),
            (Ok(a), Ok(b)) if a == b
        )
}

fn ensure_legal(violations: Vec<String>) -> Result<()> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(Error::IllegalResultsDir { violations })
    }
}

/// Operations shared by single targets and target groups.
///
/// Implementors only expose their [`ResultsDir`] and decide how commits fan
/// out; everything else is provided.
pub trait ResultsDirHandle {
    /// Key and path state
    fn results(&self) -> &ResultsDir;

    /// Mutable key and path state
    fn results_mut(&mut self) -> &mut ResultsDir;

    /// Every broken invariant, for this handle and anything it contains
    fn violations(&self) -> Vec<String> {
        self.results().violations()
    }

    /// Mark the results as successfully built and fire the write callback
    /// for everything that changed.
    ///
    /// # Errors
    ///
    /// Returns `IllegalResultsDir` if the directories were tampered with, or
    /// an I/O error if the key could not be committed.
    fn update(&mut self) -> Result<()>;

    /// Like [`ResultsDirHandle::update`] but without the write callback, for
    /// results that were just restored from an artifact cache.
    ///
    /// # Errors
    ///
    /// As [`ResultsDirHandle::update`].
    fn update_restored(&mut self) -> Result<()>;

    /// Forget the committed key so the next check sees the target as
    /// invalid. Directories are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be removed.
    fn force_invalidate(&mut self) -> Result<()>;

    /// Ids of the covered targets
    fn target_ids(&self) -> &[String] {
        self.results().target_ids()
    }

    /// Current key
    fn cache_key(&self) -> &CacheKey {
        self.results().cache_key()
    }

    /// Key of the last successful build
    fn previous_cache_key(&self) -> Option<&CacheKey> {
        self.results().previous_cache_key()
    }

    /// Whether the results are up to date
    fn is_valid(&self) -> bool {
        self.results().is_valid()
    }

    /// Whether the results directory was seeded from previous results
    fn is_incremental(&self) -> bool {
        self.results().is_incremental()
    }

    /// The stable results path
    ///
    /// # Errors
    ///
    /// Returns `MissingResultsDir` if it has not been created.
    fn results_dir(&self) -> Result<PathBuf> {
        self.results().results_dir()
    }

    /// The directory unique to the current key
    ///
    /// # Errors
    ///
    /// Returns `MissingResultsDir` if it has not been created.
    fn unique_results_dir(&self) -> Result<PathBuf> {
        self.results().unique_results_dir()
    }

    /// Unique directory of the previous key, when it still exists
    fn previous_results_dir(&self) -> Option<PathBuf> {
        self.results().previous_results_dir()
    }

    /// Whether anything exists at the stable path
    fn has_results_dir(&self) -> bool {
        self.results().has_results_dir()
    }

    /// Paths that must survive garbage collection
    fn live_dirs(&self) -> Vec<PathBuf> {
        self.results().live_dirs()
    }

    /// Check the stable/unique directory invariant without repairing it
    ///
    /// # Errors
    ///
    /// Returns `IllegalResultsDir` listing every violation.
    fn ensure_legal(&self) -> Result<()> {
        ensure_legal(self.violations())
    }

    /// Prepare the results directory. Invalid targets get a fresh unique
    /// directory, seeded from the previous results when `allow_incremental`
    /// is set, and the stable symlink is repointed at it.
    ///
    /// # Errors
    ///
    /// Returns an I/O error, or `IllegalResultsDir` if the final state is
    /// inconsistent.
    fn create_results_dir(&mut self, allow_incremental: bool) -> Result<()> {
        self.results_mut().create(allow_incremental)
    }

    /// Replace the unique directory with a copy of the previous results
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails.
    fn copy_previous_results(&mut self) -> Result<()> {
        self.results_mut().copy_previous_results()
    }
}

/// A single target and its key.
pub struct SingleTargetVersion<T> {
    target: T,
    dir: ResultsDir,
}

impl<T: Target> SingleTargetVersion<T> {
    pub(crate) fn open(context: Arc<ManagerContext>, target: T, cache_key: CacheKey) -> Result<Self> {
        let dir = ResultsDir::open(context, cache_key, vec![target.id().to_string()])?;
        Ok(Self { target, dir })
    }

    /// The wrapped target
    #[must_use]
    pub fn target(&self) -> &T {
        &self.target
    }

    fn commit(&mut self, notify: bool) -> Result<()> {
        self.ensure_legal()?;
        if !self.dir.valid {
            self.dir.commit()?;
            if notify {
                self.dir.notify();
            }
        }
        Ok(())
    }
}

impl<T: Target> ResultsDirHandle for SingleTargetVersion<T> {
    fn results(&self) -> &ResultsDir {
        &self.dir
    }

    fn results_mut(&mut self) -> &mut ResultsDir {
        &mut self.dir
    }

    fn update(&mut self) -> Result<()> {
        self.commit(true)
    }

    fn update_restored(&mut self) -> Result<()> {
        self.commit(false)
    }

    fn force_invalidate(&mut self) -> Result<()> {
        self.dir.invalidate()
    }
}

impl<T> fmt::Display for SingleTargetVersion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.dir, f)
    }
}

impl<T: fmt::Debug> fmt::Debug for SingleTargetVersion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleTargetVersion")
            .field("target", &self.target)
            .field("dir", &self.dir)
            .finish()
    }
}

/// Several versioned targets built together under one combined key.
pub struct TargetGroupVersion<T> {
    members: Vec<SingleTargetVersion<T>>,
    dir: ResultsDir,
}

impl<T: Target> TargetGroupVersion<T> {
    /// Combine versioned targets produced by the same manager
    ///
    /// # Errors
    ///
    /// Returns `EmptyTargetSet` for no members and `MixedManagers` if the
    /// members come from different managers.
    pub fn from_versioned_targets(members: Vec<SingleTargetVersion<T>>) -> Result<Self> {
        let first = members.first().ok_or(Error::EmptyTargetSet)?;
        if let Some(other) = members.iter().find(|vt| !vt.dir.same_manager(&first.dir)) {
            return Err(Error::MixedManagers {
                first: first.to_string(),
                other: other.to_string(),
            });
        }

        let keys: Vec<CacheKey> = members.iter().map(|vt| vt.dir.cache_key.clone()).collect();
        let cache_key = combine_cache_keys(&keys)?;
        let target_ids = members.iter().map(|vt| vt.target.id().to_string()).collect();
        let dir = ResultsDir::open(Arc::clone(&first.dir.context), cache_key, target_ids)?;
        Ok(Self { members, dir })
    }

    /// Combine every versioned target of a check into one group
    ///
    /// # Errors
    ///
    /// Returns `EmptyTargetSet` if the check covers no targets.
    pub fn from_invalidation_check(check: InvalidationCheck<T>) -> Result<Self> {
        Self::from_versioned_targets(check.into_all_vts())
    }

    /// Member versioned targets
    #[must_use]
    pub fn members(&self) -> &[SingleTargetVersion<T>] {
        &self.members
    }

    /// Mutable member versioned targets
    pub fn members_mut(&mut self) -> &mut [SingleTargetVersion<T>] {
        &mut self.members
    }

    /// Dissolve the group into its members
    #[must_use]
    pub fn into_members(self) -> Vec<SingleTargetVersion<T>> {
        self.members
    }

    /// The wrapped targets
    pub fn targets(&self) -> impl Iterator<Item = &T> {
        self.members.iter().map(SingleTargetVersion::target)
    }

    fn commit(&mut self, notify: bool) -> Result<()> {
        self.ensure_legal()?;
        for member in &mut self.members {
            if !member.dir.valid {
                member.dir.commit()?;
                if notify {
                    member.dir.notify();
                }
            }
        }
        if !self.dir.valid {
            self.dir.commit()?;
            if notify {
                self.dir.notify();
            }
        }
        Ok(())
    }
}

impl<T: Target> ResultsDirHandle for TargetGroupVersion<T> {
    fn results(&self) -> &ResultsDir {
        &self.dir
    }

    fn results_mut(&mut self) -> &mut ResultsDir {
        &mut self.dir
    }

    fn violations(&self) -> Vec<String> {
        let mut violations = self.dir.violations();
        for member in &self.members {
            violations.extend(member.violations());
        }
        violations
    }

    fn update(&mut self) -> Result<()> {
        self.commit(true)
    }

    fn update_restored(&mut self) -> Result<()> {
        self.commit(false)
    }

    fn force_invalidate(&mut self) -> Result<()> {
        for member in &mut self.members {
            member.dir.invalidate()?;
        }
        self.dir.invalidate()
    }
}

impl<T> fmt::Display for TargetGroupVersion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.dir, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebuilt_target_graph::TargetNode;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Debug)]
    struct Leaf(String);

    impl TargetNode for Leaf {
        fn id(&self) -> &str {
            &self.0
        }

        fn dependency_ids(&self) -> impl Iterator<Item = &str> {
            std::iter::empty()
        }
    }

    impl Target for Leaf {
        fn spec_path(&self) -> &str {
            "BUILD"
        }
    }

    fn context(root: &Path, callback: Option<WriteCallback>) -> Arc<ManagerContext> {
        let task = TaskIdentity::new("compile", "1");
        Arc::new(ManagerContext {
            invalidator: BuildInvalidator::new(root.join("invalidator")),
            layout: ResultsLayout::new(root.join("results"), &task),
            task,
            write_callback: callback,
            report: None,
        })
    }

    fn vt(context: &Arc<ManagerContext>, id: &str, hash: &str) -> SingleTargetVersion<Leaf> {
        SingleTargetVersion::open(
            Arc::clone(context),
            Leaf(id.to_string()),
            CacheKey::new(id, hash),
        )
        .unwrap()
    }

    #[test]
    fn test_display() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), None);
        assert_eq!(vt(&ctx, "a", "1").to_string(), "VT(a, invalid)");
    }

    #[test]
    fn test_results_dir_missing_before_create() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), None);
        let vt = vt(&ctx, "a", "1");
        assert!(matches!(vt.results_dir(), Err(Error::MissingResultsDir { .. })));
        assert!(vt.live_dirs().is_empty());
        assert!(!vt.has_results_dir());
    }

    #[test]
    fn test_create_then_update_fires_callback_once() {
        let tmp = TempDir::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: WriteCallback = Arc::new(move |done: &CompletedResults| {
            sink.lock().unwrap().push(done.cache_key.clone());
        });
        let ctx = context(tmp.path(), Some(callback));

        let mut vt = vt(&ctx, "a", "1");
        vt.create_results_dir(false).unwrap();
        assert!(fs::symlink_metadata(vt.results_dir().unwrap()).unwrap().file_type().is_symlink());
        vt.update().unwrap();
        vt.update().unwrap();

        assert!(vt.is_valid());
        assert_eq!(seen.lock().unwrap().as_slice(), &[CacheKey::new("a", "1")]);
    }

    #[test]
    fn test_update_restored_skips_callback() {
        let tmp = TempDir::new().unwrap();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        let callback: WriteCallback = Arc::new(move |_: &CompletedResults| {
            *sink.lock().unwrap() += 1;
        });
        let ctx = context(tmp.path(), Some(callback));

        let mut vt = vt(&ctx, "a", "1");
        vt.create_results_dir(false).unwrap();
        vt.update_restored().unwrap();
        assert!(vt.is_valid());
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn test_group_rejects_mixed_managers() {
        let tmp = TempDir::new().unwrap();
        let one = context(tmp.path(), None);
        let two = context(tmp.path(), None);
        let err = TargetGroupVersion::from_versioned_targets(vec![vt(&one, "a", "1"), vt(&two, "b", "2")])
            .err()
            .unwrap();
        assert!(matches!(err, Error::MixedManagers { .. }));
    }

    #[test]
    fn test_group_rejects_empty() {
        let err = TargetGroupVersion::<Leaf>::from_versioned_targets(Vec::new())
            .err()
            .unwrap();
        assert!(matches!(err, Error::EmptyTargetSet));
    }

    #[test]
    fn test_group_update_commits_members() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), None);
        let mut group =
            TargetGroupVersion::from_versioned_targets(vec![vt(&ctx, "a", "1"), vt(&ctx, "b", "2")]).unwrap();
        assert_eq!(group.to_string(), "VTS(a,b, invalid)");
        group.create_results_dir(false).unwrap();
        group.update().unwrap();

        assert!(group.members().iter().all(ResultsDirHandle::is_valid));
        assert!(vt(&ctx, "a", "1").is_valid());
        assert!(vt(&ctx, "b", "2").is_valid());

        group.force_invalidate().unwrap();
        assert!(!group.is_valid());
        assert!(!vt(&ctx, "a", "1").is_valid());
    }

    #[cfg(unix)]
    #[test]
    fn test_valid_target_repoints_stale_link() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), None);

        let mut first = vt(&ctx, "a", "1");
        first.create_results_dir(false).unwrap();
        first.update().unwrap();
        let committed = first.unique_results_dir().unwrap();

        // A later build that never committed leaves the link on its own dir
        let mut abandoned = vt(&ctx, "a", "2");
        abandoned.create_results_dir(false).unwrap();

        let mut again = vt(&ctx, "a", "1");
        assert!(again.is_valid());
        again.create_results_dir(false).unwrap();
        assert_eq!(fs::canonicalize(again.results_dir().unwrap()).unwrap(), fs::canonicalize(committed).unwrap());
    }
}
