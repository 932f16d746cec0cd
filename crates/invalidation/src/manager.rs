//! Batch invalidation checks over a set of targets

use crate::build_invalidator::BuildInvalidator;
use crate::cache_key::CacheKey;
use crate::config::InvalidationConfig;
use crate::fingerprint::{CacheKeyGenerator, FingerprintStrategy, Target};
use crate::layout::{ResultsLayout, TaskIdentity};
use crate::report::InvalidationReport;
use crate::versioned::{
    ManagerContext, ResultsDirHandle, SingleTargetVersion, TargetGroupVersion, WriteCallback,
};
use crate::{Error, Result};
use rayon::prelude::*;
use rebuilt_target_graph::TargetGraph;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Checks targets against their last committed keys and tracks commits.
///
/// Every versioned target created by one manager shares the manager's
/// invalidator, layout, write callback and report.
pub struct InvalidationCacheManager<T: Target, G> {
    context: Arc<ManagerContext>,
    generator: G,
    strategy: Box<dyn FingerprintStrategy<T>>,
    invalidate_dependents: bool,
    as_target_set: bool,
}

impl<T, G> InvalidationCacheManager<T, G>
where
    T: Target + 'static,
    G: CacheKeyGenerator<T>,
{
    /// Create a manager for the task described by `config`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(
        config: &InvalidationConfig,
        generator: G,
        strategy: impl FingerprintStrategy<T> + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let context = ManagerContext {
            invalidator: BuildInvalidator::new(config.invalidator_dir()),
            layout: ResultsLayout::new(config.results_root(), config.task()),
            task: config.task().clone(),
            write_callback: None,
            report: None,
        };
        Ok(Self {
            context: Arc::new(context),
            generator,
            strategy: Box::new(strategy),
            invalidate_dependents: config.invalidate_dependents(),
            as_target_set: config.as_target_set(),
        })
    }

    /// Fire `callback` whenever `update()` commits new results
    #[must_use]
    pub fn with_write_callback(mut self, callback: WriteCallback) -> Self {
        let mut context = (*self.context).clone();
        context.write_callback = Some(callback);
        self.context = Arc::new(context);
        self
    }

    /// Record every versioned target's validity in `report`
    #[must_use]
    pub fn with_report(mut self, report: Arc<InvalidationReport>) -> Self {
        let mut context = (*self.context).clone();
        context.report = Some(report);
        self.context = Arc::new(context);
        self
    }

    /// Owning task
    #[must_use]
    pub fn task(&self) -> &TaskIdentity {
        &self.context.task
    }

    /// Path computation for this task's results
    #[must_use]
    pub fn layout(&self) -> &ResultsLayout {
        &self.context.layout
    }

    /// The key generator
    #[must_use]
    pub fn generator(&self) -> &G {
        &self.generator
    }

    /// Whether checks are meant to be handled as one target set
    #[must_use]
    pub fn as_target_set(&self) -> bool {
        self.as_target_set
    }

    /// Version every target and split out the ones whose key changed.
    ///
    /// Targets the fingerprint strategy opts out of are left out of both
    /// lists.
    ///
    /// # Errors
    ///
    /// Returns `CacheValidation` for the first target, in iteration order,
    /// whose key could not be computed. Nothing is committed in that case.
    pub fn check(&self, targets: &[T], topological_order: bool) -> Result<InvalidationCheck<T>> {
        let all_vts = self.wrap_targets(targets, topological_order)?;
        let check = InvalidationCheck::new(all_vts, self.as_target_set);
        info!(
            task = self.context.task.name(),
            total = check.all_vts().len(),
            invalid = check.invalid_count(),
            "Checked targets"
        );
        Ok(check)
    }

    /// Wrap each target with its current key, in id order or with
    /// dependencies first. Dependencies reached only through targets outside
    /// the batch still come first when the generator exposes its graph.
    ///
    /// # Errors
    ///
    /// As [`InvalidationCacheManager::check`], plus a graph error if
    /// `topological_order` is requested for targets that form a cycle.
    pub fn wrap_targets(
        &self,
        targets: &[T],
        topological_order: bool,
    ) -> Result<Vec<SingleTargetVersion<T>>> {
        let ordered: Vec<T> = if topological_order {
            // Batch targets come first so their definitions win over the closure's
            let batch: HashSet<&str> = targets.iter().map(|target| target.id()).collect();
            let closure = self
                .generator
                .dependency_graph()
                .into_iter()
                .flat_map(|graph| graph.iter())
                .cloned();
            let graph = TargetGraph::from_subset(targets.iter().cloned().chain(closure))?;
            graph
                .topological_sort()?
                .into_iter()
                .filter(|target| batch.contains(target.id()))
                .cloned()
                .collect()
        } else {
            let mut sorted = targets.to_vec();
            sorted.sort_by(|a, b| a.id().cmp(b.id()));
            sorted.dedup_by(|a, b| a.id() == b.id());
            sorted
        };

        let keys: Vec<Result<Option<CacheKey>>> = ordered
            .par_iter()
            .map(|target| self.key_for(target))
            .collect();

        let mut vts = Vec::with_capacity(ordered.len());
        for (target, key) in ordered.into_iter().zip(keys) {
            match key? {
                Some(key) => {
                    vts.push(SingleTargetVersion::open(Arc::clone(&self.context), target, key)?);
                }
                None => debug!(target = target.id(), "Fingerprint strategy opted target out"),
            }
        }
        Ok(vts)
    }

    fn key_for(&self, target: &T) -> Result<Option<CacheKey>> {
        self.generator
            .key_for_target(target, self.invalidate_dependents, &*self.strategy)
            .map_err(|source| Error::CacheValidation {
                target: target.id().to_string(),
                spec_path: target.spec_path().to_string(),
                source,
            })
    }

    /// Commit a versioned target or group
    ///
    /// # Errors
    ///
    /// See [`ResultsDirHandle::update`].
    pub fn update(&self, vts: &mut dyn ResultsDirHandle) -> Result<()> {
        vts.update()
    }

    /// Forget a versioned target or group
    ///
    /// # Errors
    ///
    /// See [`ResultsDirHandle::force_invalidate`].
    pub fn force_invalidate(&self, vts: &mut dyn ResultsDirHandle) -> Result<()> {
        vts.force_invalidate()
    }

    /// Last committed key for `cache_key.id()`
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read.
    pub fn previous_key(&self, cache_key: &CacheKey) -> Result<Option<CacheKey>> {
        self.context.invalidator.previous_key(cache_key)
    }
}

/// Outcome of [`InvalidationCacheManager::check`].
///
/// The invalid subset is fixed when the check is made; committing a target
/// later does not remove it from [`InvalidationCheck::invalid_vts`].
pub struct InvalidationCheck<T> {
    all_vts: Vec<SingleTargetVersion<T>>,
    invalid: Vec<usize>,
    as_target_set: bool,
}

impl<T: Target> InvalidationCheck<T> {
    /// Build a check over `all_vts`, recording which are currently invalid
    #[must_use]
    pub fn new(all_vts: Vec<SingleTargetVersion<T>>, as_target_set: bool) -> Self {
        let invalid = all_vts
            .iter()
            .enumerate()
            .filter(|(_, vt)| !vt.is_valid())
            .map(|(index, _)| index)
            .collect();
        Self {
            all_vts,
            invalid,
            as_target_set,
        }
    }

    /// Every versioned target, valid or not
    #[must_use]
    pub fn all_vts(&self) -> &[SingleTargetVersion<T>] {
        &self.all_vts
    }

    /// Mutable access to every versioned target
    pub fn all_vts_mut(&mut self) -> &mut [SingleTargetVersion<T>] {
        &mut self.all_vts
    }

    /// Versioned targets that were invalid when checked
    pub fn invalid_vts(&self) -> impl Iterator<Item = &SingleTargetVersion<T>> {
        self.invalid.iter().map(|&index| &self.all_vts[index])
    }

    /// Mutable versioned targets that were invalid when checked
    pub fn invalid_vts_mut(&mut self) -> impl Iterator<Item = &mut SingleTargetVersion<T>> {
        let invalid = &self.invalid;
        self.all_vts
            .iter_mut()
            .enumerate()
            .filter(move |(index, _)| invalid.binary_search(index).is_ok())
            .map(|(_, vt)| vt)
    }

    /// Number of targets that were invalid when checked
    #[must_use]
    pub fn invalid_count(&self) -> usize {
        self.invalid.len()
    }

    /// Whether the owning manager asked for the check to be treated as one
    /// target set
    #[must_use]
    pub fn as_target_set(&self) -> bool {
        self.as_target_set
    }

    /// Take every versioned target
    #[must_use]
    pub fn into_all_vts(self) -> Vec<SingleTargetVersion<T>> {
        self.all_vts
    }

    /// Combine every versioned target into one group
    ///
    /// # Errors
    ///
    /// Returns `EmptyTargetSet` if the check covers no targets.
    pub fn into_target_set(self) -> Result<TargetGroupVersion<T>> {
        TargetGroupVersion::from_invalidation_check(self)
    }
}
