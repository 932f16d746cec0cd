//! A cache manager that also reads and writes artifacts

use crate::cache::{ArtifactCache, CacheOutcome};
use crate::writer::{ArtifactWriter, WriteSummary};
use crate::Result;
use rebuilt_invalidation::{
    CacheKeyGenerator, InvalidationCacheManager, InvalidationCheck, ResultsDirHandle, Target,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How committed results reach the artifact cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Before `update()` returns
    #[default]
    Synchronous,
    /// On a worker thread, drained by [`CachedResults::finish`]
    Background,
}

/// Wraps an [`InvalidationCacheManager`] so that invalid targets are
/// restored from an artifact cache when possible, and freshly built results
/// are written back to it.
pub struct CachedResults<T: Target, G> {
    manager: InvalidationCacheManager<T, G>,
    cache: Option<Arc<dyn ArtifactCache>>,
    writer: Option<Arc<ArtifactWriter>>,
}

impl<T, G> CachedResults<T, G>
where
    T: Target + 'static,
    G: CacheKeyGenerator<T>,
{
    /// No artifact cache: behaves exactly like the manager
    #[must_use]
    pub fn new(manager: InvalidationCacheManager<T, G>) -> Self {
        Self {
            manager,
            cache: None,
            writer: None,
        }
    }

    /// Read from and write to `cache`
    ///
    /// # Errors
    ///
    /// Returns an error if a background writer cannot be started.
    pub fn with_artifact_cache(
        manager: InvalidationCacheManager<T, G>,
        cache: Arc<dyn ArtifactCache>,
        mode: WriteMode,
    ) -> Result<Self> {
        let writer = match mode {
            WriteMode::Synchronous => ArtifactWriter::synchronous(Arc::clone(&cache)),
            WriteMode::Background => ArtifactWriter::background(Arc::clone(&cache))?,
        };
        let manager = manager.with_write_callback(writer.callback());
        Ok(Self {
            manager,
            cache: Some(cache),
            writer: Some(writer),
        })
    }

    /// The wrapped manager
    #[must_use]
    pub fn manager(&self) -> &InvalidationCacheManager<T, G> {
        &self.manager
    }

    /// Check `targets`, then restore every invalid target the cache has an
    /// artifact for. The returned check only lists targets that still need
    /// to be built.
    ///
    /// # Errors
    ///
    /// As [`InvalidationCacheManager::check`], plus I/O errors while
    /// preparing results directories. Missing or corrupt artifacts are not
    /// errors; those targets are simply left invalid.
    pub fn check(&self, targets: &[T], topological_order: bool) -> Result<InvalidationCheck<T>> {
        let mut check = self.manager.check(targets, topological_order)?;
        let Some(cache) = &self.cache else {
            return Ok(check);
        };

        let mut restored = 0;
        for vt in check.invalid_vts_mut() {
            if restore(cache.as_ref(), vt)? {
                restored += 1;
            }
        }
        if restored > 0 {
            info!(
                task = self.manager.task().name(),
                restored, "Restored results from the artifact cache"
            );
        }

        let as_target_set = check.as_target_set();
        Ok(InvalidationCheck::new(check.into_all_vts(), as_target_set))
    }

    /// Commit built results; with an artifact cache they are also written
    /// back to it.
    ///
    /// # Errors
    ///
    /// See [`InvalidationCacheManager::update`]. Artifact write failures are
    /// logged, not returned.
    pub fn update(&self, vts: &mut dyn ResultsDirHandle) -> Result<()> {
        self.manager.update(vts)?;
        Ok(())
    }

    /// Forget the committed key of `vts`
    ///
    /// # Errors
    ///
    /// See [`InvalidationCacheManager::force_invalidate`].
    pub fn force_invalidate(&self, vts: &mut dyn ResultsDirHandle) -> Result<()> {
        self.manager.force_invalidate(vts)?;
        Ok(())
    }

    /// Wait for background writes. Returns `None` without an artifact cache.
    pub fn finish(&self) -> Option<WriteSummary> {
        self.writer.as_ref().map(|writer| writer.finish())
    }
}

/// Try to satisfy one invalid target from the cache
fn restore(cache: &dyn ArtifactCache, vt: &mut dyn ResultsDirHandle) -> Result<bool> {
    let key = vt.cache_key().clone();
    if !cache.has(&key) {
        return Ok(false);
    }

    vt.create_results_dir(false)?;
    let results_dir = vt.unique_results_dir()?;
    match cache.use_cached_files(&key, Some(&results_dir))? {
        CacheOutcome::Restored => {
            vt.update_restored()?;
            debug!(key = %key, "Restored results");
            Ok(true)
        }
        CacheOutcome::NotFound => Ok(false),
        CacheOutcome::Unreadable(unreadable) => {
            warn!(key = %key, "Rebuilding after cache read failure: {unreadable}");
            Ok(false)
        }
    }
}
