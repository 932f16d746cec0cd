//! Writes committed results to an artifact cache

use crate::cache::ArtifactCache;
use crate::{Error, Result};
use rebuilt_invalidation::{CompletedResults, WriteCallback};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Counts of artifacts written and failed so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Artifacts stored successfully
    pub written: usize,
    /// Artifacts that could not be stored
    pub failed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicUsize,
    failed: AtomicUsize,
}

impl Counters {
    fn summary(&self) -> WriteSummary {
        WriteSummary {
            written: self.written.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Turns every committed results directory into an artifact.
///
/// Install it on a manager through [`ArtifactWriter::callback`]. Failures are
/// logged and counted but never reach the build.
pub struct ArtifactWriter {
    cache: Arc<dyn ArtifactCache>,
    counters: Arc<Counters>,
    background: bool,
    queue: Mutex<Option<Sender<CompletedResults>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ArtifactWriter {
    /// Write each artifact before `update()` returns
    #[must_use]
    pub fn synchronous(cache: Arc<dyn ArtifactCache>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            counters: Arc::default(),
            background: false,
            queue: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Queue artifacts to a worker thread; call [`ArtifactWriter::finish`]
    /// to wait for them
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the worker thread cannot be spawned.
    pub fn background(cache: Arc<dyn ArtifactCache>) -> Result<Arc<Self>> {
        let (sender, receiver) = mpsc::channel::<CompletedResults>();
        let counters: Arc<Counters> = Arc::default();

        let worker_cache = Arc::clone(&cache);
        let worker_counters = Arc::clone(&counters);
        let worker = thread::Builder::new()
            .name("artifact-writer".to_string())
            .spawn(move || {
                for done in receiver {
                    write_artifact(worker_cache.as_ref(), &worker_counters, &done);
                }
                debug!("Artifact writer drained");
            })
            .map_err(|e| Error::io_no_path(e, "spawn artifact writer"))?;

        Ok(Arc::new(Self {
            cache,
            counters,
            background: true,
            queue: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Callback to install with `InvalidationCacheManager::with_write_callback`
    #[must_use]
    pub fn callback(self: &Arc<Self>) -> WriteCallback {
        let writer = Arc::clone(self);
        Arc::new(move |done: &CompletedResults| writer.write(done))
    }

    /// The cache artifacts are written to
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn ArtifactCache> {
        &self.cache
    }

    /// Write or enqueue one committed result
    pub fn write(&self, done: &CompletedResults) {
        if !done.has_results_dir {
            debug!(key = %done.cache_key, "No results directory to cache");
            return;
        }

        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        match queue.as_ref() {
            Some(sender) => {
                if sender.send(done.clone()).is_err() {
                    warn!(key = %done.cache_key, "Artifact writer has stopped; artifact dropped");
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                }
            }
            None if self.background => {
                warn!(key = %done.cache_key, "Artifact writer already finished; artifact dropped");
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
            }
            None => write_artifact(self.cache.as_ref(), &self.counters, done),
        }
    }

    /// Wait for queued artifacts and stop accepting new ones. A synchronous
    /// writer has nothing to wait for.
    pub fn finish(&self) -> WriteSummary {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            warn!("Artifact writer thread panicked");
        }
        self.summary()
    }

    /// Counts so far
    #[must_use]
    pub fn summary(&self) -> WriteSummary {
        self.counters.summary()
    }
}

fn write_artifact(cache: &dyn ArtifactCache, counters: &Counters, done: &CompletedResults) {
    match cache.try_insert(&done.cache_key, std::slice::from_ref(&done.results_dir)) {
        Ok(()) => {
            counters.written.fetch_add(1, Ordering::SeqCst);
            debug!(key = %done.cache_key, "Cached artifact");
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            if e.is_nonfatal() {
                warn!(key = %done.cache_key, "Artifact kept locally only: {e}");
            } else {
                warn!(key = %done.cache_key, "Failed to cache artifact: {e}");
            }
        }
    }
}
