//! Shared fixtures for invalidation integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use rebuilt_invalidation::{
    FingerprintError, FingerprintStrategy, InvalidationCacheManager, InvalidationConfig,
    SourceFingerprintStrategy, Target, TargetNode, TaskIdentity, TransitiveKeyGenerator,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// A library target with source files under the build root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lib {
    pub id: String,
    pub deps: Vec<String>,
    pub sources: Vec<PathBuf>,
}

impl Lib {
    pub fn new(id: &str, deps: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            deps: deps.iter().map(ToString::to_string).collect(),
            sources: vec![PathBuf::from(format!("{id}.src"))],
        }
    }
}

impl TargetNode for Lib {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.deps.iter().map(String::as_str)
    }
}

impl Target for Lib {
    fn spec_path(&self) -> &str {
        "src/BUILD"
    }

    fn sources(&self) -> &[PathBuf] {
        &self.sources
    }
}

/// Hashes sources but opts some targets out and fails for others
pub struct SelectiveStrategy {
    inner: SourceFingerprintStrategy,
    opted_out: Vec<String>,
    failing: Vec<String>,
}

impl SelectiveStrategy {
    pub fn new(buildroot: &Path, opted_out: &[&str], failing: &[&str]) -> Self {
        Self {
            inner: SourceFingerprintStrategy::new(buildroot),
            opted_out: opted_out.iter().map(ToString::to_string).collect(),
            failing: failing.iter().map(ToString::to_string).collect(),
        }
    }
}

impl FingerprintStrategy<Lib> for SelectiveStrategy {
    fn name(&self) -> &str {
        "selective"
    }

    fn fingerprint_target(&self, target: &Lib) -> Result<Option<String>, FingerprintError> {
        if self.failing.iter().any(|id| id == &target.id) {
            return Err(FingerprintError::strategy(format!("cannot fingerprint {}", target.id)));
        }
        if self.opted_out.iter().any(|id| id == &target.id) {
            return Ok(None);
        }
        self.inner.fingerprint_target(target)
    }
}

pub type Manager = InvalidationCacheManager<Lib, TransitiveKeyGenerator<Lib>>;

/// A build root with source files plus a working directory
pub struct Workspace {
    pub tmp: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("buildroot")).unwrap();
        Self { tmp }
    }

    pub fn buildroot(&self) -> PathBuf {
        self.tmp.path().join("buildroot")
    }

    pub fn workdir(&self) -> PathBuf {
        self.tmp.path().join("workdir")
    }

    /// Write the single source file of `id`
    pub fn write_source(&self, id: &str, content: &str) {
        std::fs::write(self.buildroot().join(format!("{id}.src")), content).unwrap();
    }

    /// Write a source for every target that does not have one yet
    pub fn seed_sources(&self, targets: &[Lib]) {
        for target in targets {
            let path = self.buildroot().join(format!("{}.src", target.id));
            if !path.exists() {
                std::fs::write(path, &target.id).unwrap();
            }
        }
    }

    pub fn config(&self, task: &TaskIdentity) -> InvalidationConfig {
        InvalidationConfig::for_task(&self.workdir(), task.clone())
    }

    /// A fresh manager, as a new task run would create
    pub fn manager(&self, targets: &[Lib], task: &TaskIdentity) -> Manager {
        self.manager_with(targets, self.config(task), SourceFingerprintStrategy::new(self.buildroot()))
    }

    pub fn manager_with(
        &self,
        targets: &[Lib],
        config: InvalidationConfig,
        strategy: impl FingerprintStrategy<Lib> + 'static,
    ) -> Manager {
        self.seed_sources(targets);
        let generator =
            TransitiveKeyGenerator::from_targets(targets.to_vec(), config.task().fingerprint())
                .unwrap();
        InvalidationCacheManager::new(&config, generator, strategy).unwrap()
    }
}

pub fn task(version: &str) -> TaskIdentity {
    TaskIdentity::new("compile", version)
}

/// a <- b <- c <- d, with d also depending on a, and e on d
pub fn diamond() -> Vec<Lib> {
    vec![
        Lib::new("a", &[]),
        Lib::new("b", &["a"]),
        Lib::new("c", &["b"]),
        Lib::new("d", &["c", "a"]),
        Lib::new("e", &["d"]),
    ]
}

pub fn is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A captured log event
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
}

/// A tracing layer that collects events for test assertions
pub struct EventCollector {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl EventCollector {
    /// Create a collector and return both the layer and a handle to the events
    pub fn new() -> (Self, Arc<Mutex<Vec<CapturedEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: Arc::clone(&events),
            },
            events,
        )
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for EventCollector {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.0,
        });
    }
}
