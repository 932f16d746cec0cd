//! Shared fixtures for artifact cache integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use rebuilt_artifact_cache::{
    ArtifactCache, ArtifactCacheConfig, CachedResults, LocalArtifactCache, RemoteError,
    RemoteStore, WriteMode,
};
use rebuilt_invalidation::{
    InvalidationCacheManager, InvalidationConfig, ResultsDirHandle, SourceFingerprintStrategy,
    Target, TargetNode, TaskIdentity, TransitiveKeyGenerator,
};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// A target with one source file named after it
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

pub type Cached = CachedResults<Lib, TransitiveKeyGenerator<Lib>>;

/// A build root plus a working directory holding results and artifacts
pub struct Workspace {
    pub tmp: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("buildroot")).unwrap();
        Self { tmp }
    }

    pub fn buildroot(&self) -> PathBuf {
        self.tmp.path().join("buildroot")
    }

    pub fn workdir(&self) -> PathBuf {
        self.tmp.path().join("workdir")
    }

    pub fn write_source(&self, id: &str, content: &str) {
        fs::write(self.buildroot().join(format!("{id}.src")), content).unwrap();
    }

    pub fn local_cache(&self) -> LocalArtifactCache {
        LocalArtifactCache::new(&ArtifactCacheConfig::for_workdir(&self.workdir())).unwrap()
    }

    pub fn manager(
        &self,
        targets: &[Lib],
    ) -> InvalidationCacheManager<Lib, TransitiveKeyGenerator<Lib>> {
        for target in targets {
            let path = self.buildroot().join(format!("{}.src", target.id));
            if !path.exists() {
                fs::write(path, &target.id).unwrap();
            }
        }
        let task = TaskIdentity::new("compile", "1");
        let config = InvalidationConfig::for_task(&self.workdir(), task.clone());
        let generator =
            TransitiveKeyGenerator::from_targets(targets.to_vec(), task.fingerprint()).unwrap();
        InvalidationCacheManager::new(
            &config,
            generator,
            SourceFingerprintStrategy::new(self.buildroot()),
        )
        .unwrap()
    }

    pub fn cached(
        &self,
        targets: &[Lib],
        cache: Arc<dyn ArtifactCache>,
        mode: WriteMode,
    ) -> Cached {
        CachedResults::with_artifact_cache(self.manager(targets), cache, mode).unwrap()
    }
}

/// Outcome of one simulated task run
pub struct Run {
    pub invalid: usize,
    pub content: String,
    pub cached: Cached,
}

/// Run a task over the single target `t` that appends its source to `out`
pub fn run_once(
    ws: &Workspace,
    source: &str,
    cache: Arc<dyn ArtifactCache>,
    incremental: bool,
) -> Run {
    let targets = vec![Lib::new("t", &[])];
    ws.write_source("t", source);
    let cached = ws.cached(&targets, cache, WriteMode::Synchronous);

    let mut check = cached.check(&targets, false).unwrap();
    let invalid = check.invalid_count();
    for vt in check.invalid_vts_mut() {
        vt.create_results_dir(incremental).unwrap();
        append(&vt.results_dir().unwrap().join("out"), source);
        cached.update(vt).unwrap();
    }

    let vt = &check.all_vts()[0];
    let content = fs::read_to_string(vt.results_dir().unwrap().join("out")).unwrap();
    Run {
        invalid,
        content,
        cached,
    }
}

pub fn append(path: &Path, content: &str) {
    let mut out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    out.write_all(content.as_bytes()).unwrap();
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What a [`ScriptedStore`] hands back from `get`
#[derive(Debug, Clone)]
pub enum Body {
    Missing,
    Failing(RemoteError),
    Bytes(Vec<u8>),
    /// A stream that fails partway with the given error kind
    Broken(io::ErrorKind),
}

struct BrokenReader {
    sent: bool,
    kind: io::ErrorKind,
}

impl Read for BrokenReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.sent {
            return Err(io::Error::from(self.kind));
        }
        self.sent = true;
        buf[0] = 0x1f;
        Ok(1)
    }
}

/// A remote store with canned answers that records every call
pub struct ScriptedStore {
    pub exists: Result<(), RemoteError>,
    pub body: Body,
    pub put: Result<(), RemoteError>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedStore {
    pub fn unreachable() -> Self {
        let down = RemoteError::Network {
            message: "connection refused".to_string(),
        };
        Self {
            exists: Err(down.clone()),
            body: Body::Failing(down.clone()),
            put: Err(down),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn serving(body: Body) -> Self {
        Self {
            exists: Ok(()),
            body,
            put: Ok(()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl RemoteStore for ScriptedStore {
    fn exists(&self, key: &str) -> Result<(), RemoteError> {
        self.record(format!("HEAD {key}"));
        self.exists.clone()
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>, RemoteError> {
        self.record(format!("GET {key}"));
        match &self.body {
            Body::Missing => Err(RemoteError::NotFound {
                key: key.to_string(),
            }),
            Body::Failing(err) => Err(err.clone()),
            Body::Bytes(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
            Body::Broken(kind) => Ok(Box::new(BrokenReader {
                sent: false,
                kind: *kind,
            })),
        }
    }

    fn put(&self, key: &str, body: &mut dyn Read) -> Result<(), RemoteError> {
        self.record(format!("PUT {key}"));
        io::copy(body, &mut io::sink()).unwrap();
        self.put.clone()
    }

    fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.record(format!("DELETE {key}"));
        Err(RemoteError::Other {
            message: "deletes are not allowed".to_string(),
        })
    }
}
