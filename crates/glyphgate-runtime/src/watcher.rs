//! Hot reload of model descriptors.
//!
//! A poller scans the descriptor directory on an interval and turns
//! differences into [`WatchEvent`]s. The lifecycle loop consumes them:
//! created files are loaded (retrying on failure), deleted files are
//! unloaded, modified files are unloaded and loaded again.
//!
//! Per path: `Pending -> Loading -> Ready | Failed`. The startup scan loads
//! every descriptor once without retrying.

use crate::engine::EngineError;
use crate::model::{LoadError, ModelInstance, ModelLoader, ModelState};
use crate::registry::ModelRegistry;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DESCRIPTOR_EXTENSIONS: [&str; 2] = ["yaml", "yml"];
const IGNORED_SUFFIX: &str = "_demo";

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub descriptor_dir: PathBuf,
    /// Name of the model registered as the default when it loads
    pub default_model: Option<String>,
    pub poll_interval: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl WatcherConfig {
    pub fn new(descriptor_dir: impl Into<PathBuf>) -> Self {
        Self {
            descriptor_dir: descriptor_dir.into(),
            default_model: None,
            poll_interval: Duration::from_secs(1),
            retry_attempts: 12,
            retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Created(p) | WatchEvent::Modified(p) | WatchEvent::Deleted(p) => p,
        }
    }
}

/// Descriptor files have a YAML extension and a stem not ending in `_demo`.
pub fn is_descriptor_file(path: &Path) -> bool {
    let ext_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| DESCRIPTOR_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
    let stem_ok = path
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| !s.ends_with(IGNORED_SUFFIX));
    ext_ok && stem_ok
}

/// Descriptor files in `dir` with their modification times.
pub fn scan_dir(dir: &Path) -> std::io::Result<BTreeMap<PathBuf, SystemTime>> {
    let mut files = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() || !is_descriptor_file(&path) {
            continue;
        }
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        files.insert(path, mtime);
    }
    Ok(files)
}

/// Events turning `prev` into `next`.
pub fn diff(
    prev: &BTreeMap<PathBuf, SystemTime>,
    next: &BTreeMap<PathBuf, SystemTime>,
) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    for path in prev.keys() {
        if !next.contains_key(path) {
            events.push(WatchEvent::Deleted(path.clone()));
        }
    }
    for (path, mtime) in next {
        match prev.get(path) {
            None => events.push(WatchEvent::Created(path.clone())),
            Some(old) if old != mtime => events.push(WatchEvent::Modified(path.clone())),
            Some(_) => {}
        }
    }
    events
}

pub struct ModelWatcher {
    config: WatcherConfig,
    registry: Arc<ModelRegistry>,
    loader: Arc<ModelLoader>,
    states: Mutex<FxHashMap<PathBuf, ModelState>>,
    retries: Mutex<FxHashMap<PathBuf, JoinHandle<()>>>,
}

impl ModelWatcher {
    pub fn new(config: WatcherConfig, registry: Arc<ModelRegistry>, loader: Arc<ModelLoader>) -> Self {
        Self {
            config,
            registry,
            loader,
            states: Mutex::new(FxHashMap::default()),
            retries: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn state(&self, path: &Path) -> Option<ModelState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .copied()
    }

    fn set_state(&self, path: &Path, state: ModelState) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), state);
    }

    /// Load every descriptor currently on disk, once each.
    ///
    /// Returns the scanned files as the baseline for [`spawn`](Self::spawn).
    pub async fn initial_scan(&self) -> std::io::Result<BTreeMap<PathBuf, SystemTime>> {
        let files = scan_dir(&self.config.descriptor_dir)?;
        for path in files.keys() {
            self.set_state(path, ModelState::Pending);
            if let Err(e) = self.load_once(path).await {
                error!("Failed to load model from {}: {}", path.display(), e);
            }
        }
        info!(
            "Initial scan of {} finished: {} loaded, {} invalid",
            self.config.descriptor_dir.display(),
            self.registry.total(),
            self.registry.invalid().len()
        );
        Ok(files)
    }

    async fn load_once(&self, path: &Path) -> Result<(), LoadError> {
        self.set_state(path, ModelState::Loading);

        let loader = self.loader.clone();
        let owned = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || loader.load(&owned))
            .await
            .unwrap_or_else(|e| Err(EngineError::Load(path.to_path_buf(), e.to_string()).into()));

        match result {
            Ok(instance) => {
                self.register(Arc::new(instance));
                self.registry.clear_invalid(path);
                self.set_state(path, ModelState::Ready);
                Ok(())
            }
            Err(e) => {
                self.registry.mark_invalid(path);
                self.set_state(path, ModelState::Failed);
                Err(e)
            }
        }
    }

    fn register(&self, instance: Arc<ModelInstance>) {
        let duplicates = self.registry.duplicates_of(&instance);
        let is_default = self.config.default_model.as_deref() == Some(instance.name());
        if is_default {
            self.registry.set_default(instance.clone());
        } else {
            self.registry.add(instance.clone());
        }
        info!(
            "Model [{}] v{} ({}) loaded from {}{}, total {}",
            instance.name(),
            instance.version(),
            instance.size_key(),
            instance.source().display(),
            if is_default { " as default" } else { "" },
            self.registry.total()
        );
        if !duplicates.is_empty() {
            warn!(
                "Model [{}] shares size {} with {:?}, routing prefers the highest version",
                instance.name(),
                instance.size_key(),
                duplicates
            );
        }
    }

    fn unload(&self, path: &Path) {
        if let Some(old) = self.registry.remove_by_source(path) {
            info!(
                "Model [{}] unloaded, total {}",
                old.name(),
                self.registry.total()
            );
        }
    }

    fn cancel_retry(&self, path: &Path) {
        if let Some(handle) = self
            .retries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
        {
            handle.abort();
        }
    }

    /// Abort every pending load.
    pub fn cancel_all(&self) {
        let mut retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in retries.drain() {
            handle.abort();
        }
    }

    pub async fn handle_event(self: &Arc<Self>, event: WatchEvent) {
        debug!("Watch event: {:?}", event);
        match event {
            WatchEvent::Created(path) => self.schedule_load(path),
            WatchEvent::Modified(path) => {
                self.cancel_retry(&path);
                self.unload(&path);
                self.schedule_load(path);
            }
            WatchEvent::Deleted(path) => {
                self.cancel_retry(&path);
                self.unload(&path);
                self.registry.clear_invalid(&path);
                self.states
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&path);
            }
        }
    }

    fn schedule_load(self: &Arc<Self>, path: PathBuf) {
        self.cancel_retry(&path);
        self.set_state(&path, ModelState::Pending);

        let this = self.clone();
        let task_path = path.clone();
        let handle = tokio::spawn(async move {
            this.load_with_retry(&task_path).await;
        });

        let mut retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
        retries.retain(|_, h| !h.is_finished());
        retries.insert(path, handle);
    }

    async fn load_with_retry(&self, path: &Path) {
        let attempts = self.config.retry_attempts.max(1);
        for attempt in 1..=attempts {
            if !path.exists() {
                debug!("{} vanished before loading", path.display());
                return;
            }
            match self.load_once(path).await {
                Ok(()) => return,
                Err(e) if attempt == attempts => {
                    error!(
                        "Giving up on {} after {} attempts: {}",
                        path.display(),
                        attempts,
                        e
                    );
                }
                Err(e) => {
                    warn!(
                        "Failed to load {} (attempt {}/{}): {}, retrying in {:?}",
                        path.display(),
                        attempt,
                        attempts,
                        e,
                        self.config.retry_delay
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// Start polling from `baseline` and processing events.
    pub fn spawn(self: Arc<Self>, baseline: BTreeMap<PathBuf, SystemTime>) -> WatcherHandle {
        let (tx, mut rx) = mpsc::channel::<WatchEvent>(64);
        let dir = self.config.descriptor_dir.clone();
        let period = self.config.poll_interval;

        let poller = tokio::spawn(async move {
            let mut known = baseline;
            let mut interval = tokio::time::interval(period);
            // Skip the immediate first tick
            interval.tick().await;
            loop {
                interval.tick().await;
                match scan_dir(&dir) {
                    Ok(next) => {
                        for event in diff(&known, &next) {
                            if tx.send(event).await.is_err() {
                                debug!("Watcher poller stopping: channel closed");
                                return;
                            }
                        }
                        known = next;
                    }
                    Err(e) => warn!("Failed to scan {}: {}", dir.display(), e),
                }
            }
        });

        let watcher = self.clone();
        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                watcher.handle_event(event).await;
            }
        });

        info!(
            "Watching {} every {:?}",
            self.config.descriptor_dir.display(),
            period
        );

        WatcherHandle {
            watcher: self,
            poller,
            consumer,
        }
    }
}

/// Running watcher tasks.
pub struct WatcherHandle {
    watcher: Arc<ModelWatcher>,
    poller: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn watcher(&self) -> &Arc<ModelWatcher> {
        &self.watcher
    }

    pub fn stop(self) {
        self.poller.abort();
        self.consumer.abort();
        self.watcher.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_descriptor_file() {
        assert!(is_descriptor_file(Path::new("/m/digits.yaml")));
        assert!(is_descriptor_file(Path::new("/m/digits.YML")));
        assert!(!is_descriptor_file(Path::new("/m/digits_demo.yaml")));
        assert!(!is_descriptor_file(Path::new("/m/digits.onnx")));
        assert!(!is_descriptor_file(Path::new("/m/README")));
    }

    #[test]
    fn test_diff() {
        let t0 = SystemTime::UNIX_EPOCH;
        let t1 = t0 + Duration::from_secs(1);
        let prev: BTreeMap<_, _> = [
            (PathBuf::from("a.yaml"), t0),
            (PathBuf::from("b.yaml"), t0),
        ]
        .into_iter()
        .collect();
        let next: BTreeMap<_, _> = [
            (PathBuf::from("b.yaml"), t1),
            (PathBuf::from("c.yaml"), t0),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            diff(&prev, &next),
            vec![
                WatchEvent::Deleted(PathBuf::from("a.yaml")),
                WatchEvent::Modified(PathBuf::from("b.yaml")),
                WatchEvent::Created(PathBuf::from("c.yaml")),
            ]
        );
        assert!(diff(&next, &next).is_empty());
    }

    #[test]
    fn test_scan_dir_skips_directories_and_demo() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "x").unwrap();
        std::fs::write(dir.path().join("a_demo.yaml"), "x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("nested.yaml")).unwrap();
        let files = scan_dir(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key(&dir.path().join("a.yaml")));
    }
}
