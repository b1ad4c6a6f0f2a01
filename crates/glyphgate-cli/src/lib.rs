//! glyphgate CLI library - testable functions and modules
//!
//! Assembles the runtime components from a [`config::Config`] and exposes
//! the warp routes, so the binary and the integration tests share one wiring.

pub mod api;
pub mod auth;
pub mod config;
pub mod rate_limit;

use anyhow::Result;
use config::Config;
use glyphgate_runtime::watcher::is_descriptor_file;
use glyphgate_runtime::{
    DispatchConfig, Dispatcher, ImagePreprocessor, InferenceEngine, InferencePool,
    ModelDescriptor, ModelLoader, ModelRegistry, ModelWatcher, RateLimiter, SignatureVerifier,
    SizeAllowlist, WatcherConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// The wired-up gateway, before any task is spawned.
pub struct Gateway {
    pub registry: Arc<ModelRegistry>,
    pub watcher: Arc<ModelWatcher>,
    pub limiter: Arc<RateLimiter>,
    pub pool: Arc<InferencePool>,
    pub state: api::SharedState,
}

impl Gateway {
    pub fn build(config: &Config, engine: Arc<dyn InferenceEngine>) -> Self {
        let registry = Arc::new(ModelRegistry::new());
        let loader = Arc::new(ModelLoader::new(engine, &config.models.graph_dir));

        let watcher_config = WatcherConfig {
            descriptor_dir: config.models.descriptor_dir.clone(),
            default_model: config.models.default_model.clone(),
            poll_interval: Duration::from_millis(config.models.poll_interval_ms),
            retry_attempts: config.models.retry_attempts,
            retry_delay: Duration::from_secs(config.models.retry_delay_secs),
        };
        let watcher = Arc::new(ModelWatcher::new(watcher_config, registry.clone(), loader));

        let pool = Arc::new(InferencePool::new(
            config.server.worker_count(),
            config.server.inference_timeout(),
        ));
        let dispatch_config = DispatchConfig {
            strict_sites: config.models.strict_sites,
            allowed_sizes: SizeAllowlist::new(&config.rate_limit.allowed_sizes),
            audit_dir: config.audit.enabled.then(|| config.audit.dir.clone()),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            Arc::new(ImagePreprocessor::new()),
            pool.clone(),
            dispatch_config,
        ));

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

        let credentials = if config.auth.credentials.is_empty() {
            let seed = config.models.default_model.as_deref().unwrap_or("glyphgate");
            auth::default_credentials(seed)
        } else {
            config.auth.credentials.clone()
        };
        let verifier = Arc::new(
            SignatureVerifier::new(credentials)
                .with_tolerance(config.auth.timestamp_tolerance_secs),
        );

        let mut state =
            api::AppState::new(dispatcher, limiter.clone(), verifier, config.response.clone());
        state.trust_forwarded_for = config.server.trust_forwarded_for;
        state.max_body_bytes = config.server.max_body_bytes;

        Self {
            registry,
            watcher,
            limiter,
            pool,
            state: Arc::new(state),
        }
    }
}

/// Outcome of checking one descriptor file.
#[derive(Debug)]
pub struct CheckOutcome {
    pub path: PathBuf,
    pub result: Result<ModelDescriptor, String>,
}

/// Validate one descriptor and confirm its artifact exists under `graph_dir`.
pub fn check_descriptor(path: &Path, graph_dir: &Path) -> Result<ModelDescriptor> {
    let descriptor = ModelDescriptor::load(path)?;
    let artifact = descriptor.artifact_path(graph_dir);
    if !artifact.is_file() {
        anyhow::bail!("artifact {} not found", artifact.display());
    }
    Ok(descriptor)
}

/// Check a descriptor file, or every descriptor in a directory.
pub fn check_path(path: &Path, graph_dir: &Path) -> Result<Vec<CheckOutcome>> {
    let files = if path.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_descriptor_file(p))
            .collect();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };

    Ok(files
        .into_iter()
        .map(|path| {
            let result = check_descriptor(&path, graph_dir).map_err(|e| e.to_string());
            CheckOutcome { path, result }
        })
        .collect())
}
