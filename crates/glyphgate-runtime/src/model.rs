//! Loaded model instances
//!
//! A [`ModelInstance`] pairs a descriptor with the inference session built
//! from its artifact. The session is owned exclusively by the instance and
//! closed exactly once, when the last `Arc` handle is dropped. Removing an
//! instance from the registry therefore lets in-flight requests finish first.

use crate::descriptor::{CategorySet, DescriptorError, ModelDescriptor};
use crate::engine::{EngineError, InferenceEngine, InferenceSession, Tensor};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Per-path lifecycle state tracked by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Pending,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub struct ModelInstance {
    descriptor: Arc<ModelDescriptor>,
    source: PathBuf,
    session: Option<Box<dyn InferenceSession>>,
    loaded_at: DateTime<Utc>,
}

impl ModelInstance {
    pub fn new(
        descriptor: ModelDescriptor,
        source: impl Into<PathBuf>,
        session: Box<dyn InferenceSession>,
    ) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            source: source.into(),
            session: Some(session),
            loaded_at: Utc::now(),
        }
    }

    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn version(&self) -> f64 {
        self.descriptor.version
    }

    pub fn model_type(&self) -> &str {
        &self.descriptor.model_type
    }

    pub fn size_key(&self) -> String {
        self.descriptor.size_key()
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn is_loaded(&self) -> bool {
        self.session.is_some()
    }

    pub fn infer(&self, batch: &[Tensor]) -> Result<Vec<Vec<i64>>, EngineError> {
        self.session
            .as_ref()
            .ok_or(EngineError::Closed)?
            .infer(batch)
    }

    /// Decode one label per index sequence.
    pub fn decode(&self, sequences: &[Vec<i64>]) -> Vec<String> {
        let join = self.descriptor.category_split.as_deref().unwrap_or("");
        sequences
            .iter()
            .map(|seq| decode_sequence(&self.descriptor.categories, seq, join))
            .collect()
    }
}

impl Drop for ModelInstance {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            debug!(model = %self.descriptor.name, "Session closed");
        }
    }
}

impl fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInstance")
            .field("name", &self.descriptor.name)
            .field("version", &self.descriptor.version)
            .field("size", &self.descriptor.size_key())
            .field("source", &self.source)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Map an index sequence to text. Blank, negative and overflowing indices
/// contribute nothing.
pub fn decode_sequence(categories: &CategorySet, sequence: &[i64], join: &str) -> String {
    sequence
        .iter()
        .filter_map(|i| categories.symbol(*i))
        .collect::<Vec<_>>()
        .join(join)
}

/// Join per-image labels; a single image yields its bare label.
pub fn join_labels(labels: &[String], output_split: &str) -> String {
    match labels {
        [single] => single.clone(),
        _ => labels.join(output_split),
    }
}

/// Builds instances from descriptor files.
pub struct ModelLoader {
    engine: Arc<dyn InferenceEngine>,
    graph_dir: PathBuf,
}

impl ModelLoader {
    pub fn new(engine: Arc<dyn InferenceEngine>, graph_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            graph_dir: graph_dir.into(),
        }
    }

    pub fn graph_dir(&self) -> &Path {
        &self.graph_dir
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Parse `path` and load its artifact.
    pub fn load(&self, path: &Path) -> Result<ModelInstance, LoadError> {
        let descriptor = ModelDescriptor::load(path)?;
        let artifact = descriptor.artifact_path(&self.graph_dir);
        if !artifact.is_file() {
            return Err(EngineError::ArtifactMissing(artifact).into());
        }
        let session = self.engine.load(&artifact, &descriptor)?;
        Ok(ModelInstance::new(descriptor, path, session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::CategorySpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSession(Arc<AtomicUsize>);

    impl InferenceSession for CountingSession {
        fn infer(&self, batch: &[Tensor]) -> Result<Vec<Vec<i64>>, EngineError> {
            Ok(batch.iter().map(|_| vec![1, 0, 2]).collect())
        }

        fn close(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::from_yaml(
            "name: m\nartifact: m.onnx\ninput: { width: 10, height: 10 }\ncategories: [a, b]\ncategory_split: \"-\"\n",
            Path::new("m.yaml"),
        )
        .unwrap()
    }

    #[test]
    fn test_session_closed_once_on_last_drop() {
        let closes = Arc::new(AtomicUsize::new(0));
        let instance = Arc::new(ModelInstance::new(
            descriptor(),
            "m.yaml",
            Box::new(CountingSession(closes.clone())),
        ));
        let in_flight = instance.clone();
        drop(instance);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        drop(in_flight);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decode_uses_category_split() {
        let instance = ModelInstance::new(
            descriptor(),
            "m.yaml",
            Box::new(CountingSession(Arc::new(AtomicUsize::new(0)))),
        );
        let sequences = instance.infer(&[Tensor::new(vec![1], vec![0.0])]).unwrap();
        assert_eq!(instance.decode(&sequences), vec!["a-b".to_string()]);
    }

    #[test]
    fn test_decode_sequence_skips_blank_and_overflow() {
        let set = CategorySet::from_spec(&CategorySpec::Symbols(vec!["x".into(), "y".into()]))
            .unwrap();
        assert_eq!(decode_sequence(&set, &[0, 1, -1, 3, 2, 99], ""), "xy");
    }

    #[test]
    fn test_join_labels() {
        assert_eq!(join_labels(&["ab".to_string()], ","), "ab");
        assert_eq!(
            join_labels(&["ab".to_string(), "cd".to_string()], ","),
            "ab,cd"
        );
        assert_eq!(join_labels(&[], ","), "");
    }

    #[test]
    fn test_loader_reports_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.yaml");
        std::fs::write(
            &path,
            "name: m\nartifact: missing.onnx\ninput: { width: 10, height: 10 }\ncategories: NUMERIC\n",
        )
        .unwrap();
        let loader = ModelLoader::new(crate::engine::default_engine(), dir.path());
        let err = loader.load(&path).unwrap_err();
        assert!(matches!(
            err,
            LoadError::Engine(EngineError::ArtifactMissing(_))
        ));
    }
}
