//! Inference engine abstraction
//!
//! The gateway never touches numeric inference directly. An
//! [`InferenceEngine`] turns an artifact into an [`InferenceSession`], which
//! maps a batch of normalized tensors to one index sequence per image.
//!
//! When the `onnx` feature is enabled, [`OnnxEngine`] loads artifacts with
//! ONNX Runtime. Without the feature a stub is provided whose `load` fails,
//! so every descriptor ends up in the invalid set.

use crate::descriptor::ModelDescriptor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A dense `f32` tensor in `[height, width, channel]` layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Model artifact not found: {0}")]
    ArtifactMissing(PathBuf),

    #[error("Failed to load model {0}: {1}")]
    Load(PathBuf, String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Session is closed")]
    Closed,
}

/// A loaded model ready for inference.
pub trait InferenceSession: Send + Sync {
    /// Run one batch; returns one index sequence per input tensor.
    fn infer(&self, batch: &[Tensor]) -> Result<Vec<Vec<i64>>, EngineError>;

    /// Release engine resources. Called exactly once by the owning instance.
    fn close(&mut self) {}
}

/// Loads artifacts into sessions.
pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &str;

    fn load(
        &self,
        artifact: &Path,
        descriptor: &ModelDescriptor,
    ) -> Result<Box<dyn InferenceSession>, EngineError>;
}

/// The engine compiled into this build.
pub fn default_engine() -> Arc<dyn InferenceEngine> {
    Arc::new(OnnxEngine::new())
}

#[cfg(feature = "onnx")]
mod inner {
    use super::{EngineError, InferenceEngine, InferenceSession, Tensor};
    use crate::descriptor::ModelDescriptor;
    use ort::session::Session;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tracing::debug;

    /// ONNX Runtime engine.
    #[derive(Debug, Default)]
    pub struct OnnxEngine;

    impl OnnxEngine {
        pub fn new() -> Self {
            Self
        }
    }

    impl InferenceEngine for OnnxEngine {
        fn name(&self) -> &str {
            "onnx"
        }

        fn load(
            &self,
            artifact: &Path,
            descriptor: &ModelDescriptor,
        ) -> Result<Box<dyn InferenceSession>, EngineError> {
            let session = Session::builder()
                .map_err(|e| EngineError::Load(artifact.to_path_buf(), e.to_string()))?
                .commit_from_file(artifact)
                .map_err(|e| EngineError::Load(artifact.to_path_buf(), e.to_string()))?;

            let input_name = session
                .inputs()
                .first()
                .map(|i| i.name().to_string())
                .unwrap_or_else(|| "input".to_string());

            debug!(model = %descriptor.name, input = %input_name, "ONNX session ready");

            Ok(Box::new(OnnxSession {
                session: Some(Arc::new(Mutex::new(session))),
                input_name,
            }))
        }
    }

    struct OnnxSession {
        session: Option<Arc<Mutex<Session>>>,
        input_name: String,
    }

    impl InferenceSession for OnnxSession {
        fn infer(&self, batch: &[Tensor]) -> Result<Vec<Vec<i64>>, EngineError> {
            let first = batch
                .first()
                .ok_or_else(|| EngineError::Inference("empty batch".to_string()))?;
            if batch.iter().any(|t| t.shape != first.shape) {
                return Err(EngineError::Inference(
                    "batch tensors differ in shape".to_string(),
                ));
            }

            let mut shape = Vec::with_capacity(first.shape.len() + 1);
            shape.push(batch.len() as i64);
            shape.extend(first.shape.iter().map(|d| *d as i64));
            let data: Vec<f32> = batch.iter().flat_map(|t| t.data.iter().copied()).collect();

            let input = ort::value::Tensor::from_array((shape, data))
                .map_err(|e| EngineError::Inference(e.to_string()))?;

            let session = self.session.as_ref().ok_or(EngineError::Closed)?;
            let mut session = session
                .lock()
                .map_err(|e| EngineError::Inference(format!("session lock error: {}", e)))?;

            let outputs = session
                .run(ort::inputs![self.input_name.as_str() => input])
                .map_err(|e| EngineError::Inference(e.to_string()))?;

            let (_, raw) = outputs[0]
                .try_extract_tensor::<i64>()
                .map_err(|e| EngineError::Inference(e.to_string()))?;

            let per_image = raw.len() / batch.len();
            Ok(raw
                .chunks(per_image.max(1))
                .take(batch.len())
                .map(|c| c.to_vec())
                .collect())
        }

        fn close(&mut self) {
            self.session = None;
        }
    }
}

#[cfg(not(feature = "onnx"))]
mod inner {
    use super::{EngineError, InferenceEngine, InferenceSession};
    use crate::descriptor::ModelDescriptor;
    use std::path::Path;

    /// Stub engine when the `onnx` feature is not enabled.
    #[derive(Debug, Default)]
    pub struct OnnxEngine;

    impl OnnxEngine {
        pub fn new() -> Self {
            Self
        }
    }

    impl InferenceEngine for OnnxEngine {
        fn name(&self) -> &str {
            "stub"
        }

        fn load(
            &self,
            artifact: &Path,
            _descriptor: &ModelDescriptor,
        ) -> Result<Box<dyn InferenceSession>, EngineError> {
            Err(EngineError::Load(
                artifact.to_path_buf(),
                "inference requires the 'onnx' feature, rebuild with: cargo build --features onnx"
                    .to_string(),
            ))
        }
    }
}

pub use inner::OnnxEngine;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_mean() {
        let t = Tensor::new(vec![1, 2, 1], vec![0.0, 1.0]);
        assert_eq!(t.mean(), 0.5);
        assert_eq!(Tensor::new(vec![0], vec![]).mean(), 0.0);
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn test_stub_engine_refuses_to_load() {
        let descriptor = ModelDescriptor::from_yaml(
            "name: m\nartifact: m.onnx\ninput: { width: 10, height: 10 }\ncategories: NUMERIC\n",
            Path::new("m.yaml"),
        )
        .unwrap();
        let engine = default_engine();
        assert_eq!(engine.name(), "stub");
        assert!(matches!(
            engine.load(Path::new("m.onnx"), &descriptor),
            Err(EngineError::Load(..))
        ));
    }
}
