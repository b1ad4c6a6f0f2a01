//! Shared fixtures: a mock engine and image helpers.

#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use glyphgate_runtime::{
    DispatchConfig, Dispatcher, EngineError, ImagePreprocessor, InferenceEngine, InferencePool,
    InferenceSession, ModelDescriptor, ModelInstance, ModelRegistry, Tensor,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const WHITE: [u8; 3] = [255, 255, 255];
pub const BLACK: [u8; 3] = [0, 0, 0];

/// Bright images decode to index 1, dark ones to index 2, unless the model
/// name has a fixed output sequence.
#[derive(Default)]
pub struct MockEngine {
    pub closes: Arc<AtomicUsize>,
    pub fixed: HashMap<String, Vec<i64>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fixed(mut self, model: &str, sequence: Vec<i64>) -> Self {
        self.fixed.insert(model.to_string(), sequence);
        self
    }

    pub fn closed(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct MockSession {
    fixed: Option<Vec<i64>>,
    closes: Arc<AtomicUsize>,
}

impl InferenceSession for MockSession {
    fn infer(&self, batch: &[Tensor]) -> Result<Vec<Vec<i64>>, EngineError> {
        Ok(batch
            .iter()
            .map(|t| match &self.fixed {
                Some(seq) => seq.clone(),
                None if t.mean() > 0.5 => vec![1],
                None => vec![2],
            })
            .collect())
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl InferenceEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn load(
        &self,
        _artifact: &Path,
        descriptor: &ModelDescriptor,
    ) -> Result<Box<dyn InferenceSession>, EngineError> {
        Ok(Box::new(MockSession {
            fixed: self.fixed.get(&descriptor.name).cloned(),
            closes: self.closes.clone(),
        }))
    }
}

pub fn descriptor_yaml(name: &str, width: u32, height: u32, extra: &str) -> String {
    format!(
        "name: {name}\nartifact: {name}.onnx\ninput: {{ width: {width}, height: {height}, channel: 1 }}\ncategories: [A, B]\n{extra}"
    )
}

pub fn instance(engine: &MockEngine, yaml: &str) -> Arc<ModelInstance> {
    let descriptor = ModelDescriptor::from_yaml(yaml, Path::new("inline.yaml")).unwrap();
    let session = engine.load(Path::new("inline.onnx"), &descriptor).unwrap();
    let source = format!("/descriptors/{}.yaml", descriptor.name);
    Arc::new(ModelInstance::new(descriptor, source, session))
}

pub fn dispatcher(registry: Arc<ModelRegistry>, config: DispatchConfig) -> Dispatcher {
    Dispatcher::new(
        registry,
        Arc::new(ImagePreprocessor::new()),
        Arc::new(InferencePool::new(2, Some(Duration::from_secs(5)))),
        config,
    )
}

pub fn encode(image: DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

pub fn png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    encode(DynamicImage::ImageRgb8(RgbImage::from_pixel(
        width,
        height,
        Rgb(color),
    )))
}

/// Left half `left`, right half `right`.
pub fn split_png(width: u32, height: u32, left: [u8; 3], right: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, _| {
        if x < width / 2 {
            Rgb(left)
        } else {
            Rgb(right)
        }
    });
    encode(DynamicImage::ImageRgb8(img))
}

pub fn b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Poll `check` for up to two seconds.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
