//! Request dispatch
//!
//! [`Dispatcher::dispatch`] runs the whole prediction pipeline for one
//! request and always returns a [`PredictResponse`]:
//!
//! 1. decode the payload and sniff every image;
//! 2. route on the first image (name, then site, then type, then size);
//!    requests that stop here are returned uncharged;
//! 3. apply color separation and resolve the pretreatment variant;
//! 4. infer auxiliary slices through their own models;
//! 5. infer the main batch, or the crop cells of a composite model;
//! 6. decode labels, evaluate arithmetic, audit.

use crate::admission::{AdmissionError, SizeAllowlist};
use crate::arithmetic;
use crate::crop::{self, CellRect, CropSpec};
use crate::descriptor::{ImageSize, ModelDescriptor, TransformStep};
use crate::engine::EngineError;
use crate::model::{join_labels, ModelInstance};
use crate::payload::{self, ImageKind, ImagePayload, PayloadError};
use crate::pool::{InferencePool, PoolError};
use crate::preprocess::{PreprocessContext, PreprocessError, Preprocessor, TargetColor};
use crate::registry::ModelRegistry;
use crate::response::{ErrorCode, PredictResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_OUTPUT_SPLIT: &str = ",";

// =============================================================================
// Request / errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    pub image: ImagePayload,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub model_site: Option<String>,
    #[serde(default, alias = "split_char")]
    pub output_split: Option<String>,
    #[serde(default)]
    pub need_color: Option<String>,
    #[serde(default)]
    pub param_key: Option<String>,
    #[serde(default)]
    pub flags: Option<Value>,
}

impl PredictRequest {
    pub fn new(image: impl Into<ImagePayload>) -> Self {
        Self {
            image: image.into(),
            model_name: None,
            model_type: None,
            model_site: None,
            output_split: None,
            need_color: None,
            param_key: None,
            flags: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("No model is loaded")]
    ServiceUnavailable,

    #[error("No model matches {0}")]
    ServiceNotReady(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    #[error("Unsupported parameter: {0}")]
    UnsupportedParameter(String),
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::Payload(PayloadError::InvalidBase64(_)) => ErrorCode::InvalidBase64String,
            DispatchError::Payload(PayloadError::InvalidImageFormat(_)) => {
                ErrorCode::InvalidImageFormat
            }
            DispatchError::Payload(PayloadError::ImageDamage(_)) => ErrorCode::ImageDamage,
            DispatchError::Preprocess(PreprocessError::ImageDamage(_)) => ErrorCode::ImageDamage,
            DispatchError::Preprocess(PreprocessError::ImageSizeMismatch { .. }) => {
                ErrorCode::ImageSizeMismatch
            }
            DispatchError::Preprocess(PreprocessError::UnsupportedColor(_))
            | DispatchError::Preprocess(PreprocessError::InvalidFlags(_)) => {
                ErrorCode::UnsupportedParameter
            }
            DispatchError::Admission(e) => e.code(),
            DispatchError::Engine(_) => ErrorCode::InferenceFailed,
            DispatchError::Pool(PoolError::Timeout(_)) => ErrorCode::InferenceTimeout,
            DispatchError::Pool(_) => ErrorCode::InferenceFailed,
            DispatchError::ServiceUnavailable => ErrorCode::ServiceUnavailable,
            DispatchError::ServiceNotReady(_) => ErrorCode::ServiceNotReady,
            DispatchError::MissingParameter(_) => ErrorCode::MissingParameter,
            DispatchError::UnsupportedParameter(_) => ErrorCode::UnsupportedParameter,
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Site routing ignores image size when true
    pub strict_sites: bool,
    pub allowed_sizes: SizeAllowlist,
    /// Write the first image of every successful request here
    pub audit_dir: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            strict_sites: true,
            allowed_sizes: SizeAllowlist::default(),
            audit_dir: None,
        }
    }
}

struct Prediction {
    message: Value,
    model: String,
    size: ImageSize,
}

/// A decoded batch and the model selected for it.
struct Routed {
    batch: Vec<Vec<u8>>,
    kinds: Vec<ImageKind>,
    size: ImageSize,
    model: Arc<ModelInstance>,
}

pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
    preprocessor: Arc<dyn Preprocessor>,
    pool: Arc<InferencePool>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ModelRegistry>,
        preprocessor: Arc<dyn Preprocessor>,
        pool: Arc<InferencePool>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            preprocessor,
            pool,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<InferencePool> {
        &self.pool
    }

    pub async fn dispatch(&self, request: PredictRequest) -> PredictResponse {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let outcome = match self.select(&request) {
            Ok(routed) => self
                .predict(&request, routed, &request_id)
                .await
                .map_err(|e| (e, true)),
            Err(e) => Err((e, false)),
        };

        match outcome {
            Ok(prediction) => {
                info!(
                    "[{}] - Size[{}] - Model[{}] - Site[{}] - Predicted[{}] - {} ms",
                    request_id,
                    prediction.size,
                    prediction.model,
                    request.model_site.as_deref().unwrap_or("-"),
                    prediction.message,
                    started.elapsed().as_millis()
                );
                PredictResponse::success(prediction.message, request_id)
            }
            Err((e, charged)) => {
                let code = e.code();
                match code {
                    ErrorCode::InferenceFailed
                    | ErrorCode::InferenceTimeout
                    | ErrorCode::ServiceUnavailable => {
                        warn!("[{}] - {} - {}", request_id, code, e)
                    }
                    _ => info!("[{}] - {} - {}", request_id, code, e),
                }
                let response = PredictResponse::error(code, request_id);
                if charged {
                    response
                } else {
                    response.uncharged()
                }
            }
        }
    }

    fn route(&self, request: &PredictRequest, size: &ImageSize) -> Option<Arc<ModelInstance>> {
        if let Some(name) = &request.model_name {
            return self.registry.get_by_name(name, true);
        }
        if let Some(site) = &request.model_site {
            return self
                .registry
                .get_by_site(site, size, self.config.strict_sites, true);
        }
        if let Some(model_type) = &request.model_type {
            return self.registry.get_by_type_and_size(size, model_type, true);
        }
        self.registry.get_by_size(size, true)
    }

    /// Decode, sniff and route. Nothing here touches a model.
    fn select(&self, request: &PredictRequest) -> Result<Routed, DispatchError> {
        let batch = payload::decode_payload(&request.image)?;
        let kinds = payload::sniff_batch(&batch)?;

        if self.registry.is_empty() {
            return Err(DispatchError::ServiceUnavailable);
        }

        let size = payload::image_size(&batch[0])?;
        self.config.allowed_sizes.check(&size)?;
        let model = self
            .route(request, &size)
            .ok_or_else(|| DispatchError::ServiceNotReady(size.to_string()))?;
        Ok(Routed {
            batch,
            kinds,
            size,
            model,
        })
    }

    async fn predict(
        &self,
        request: &PredictRequest,
        routed: Routed,
        request_id: &str,
    ) -> Result<Prediction, DispatchError> {
        let Routed {
            mut batch,
            kinds,
            size,
            model,
        } = routed;
        let descriptor = model.descriptor().clone();

        let output_split = request
            .output_split
            .clone()
            .or_else(|| descriptor.output_split.clone())
            .unwrap_or_else(|| DEFAULT_OUTPUT_SPLIT.to_string());
        let variant = resolve_variant(&descriptor, request.param_key.as_deref())?;
        let audit_image = self.config.audit_dir.as_ref().map(|_| batch[0].clone());

        if let Some(color) = request.need_color.as_deref() {
            let color: TargetColor = color.parse()?;
            let preprocessor = self.preprocessor.clone();
            let source = std::mem::take(&mut batch);
            batch = self
                .pool
                .run(move || {
                    source
                        .iter()
                        .map(|image| preprocessor.separate_color(image, color))
                        .collect::<Result<Vec<_>, _>>()
                })
                .await??;
        }

        let mut aux_labels = Vec::with_capacity(descriptor.auxiliary.len());
        for aux in &descriptor.auxiliary {
            let image = batch.get(aux.index).cloned().ok_or_else(|| {
                DispatchError::MissingParameter(format!("image[{}] for {}", aux.index, aux.model))
            })?;
            let aux_model = self
                .registry
                .get_by_name(&aux.model, false)
                .ok_or_else(|| DispatchError::ServiceNotReady(aux.model.clone()))?;
            let labels = self.infer_labels(aux_model, vec![image], None, None).await?;
            aux_labels.push(labels.into_iter().next().unwrap_or_default());
        }
        if !descriptor.auxiliary.is_empty() {
            let mut indices: Vec<usize> = descriptor.auxiliary.iter().map(|a| a.index).collect();
            indices.sort_unstable();
            indices.dedup();
            for index in indices.into_iter().rev() {
                batch.remove(index);
            }
            if batch.is_empty() {
                return Err(DispatchError::MissingParameter("image".to_string()));
            }
        }

        let message = match &descriptor.crop {
            Some(crop) => {
                let image = batch.swap_remove(0);
                self.predict_crop(
                    &model,
                    crop,
                    image,
                    aux_labels,
                    &output_split,
                    variant,
                    request.flags.clone(),
                )
                .await?
            }
            None => {
                let labels = self
                    .infer_labels(model.clone(), batch, variant, request.flags.clone())
                    .await?;
                let labels: Vec<String> = if descriptor.arithmetic {
                    labels
                        .into_iter()
                        .map(|l| {
                            if arithmetic::is_expression(&l) {
                                arithmetic::evaluate_or_raw(&l)
                            } else {
                                l
                            }
                        })
                        .collect()
                } else {
                    labels
                };
                let text = join_labels(&labels, &output_split);
                if aux_labels.is_empty() {
                    Value::String(text)
                } else {
                    let mut parts = aux_labels;
                    parts.push(text);
                    Value::String(parts.join(&output_split))
                }
            }
        };

        if let (Some(image), Some(kind)) = (audit_image, kinds.first()) {
            self.audit(image, *kind, &message, request_id);
        }

        Ok(Prediction {
            message,
            model: model.name().to_string(),
            size,
        })
    }

    /// Preprocess, infer and decode `images` on the pool.
    async fn infer_labels(
        &self,
        model: Arc<ModelInstance>,
        images: Vec<Vec<u8>>,
        variant: Option<Vec<TransformStep>>,
        flags: Option<Value>,
    ) -> Result<Vec<String>, DispatchError> {
        let preprocessor = self.preprocessor.clone();
        self.pool
            .run(move || -> Result<Vec<String>, DispatchError> {
                let descriptor = model.descriptor();
                let ctx = PreprocessContext {
                    variant: variant.as_deref(),
                    flags: flags.as_ref(),
                };
                let tensors = images
                    .iter()
                    .map(|image| preprocessor.normalize(image, descriptor, &ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                let sequences = model.infer(&tensors)?;
                Ok(model.decode(&sequences))
            })
            .await?
    }

    #[allow(clippy::too_many_arguments)]
    async fn predict_crop(
        &self,
        model: &Arc<ModelInstance>,
        crop: &CropSpec,
        image: Vec<u8>,
        aux_labels: Vec<String>,
        output_split: &str,
        variant: Option<Vec<TransformStep>>,
        flags: Option<Value>,
    ) -> Result<Value, DispatchError> {
        let groups = crop.group_cells();
        let rects: Vec<CellRect> = groups.iter().flatten().copied().collect();
        let cells = {
            let rects = rects.clone();
            self.pool
                .run(move || crop::crop_cells(&image, &rects))
                .await??
        };

        // Batch cells per target model
        let mut plan: Vec<(Arc<ModelInstance>, Vec<usize>)> = Vec::new();
        for (i, rect) in rects.iter().enumerate() {
            let target = self
                .registry
                .get_by_size(&rect.size(), false)
                .unwrap_or_else(|| model.clone());
            match plan.iter_mut().find(|(m, _)| Arc::ptr_eq(m, &target)) {
                Some((_, indices)) => indices.push(i),
                None => plan.push((target, vec![i])),
            }
        }

        let mut cells: Vec<Option<Vec<u8>>> = cells.into_iter().map(Some).collect();
        let mut labels = vec![String::new(); rects.len()];
        for (target, indices) in plan {
            let images = indices
                .iter()
                .map(|i| cells[*i].take().unwrap_or_default())
                .collect();
            let steps = if Arc::ptr_eq(&target, model) {
                variant.clone()
            } else {
                None
            };
            let decoded = self
                .infer_labels(target, images, steps, flags.clone())
                .await?;
            for (i, label) in indices.into_iter().zip(decoded) {
                labels[i] = label;
            }
        }

        if crop.coordinates {
            let from_aux = !aux_labels.is_empty();
            let titles: Vec<String> = if from_aux {
                aux_labels
            } else {
                crop.title_index
                    .iter()
                    .filter_map(|i| labels.get(*i).cloned())
                    .collect()
            };
            let last_start = rects.len() - groups.last().map_or(0, Vec::len);
            let candidates: Vec<(String, CellRect)> = (last_start..rects.len())
                .filter(|i| from_aux || !crop.title_index.contains(i))
                .map(|i| (labels[i].clone(), rects[i]))
                .collect();
            let points = crop::match_coordinates(&titles, &candidates);
            return Ok(Value::Array(
                points
                    .into_iter()
                    .map(|[x, y]| Value::Array(vec![Value::from(x), Value::from(y)]))
                    .collect(),
            ));
        }

        let mut parts = aux_labels;
        let mut offset = 0;
        for group in &groups {
            parts.push(labels[offset..offset + group.len()].concat());
            offset += group.len();
        }
        Ok(Value::String(parts.join(output_split)))
    }

    fn audit(&self, image: Vec<u8>, kind: ImageKind, message: &Value, request_id: &str) {
        let Some(dir) = self.config.audit_dir.clone() else {
            return;
        };
        let label = match message {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let name = format!(
            "{}_{}.{}",
            sanitize_file_stem(&label),
            request_id,
            kind.extension()
        );
        tokio::spawn(async move {
            let path = dir.join(name);
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                warn!("Failed to create audit directory {}: {}", dir.display(), e);
                return;
            }
            if let Err(e) = tokio::fs::write(&path, image).await {
                warn!("Failed to write audit image {}: {}", path.display(), e);
            }
        });
    }
}

fn resolve_variant(
    descriptor: &ModelDescriptor,
    param_key: Option<&str>,
) -> Result<Option<Vec<TransformStep>>, DispatchError> {
    if descriptor.variants.is_empty() {
        return Ok(None);
    }
    match param_key {
        Some(key) => descriptor
            .variants
            .get(key)
            .cloned()
            .map(Some)
            .ok_or_else(|| DispatchError::UnsupportedParameter(format!("param_key '{}'", key))),
        None if descriptor.variants.len() == 1 => {
            Ok(descriptor.variants.values().next().cloned())
        }
        None => Err(DispatchError::MissingParameter("param_key".to_string())),
    }
}

fn sanitize_file_stem(label: &str) -> String {
    let stem: String = label
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .take(64)
        .collect();
    if stem.is_empty() {
        "empty".to_string()
    } else {
        stem
    }
}
