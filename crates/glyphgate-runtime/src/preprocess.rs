//! Image preprocessing
//!
//! [`Preprocessor`] turns encoded image bytes into the tensor a model
//! consumes. [`ImagePreprocessor`] is the `image`-crate implementation:
//! decode, size check and resize, base pretreatment, variant steps, the
//! request's extra steps, then scale pixels to `[0, 1]`.
//!
//! Request flags may carry `{"steps": [{"op": "invert"}, ...]}`; those steps
//! run after the variant's.

use crate::crop::encode_png;
use crate::descriptor::{ImageSize, ModelDescriptor, Pretreatment, TransformStep};
use crate::engine::Tensor;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};
use serde_json::Value;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PreprocessError {
    #[error("Image damage: {0}")]
    ImageDamage(String),

    #[error("Image size {actual} does not match model input {expected}")]
    ImageSizeMismatch { expected: String, actual: String },

    #[error("Unsupported color: {0}")]
    UnsupportedColor(String),

    #[error("Invalid flags: {0}")]
    InvalidFlags(String),
}

/// Per-request inputs to [`Preprocessor::normalize`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PreprocessContext<'a> {
    /// Transform steps of the selected pretreatment variant.
    pub variant: Option<&'a [TransformStep]>,
    /// Free-form request flags.
    pub flags: Option<&'a Value>,
}

impl PreprocessContext<'_> {
    /// Extra transform steps requested through `flags.steps`.
    pub fn flag_steps(&self) -> Result<Vec<TransformStep>, PreprocessError> {
        match self.flags.and_then(|f| f.get("steps")) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(steps) => serde_json::from_value(steps.clone())
                .map_err(|e| PreprocessError::InvalidFlags(format!("steps: {}", e))),
        }
    }
}

/// Colors [`Preprocessor::separate_color`] can isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetColor {
    Black,
    Red,
    Blue,
    Yellow,
    Green,
}

impl TargetColor {
    /// Inclusive HSV bounds, hue in `0..=180`, saturation and value in `0..=255`.
    fn hsv_range(self) -> ([u8; 3], [u8; 3]) {
        match self {
            TargetColor::Blue => ([100, 128, 46], [124, 255, 255]),
            TargetColor::Red => ([0, 128, 46], [5, 255, 255]),
            TargetColor::Yellow => ([15, 128, 46], [34, 255, 255]),
            TargetColor::Green => ([35, 128, 46], [77, 255, 255]),
            TargetColor::Black => ([0, 0, 0], [180, 255, 46]),
        }
    }
}

impl FromStr for TargetColor {
    type Err = PreprocessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "black" => Ok(TargetColor::Black),
            "red" => Ok(TargetColor::Red),
            "blue" => Ok(TargetColor::Blue),
            "yellow" => Ok(TargetColor::Yellow),
            "green" => Ok(TargetColor::Green),
            _ => Err(PreprocessError::UnsupportedColor(s.to_string())),
        }
    }
}

pub trait Preprocessor: Send + Sync {
    fn normalize(
        &self,
        image: &[u8],
        descriptor: &ModelDescriptor,
        ctx: &PreprocessContext<'_>,
    ) -> Result<Tensor, PreprocessError>;

    /// Keep only pixels of `color`, returned as an encoded mask image.
    fn separate_color(&self, image: &[u8], color: TargetColor) -> Result<Vec<u8>, PreprocessError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    pub fn new() -> Self {
        Self
    }
}

impl Preprocessor for ImagePreprocessor {
    fn normalize(
        &self,
        image: &[u8],
        descriptor: &ModelDescriptor,
        ctx: &PreprocessContext<'_>,
    ) -> Result<Tensor, PreprocessError> {
        let extra_steps = ctx.flag_steps()?;
        let mut img = decode(image)?;
        let geometry = &descriptor.input;

        if let Some([w, h]) = geometry.resize {
            img = img.resize_exact(w, h, FilterType::Triangle);
        }

        let actual = ImageSize::new(img.width(), img.height());
        let target = geometry.resolve(&actual);
        if actual != target {
            if !geometry.matches_fuzzy(&actual) && !geometry.is_auto_width() {
                return Err(PreprocessError::ImageSizeMismatch {
                    expected: target.to_string(),
                    actual: actual.to_string(),
                });
            }
            img = img.resize_exact(target.width, target.height, FilterType::Triangle);
        }

        if geometry.channel == 1 {
            img = DynamicImage::ImageLuma8(img.to_luma8());
        }
        img = apply_pretreatment(img, &descriptor.pretreatment);
        for step in ctx.variant.unwrap_or_default().iter().chain(&extra_steps) {
            img = apply_step(img, step);
        }

        Ok(to_tensor(&img, geometry.channel))
    }

    fn separate_color(&self, image: &[u8], color: TargetColor) -> Result<Vec<u8>, PreprocessError> {
        let rgb = decode(image)?.to_rgb8();
        let (lower, upper) = color.hsv_range();
        let mask = GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
            let hsv = rgb_to_hsv(rgb.get_pixel(x, y).0);
            let inside = (0..3).all(|i| hsv[i] >= lower[i] && hsv[i] <= upper[i]);
            Luma([if inside { 255 } else { 0 }])
        });
        encode_png(&DynamicImage::ImageLuma8(mask))
    }
}

fn decode(image: &[u8]) -> Result<DynamicImage, PreprocessError> {
    image::load_from_memory(image).map_err(|e| PreprocessError::ImageDamage(e.to_string()))
}

fn apply_pretreatment(mut img: DynamicImage, pretreatment: &Pretreatment) -> DynamicImage {
    if let Some(threshold) = pretreatment.binarization {
        img = apply_step(img, &TransformStep::Binarize { threshold });
    }
    if pretreatment.invert {
        img.invert();
    }
    if let Some(sigma) = pretreatment.blur {
        img = img.blur(sigma);
    }
    img
}

pub fn apply_step(mut img: DynamicImage, step: &TransformStep) -> DynamicImage {
    match step {
        TransformStep::Grayscale => DynamicImage::ImageLuma8(img.to_luma8()),
        TransformStep::Binarize { threshold } => {
            let mut luma = img.to_luma8();
            for p in luma.pixels_mut() {
                p.0[0] = if p.0[0] > *threshold { 255 } else { 0 };
            }
            DynamicImage::ImageLuma8(luma)
        }
        TransformStep::Invert => {
            img.invert();
            img
        }
        TransformStep::Blur { sigma } => img.blur(*sigma),
        TransformStep::Brighten { value } => img.brighten(*value),
        TransformStep::Contrast { value } => img.adjust_contrast(*value),
        TransformStep::Resize { width, height } => {
            img.resize_exact(*width, *height, FilterType::Triangle)
        }
    }
}

fn to_tensor(img: &DynamicImage, channel: u32) -> Tensor {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let raw = match channel {
        1 => img.to_luma8().into_raw(),
        2 => img.to_luma_alpha8().into_raw(),
        4 => img.to_rgba8().into_raw(),
        _ => img.to_rgb8().into_raw(),
    };
    let data = raw.into_iter().map(|v| v as f32 / 255.0).collect();
    Tensor::new(vec![height, width, channel as usize], data)
}

/// OpenCV-scaled HSV: hue `0..=180`, saturation and value `0..=255`.
fn rgb_to_hsv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let s = if max == 0.0 { 0.0 } else { delta / max * 255.0 };
    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    [(h / 2.0).round() as u8, s.round() as u8, max as u8]
}
