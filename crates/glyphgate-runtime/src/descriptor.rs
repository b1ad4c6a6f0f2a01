//! Model descriptors
//!
//! One YAML file per model describes its input geometry, category set,
//! pretreatment recipe, routing tags and optional composite behaviour
//! (crop grids and auxiliary models). Descriptors are immutable once loaded.

use crate::crop::CropSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Symbol stored at category index 0.
pub const BLANK: &str = "";

const NUMBER: &str = "0123456789";
const ALPHA_LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const ALPHA_UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const OPERATORS: &str = "+-*/=()";

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Failed to read descriptor {0}: {1}")]
    Io(PathBuf, String),

    #[error("Failed to parse descriptor {0}: {1}")]
    Parse(PathBuf, String),

    #[error("Invalid descriptor {0}: {1}")]
    Invalid(PathBuf, String),
}

// =============================================================================
// Geometry
// =============================================================================

/// A pixel size, rendered as `"{width}x{height}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both dimensions rounded to the nearest ten.
    pub fn rounded(&self) -> Self {
        Self::new(round_to_ten(self.width), round_to_ten(self.height))
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ImageSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X', ','])
            .ok_or_else(|| format!("invalid size '{}', expected WIDTHxHEIGHT", s))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| format!("invalid width in '{}'", s))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| format!("invalid height in '{}'", s))?;
        Ok(Self::new(width, height))
    }
}

/// `round(x / 10) * 10` with ties to even.
pub fn round_to_ten(x: u32) -> u32 {
    ((x as f64 / 10.0).round_ties_even() * 10.0) as u32
}

/// Model input width: fixed, or derived from the image aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Auto,
    Fixed(u32),
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Auto => write!(f, "auto"),
            Dimension::Fixed(v) => write!(f, "{}", v),
        }
    }
}

impl Serialize for Dimension {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Dimension::Auto => serializer.serialize_str("auto"),
            Dimension::Fixed(v) => serializer.serialize_u32(*v),
        }
    }
}

impl<'de> Deserialize<'de> for Dimension {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(i64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(-1) => Ok(Dimension::Auto),
            Repr::Number(n) if n > 0 && n <= u32::MAX as i64 => Ok(Dimension::Fixed(n as u32)),
            Repr::Number(n) => Err(serde::de::Error::custom(format!(
                "dimension must be positive or -1, got {}",
                n
            ))),
            Repr::Text(s) if s.eq_ignore_ascii_case("auto") => Ok(Dimension::Auto),
            Repr::Text(s) => Err(serde::de::Error::custom(format!(
                "unknown dimension '{}'",
                s
            ))),
        }
    }
}

/// Input geometry of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputGeometry {
    pub width: Dimension,
    pub height: u32,
    #[serde(default = "default_channel")]
    pub channel: u32,
    /// Resize the raw image to `[width, height]` before anything else.
    #[serde(default)]
    pub resize: Option<[u32; 2]>,
}

fn default_channel() -> u32 {
    1
}

impl InputGeometry {
    /// Routing key such as `"100x30"` or `"autox30"`.
    pub fn size_key(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    pub fn is_auto_width(&self) -> bool {
        self.width == Dimension::Auto
    }

    pub fn matches_exact(&self, size: &ImageSize) -> bool {
        match self.width {
            Dimension::Auto => self.height == size.height,
            Dimension::Fixed(w) => w == size.width && self.height == size.height,
        }
    }

    pub fn matches_fuzzy(&self, size: &ImageSize) -> bool {
        let rounded = size.rounded();
        let height_ok = round_to_ten(self.height) == rounded.height;
        match self.width {
            Dimension::Auto => height_ok,
            Dimension::Fixed(w) => height_ok && round_to_ten(w) == rounded.width,
        }
    }

    /// Target size the model consumes for an image of `size`.
    pub fn resolve(&self, size: &ImageSize) -> ImageSize {
        match self.width {
            Dimension::Fixed(w) => ImageSize::new(w, self.height),
            Dimension::Auto => {
                let scaled = if size.height == 0 {
                    1
                } else {
                    (size.width as f64 * self.height as f64 / size.height as f64).round() as u32
                };
                ImageSize::new(scaled.max(1), self.height)
            }
        }
    }
}

// =============================================================================
// Categories
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CategorySpec {
    Named(String),
    Symbols(Vec<String>),
}

/// Ordered symbol table; index 0 is always [`BLANK`].
#[derive(Debug, Clone, PartialEq)]
pub struct CategorySet {
    name: Option<String>,
    symbols: Vec<String>,
}

impl CategorySet {
    pub fn from_spec(spec: &CategorySpec) -> Result<Self, String> {
        let (name, body) = match spec {
            CategorySpec::Named(name) => {
                let chars = named_charset(name)
                    .ok_or_else(|| format!("unknown category set '{}'", name))?;
                (
                    Some(name.clone()),
                    chars.chars().map(|c| c.to_string()).collect::<Vec<_>>(),
                )
            }
            CategorySpec::Symbols(list) => (None, list.clone()),
        };
        if body.is_empty() {
            return Err("category list is empty".to_string());
        }
        let mut symbols = Vec::with_capacity(body.len() + 1);
        symbols.push(BLANK.to_string());
        symbols.extend(body);
        Ok(Self { name, symbols })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Symbol at `index`; blank, negative and overflowing indices yield `None`.
    pub fn symbol(&self, index: i64) -> Option<&str> {
        if index <= 0 {
            return None;
        }
        self.symbols.get(index as usize).map(String::as_str)
    }

    /// Number of symbols including the blank.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.len() <= 1
    }
}

fn named_charset(name: &str) -> Option<String> {
    let set = match name {
        "NUMERIC" => NUMBER.to_string(),
        "ALPHABET_LOWER" => ALPHA_LOWER.to_string(),
        "ALPHABET_UPPER" => ALPHA_UPPER.to_string(),
        "ALPHABET" => format!("{}{}", ALPHA_LOWER, ALPHA_UPPER),
        "ALPHANUMERIC" => format!("{}{}{}", NUMBER, ALPHA_LOWER, ALPHA_UPPER),
        "ALPHANUMERIC_LOWER" => format!("{}{}", NUMBER, ALPHA_LOWER),
        "ALPHANUMERIC_UPPER" => format!("{}{}", NUMBER, ALPHA_UPPER),
        "ARITHMETIC" => format!("{}{}", NUMBER, OPERATORS),
        _ => return None,
    };
    Some(set)
}

// =============================================================================
// Pretreatment
// =============================================================================

/// Base pretreatment applied to every image before any variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Pretreatment {
    pub binarization: Option<u8>,
    pub invert: bool,
    pub blur: Option<f32>,
}

/// Named image transform, applied in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformStep {
    Grayscale,
    Binarize { threshold: u8 },
    Invert,
    Blur { sigma: f32 },
    Brighten { value: i32 },
    Contrast { value: f32 },
    Resize { width: u32, height: u32 },
}

/// Auxiliary model inferred over one slice of the request batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuxiliaryRef {
    pub index: usize,
    pub model: String,
}

// =============================================================================
// Descriptor
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptorFile {
    name: String,
    #[serde(default = "default_version")]
    version: f64,
    #[serde(default)]
    model_type: String,
    #[serde(default)]
    sites: Vec<String>,
    artifact: PathBuf,
    input: InputGeometry,
    categories: CategorySpec,
    #[serde(default)]
    arithmetic: bool,
    #[serde(default)]
    output_split: Option<String>,
    #[serde(default)]
    category_split: Option<String>,
    #[serde(default)]
    pretreatment: Pretreatment,
    #[serde(default)]
    variants: BTreeMap<String, Vec<TransformStep>>,
    #[serde(default)]
    crop: Option<CropSpec>,
    #[serde(default)]
    auxiliary: Vec<AuxiliaryRef>,
}

fn default_version() -> f64 {
    1.0
}

/// Immutable description of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub name: String,
    pub version: f64,
    pub model_type: String,
    pub sites: Vec<String>,
    pub artifact: PathBuf,
    pub input: InputGeometry,
    pub categories: CategorySet,
    pub arithmetic: bool,
    pub output_split: Option<String>,
    pub category_split: Option<String>,
    pub pretreatment: Pretreatment,
    pub variants: BTreeMap<String, Vec<TransformStep>>,
    pub crop: Option<CropSpec>,
    pub auxiliary: Vec<AuxiliaryRef>,
}

impl ModelDescriptor {
    /// Load and validate a descriptor file.
    pub fn load(path: &Path) -> Result<Self, DescriptorError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DescriptorError::Io(path.to_path_buf(), e.to_string()))?;
        Self::from_yaml(&content, path)
    }

    /// Parse descriptor YAML; `source` is used for error messages only.
    pub fn from_yaml(content: &str, source: &Path) -> Result<Self, DescriptorError> {
        let file: DescriptorFile = serde_yaml::from_str(content)
            .map_err(|e| DescriptorError::Parse(source.to_path_buf(), e.to_string()))?;
        let invalid = |msg: String| DescriptorError::Invalid(source.to_path_buf(), msg);

        if file.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if file.input.height == 0 {
            return Err(invalid("input.height must be positive".to_string()));
        }
        if !(1..=4).contains(&file.input.channel) {
            return Err(invalid(format!(
                "input.channel must be between 1 and 4, got {}",
                file.input.channel
            )));
        }
        if let Some([w, h]) = file.input.resize {
            if w == 0 || h == 0 {
                return Err(invalid("input.resize must be positive".to_string()));
            }
        }
        if !file.version.is_finite() {
            return Err(invalid("version must be a finite number".to_string()));
        }
        let categories = CategorySet::from_spec(&file.categories).map_err(invalid)?;
        if let Some(crop) = &file.crop {
            crop.validate().map_err(invalid)?;
        }
        if let Some(aux) = file.auxiliary.iter().find(|a| a.model.trim().is_empty()) {
            return Err(invalid(format!(
                "auxiliary model name at index {} is empty",
                aux.index
            )));
        }

        let arithmetic = file.arithmetic || categories.name() == Some("ARITHMETIC");

        Ok(Self {
            name: file.name,
            version: file.version,
            model_type: file.model_type,
            sites: file.sites,
            artifact: file.artifact,
            input: file.input,
            categories,
            arithmetic,
            output_split: file.output_split,
            category_split: file.category_split,
            pretreatment: file.pretreatment,
            variants: file.variants,
            crop: file.crop,
            auxiliary: file.auxiliary,
        })
    }

    pub fn size_key(&self) -> String {
        self.input.size_key()
    }

    pub fn has_site(&self, site: &str) -> bool {
        self.sites.iter().any(|s| s == site)
    }

    /// Artifact path, resolved against `graph_dir` when relative.
    pub fn artifact_path(&self, graph_dir: &Path) -> PathBuf {
        if self.artifact.is_absolute() {
            self.artifact.clone()
        } else {
            graph_dir.join(&self.artifact)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
name: digits-100x30
version: 2.0
model_type: numeric
sites: [bank.example.com]
artifact: digits-100x30.onnx
input: { width: 100, height: 30, channel: 1, resize: [100, 30] }
categories: NUMERIC
output_split: ","
category_split: ""
pretreatment: { binarization: 128, invert: false }
variants:
  dark: [ { op: invert }, { op: binarize, threshold: 100 } ]
crop:
  coordinates: true
  title_index: [0]
  groups:
    - { start: [0, 0], size: [50, 30], count: [2, 1], gap: [0, 0] }
auxiliary:
  - { index: 0, model: title-reader }
"#;

    fn parse(yaml: &str) -> Result<ModelDescriptor, DescriptorError> {
        ModelDescriptor::from_yaml(yaml, Path::new("test.yaml"))
    }

    #[test]
    fn test_parse_full_descriptor() {
        let d = parse(FULL).unwrap();
        assert_eq!(d.name, "digits-100x30");
        assert_eq!(d.version, 2.0);
        assert_eq!(d.size_key(), "100x30");
        assert_eq!(d.categories.len(), 11);
        assert_eq!(d.categories.symbol(1), Some("0"));
        assert_eq!(
            d.variants["dark"],
            vec![
                TransformStep::Invert,
                TransformStep::Binarize { threshold: 100 }
            ]
        );
        assert_eq!(d.crop.as_ref().unwrap().total_cells(), 2);
        assert_eq!(d.auxiliary[0].model, "title-reader");
        assert!(d.has_site("bank.example.com"));
        assert!(!d.arithmetic);
    }

    #[test]
    fn test_defaults() {
        let d = parse(
            "name: m\nartifact: m.onnx\ninput: { width: auto, height: 64 }\ncategories: [a, b]\n",
        )
        .unwrap();
        assert_eq!(d.version, 1.0);
        assert_eq!(d.input.channel, 1);
        assert!(d.input.is_auto_width());
        assert_eq!(d.size_key(), "autox64");
        assert_eq!(d.categories.symbol(0), None);
        assert_eq!(d.categories.symbol(2), Some("b"));
        assert_eq!(d.categories.symbol(3), None);
    }

    #[test]
    fn test_negative_width_is_auto() {
        let d = parse("name: m\nartifact: m.onnx\ninput: { width: -1, height: 32 }\ncategories: NUMERIC\n")
            .unwrap();
        assert_eq!(d.input.width, Dimension::Auto);
    }

    #[test]
    fn test_arithmetic_charset_implies_arithmetic() {
        let d = parse("name: m\nartifact: m.onnx\ninput: { width: 80, height: 30 }\ncategories: ARITHMETIC\n")
            .unwrap();
        assert!(d.arithmetic);
        assert_eq!(d.categories.len(), 1 + 10 + 7);
    }

    #[test]
    fn test_missing_required_field() {
        let err = parse("name: m\ninput: { width: 80, height: 30 }\ncategories: NUMERIC\n").unwrap_err();
        assert!(matches!(err, DescriptorError::Parse(..)));
    }

    #[test]
    fn test_zero_height_rejected() {
        let err = parse("name: m\nartifact: m.onnx\ninput: { width: 80, height: 0 }\ncategories: NUMERIC\n")
            .unwrap_err();
        assert!(matches!(err, DescriptorError::Invalid(..)));
    }

    #[test]
    fn test_zero_width_rejected() {
        let err = parse("name: m\nartifact: m.onnx\ninput: { width: 0, height: 30 }\ncategories: NUMERIC\n")
            .unwrap_err();
        assert!(matches!(err, DescriptorError::Parse(..)));
    }

    #[test]
    fn test_empty_categories_rejected() {
        let err = parse("name: m\nartifact: m.onnx\ninput: { width: 80, height: 30 }\ncategories: []\n")
            .unwrap_err();
        assert!(matches!(err, DescriptorError::Invalid(..)));
    }

    #[test]
    fn test_unknown_charset_rejected() {
        let err = parse("name: m\nartifact: m.onnx\ninput: { width: 80, height: 30 }\ncategories: KANJI\n")
            .unwrap_err();
        assert!(err.to_string().contains("KANJI"));
    }

    #[test]
    fn test_unknown_transform_rejected() {
        let yaml = "name: m\nartifact: m.onnx\ninput: { width: 80, height: 30 }\ncategories: NUMERIC\nvariants:\n  x: [ { op: sharpen } ]\n";
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn test_round_to_ten() {
        assert_eq!(round_to_ten(101), 100);
        assert_eq!(round_to_ten(33), 30);
        assert_eq!(round_to_ten(36), 40);
        assert_eq!(round_to_ten(25), 20);
        assert_eq!(round_to_ten(35), 40);
    }

    #[test]
    fn test_fuzzy_matching() {
        let geometry = InputGeometry {
            width: Dimension::Fixed(100),
            height: 30,
            channel: 1,
            resize: None,
        };
        assert!(geometry.matches_fuzzy(&ImageSize::new(101, 33)));
        assert!(!geometry.matches_fuzzy(&ImageSize::new(120, 40)));
        assert!(!geometry.matches_exact(&ImageSize::new(101, 33)));
    }

    #[test]
    fn test_auto_width_resolve() {
        let geometry = InputGeometry {
            width: Dimension::Auto,
            height: 32,
            channel: 1,
            resize: None,
        };
        assert!(geometry.matches_exact(&ImageSize::new(500, 32)));
        assert_eq!(
            geometry.resolve(&ImageSize::new(200, 64)),
            ImageSize::new(100, 32)
        );
    }

    #[test]
    fn test_image_size_parse() {
        assert_eq!("100x30".parse::<ImageSize>().unwrap(), ImageSize::new(100, 30));
        assert!("100".parse::<ImageSize>().is_err());
        assert_eq!(ImageSize::new(7, 9).to_string(), "7x9");
    }

    #[test]
    fn test_artifact_path_resolution() {
        let d = parse(FULL).unwrap();
        assert_eq!(
            d.artifact_path(Path::new("/graphs")),
            PathBuf::from("/graphs/digits-100x30.onnx")
        );
    }
}
