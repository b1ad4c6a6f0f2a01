//! End-to-end tests of the dispatch pipeline against a mock engine.

mod common;

use common::*;
use glyphgate_runtime::payload::join_batch;
use image::{DynamicImage, Rgb, RgbImage};
use glyphgate_runtime::{
    DispatchConfig, ErrorCode, ImagePayload, ModelRegistry, PredictRequest, SizeAllowlist,
};
use serde_json::json;
use std::sync::Arc;

fn registry_with(engine: &MockEngine, yamls: &[String]) -> Arc<ModelRegistry> {
    let registry = Arc::new(ModelRegistry::new());
    for yaml in yamls {
        registry.add(instance(engine, yaml));
    }
    registry
}

// =============================================================================
// Payloads
// =============================================================================

#[tokio::test]
async fn test_two_images_in_one_string() {
    let engine = MockEngine::new();
    let registry = registry_with(&engine, &[descriptor_yaml("m", 10, 10, "")]);
    let d = dispatcher(registry, DispatchConfig::default());

    let joined = join_batch(&[png(10, 10, WHITE), png(10, 10, BLACK)]);
    let resp = d.dispatch(PredictRequest::new(b64(&joined).as_str())).await;
    assert_eq!(resp.code, ErrorCode::Success);
    assert_eq!(resp.message, json!("A,B"));
}

#[tokio::test]
async fn test_list_payload_with_output_split_override() {
    let engine = MockEngine::new();
    let registry = registry_with(&engine, &[descriptor_yaml("m", 10, 10, "")]);
    let d = dispatcher(registry, DispatchConfig::default());

    let mut req = PredictRequest::new("");
    req.image = ImagePayload::Batch(vec![b64(&png(10, 10, BLACK)), b64(&png(10, 10, WHITE))]);
    req.output_split = Some("|".to_string());
    let resp = d.dispatch(req).await;
    assert_eq!(resp.message, json!("B|A"));
}

#[tokio::test]
async fn test_single_image_returns_bare_label() {
    let engine = MockEngine::new();
    let registry = registry_with(&engine, &[descriptor_yaml("m", 10, 10, "")]);
    let d = dispatcher(registry, DispatchConfig::default());

    let resp = d
        .dispatch(PredictRequest::new(b64(&png(10, 10, WHITE)).as_str()))
        .await;
    assert!(resp.is_success());
    assert_eq!(resp.message, json!("A"));
    assert!(!resp.request_id.is_empty());
    assert!(resp.charged);
}

#[tokio::test]
async fn test_unrecognized_image_is_uncharged() {
    let engine = MockEngine::new();
    let registry = registry_with(&engine, &[descriptor_yaml("m", 10, 10, "")]);
    let d = dispatcher(registry, DispatchConfig::default());

    let resp = d.dispatch(PredictRequest::new(b64(b"plain text").as_str())).await;
    assert_eq!(resp.code, ErrorCode::InvalidImageFormat);
    assert!(!resp.charged);
}

#[tokio::test]
async fn test_request_flags_reach_preprocessing() {
    let engine = MockEngine::new();
    let registry = registry_with(&engine, &[descriptor_yaml("m", 10, 10, "")]);
    let d = dispatcher(registry, DispatchConfig::default());

    let mut req = PredictRequest::new(b64(&png(10, 10, WHITE)).as_str());
    req.flags = Some(json!({"steps": [{"op": "invert"}]}));
    let resp = d.dispatch(req.clone()).await;
    assert_eq!(resp.message, json!("B"));

    req.flags = Some(json!({"steps": "invert"}));
    let resp = d.dispatch(req).await;
    assert_eq!(resp.code, ErrorCode::UnsupportedParameter);
    assert!(resp.charged);
}

#[tokio::test]
async fn test_truncated_second_buffer() {
    let engine = MockEngine::new();
    let registry = registry_with(&engine, &[descriptor_yaml("m", 10, 10, "")]);
    let d = dispatcher(registry, DispatchConfig::default());

    let joined = join_batch(&[png(10, 10, WHITE).as_slice(), b"\x89PN".as_slice()]);
    let resp = d.dispatch(PredictRequest::new(b64(&joined).as_str())).await;
    assert_eq!(resp.code, ErrorCode::InvalidImageFormat);
}

#[tokio::test]
async fn test_invalid_base64() {
    let engine = MockEngine::new();
    let registry = registry_with(&engine, &[descriptor_yaml("m", 10, 10, "")]);
    let d = dispatcher(registry, DispatchConfig::default());

    let resp = d.dispatch(PredictRequest::new("***")).await;
    assert_eq!(resp.code, ErrorCode::InvalidBase64String);
    assert_eq!(resp.code.code(), 500002);
    assert!(!resp.charged);
}

// =============================================================================
// Routing outcomes
// =============================================================================

#[tokio::test]
async fn test_no_models_loaded() {
    let d = dispatcher(Arc::new(ModelRegistry::new()), DispatchConfig::default());
    let resp = d
        .dispatch(PredictRequest::new(b64(&png(10, 10, WHITE)).as_str()))
        .await;
    assert_eq!(resp.code, ErrorCode::ServiceUnavailable);
    assert_eq!(resp.code.code(), -999);
    assert!(!resp.charged);
}

#[tokio::test]
async fn test_image_size_mismatch_on_default() {
    let engine = MockEngine::new();
    let registry = registry_with(&engine, &[descriptor_yaml("m", 10, 10, "")]);
    let d = dispatcher(registry, DispatchConfig::default());

    let resp = d
        .dispatch(PredictRequest::new(b64(&png(40, 40, WHITE)).as_str()))
        .await;
    assert_eq!(resp.code, ErrorCode::ImageSizeMismatch);
    // Routed to the default model before the mismatch surfaced
    assert!(resp.charged);
}

#[tokio::test]
async fn test_size_allowlist() {
    let engine = MockEngine::new();
    let registry = registry_with(&engine, &[descriptor_yaml("m", 10, 10, "")]);
    let config = DispatchConfig {
        allowed_sizes: SizeAllowlist::new(&["20x20"]),
        ..Default::default()
    };
    let d = dispatcher(registry, config);

    let resp = d
        .dispatch(PredictRequest::new(b64(&png(10, 10, WHITE)).as_str()))
        .await;
    assert_eq!(resp.code, ErrorCode::ImageSizeNotAllowed);
    assert!(!resp.charged);
}

#[tokio::test]
async fn test_route_by_name() {
    let engine = MockEngine::new().with_fixed("fixed", vec![2, 2]);
    let registry = registry_with(
        &engine,
        &[
            descriptor_yaml("m", 10, 10, ""),
            descriptor_yaml("fixed", 10, 10, ""),
        ],
    );
    let d = dispatcher(registry, DispatchConfig::default());

    let mut req = PredictRequest::new(b64(&png(10, 10, WHITE)).as_str());
    req.model_name = Some("fixed".to_string());
    assert_eq!(d.dispatch(req).await.message, json!("BB"));
}

// =============================================================================
// Parameters
// =============================================================================

#[tokio::test]
async fn test_variant_selection() {
    let engine = MockEngine::new();
    let yaml = descriptor_yaml(
        "m",
        10,
        10,
        "variants:\n  plain: []\n  flipped: [ { op: invert } ]\n",
    );
    let registry = registry_with(&engine, &[yaml]);
    let d = dispatcher(registry, DispatchConfig::default());
    let image = b64(&png(10, 10, WHITE));

    let resp = d.dispatch(PredictRequest::new(image.as_str())).await;
    assert_eq!(resp.code, ErrorCode::MissingParameter);

    let mut req = PredictRequest::new(image.as_str());
    req.param_key = Some("missing".to_string());
    assert_eq!(d.dispatch(req).await.code, ErrorCode::UnsupportedParameter);

    let mut req = PredictRequest::new(image.as_str());
    req.param_key = Some("flipped".to_string());
    assert_eq!(d.dispatch(req).await.message, json!("B"));
}

#[tokio::test]
async fn test_need_color() {
    let engine = MockEngine::new();
    let registry = registry_with(&engine, &[descriptor_yaml("m", 10, 10, "")]);
    let d = dispatcher(registry, DispatchConfig::default());
    let image = b64(&png(10, 10, [0, 0, 255]));

    let mut req = PredictRequest::new(image.as_str());
    req.need_color = Some("blue".to_string());
    assert_eq!(d.dispatch(req).await.message, json!("A"));

    let mut req = PredictRequest::new(image.as_str());
    req.need_color = Some("red".to_string());
    assert_eq!(d.dispatch(req).await.message, json!("B"));

    let mut req = PredictRequest::new(image.as_str());
    req.need_color = Some("purple".to_string());
    assert_eq!(d.dispatch(req).await.code, ErrorCode::UnsupportedParameter);
}

#[tokio::test]
async fn test_arithmetic_model() {
    // 3 + 4 =
    let engine = MockEngine::new().with_fixed("math", vec![4, 11, 5, 15]);
    let yaml = "name: math\nartifact: math.onnx\ninput: { width: 10, height: 10 }\ncategories: ARITHMETIC\n";
    let registry = registry_with(&engine, &[yaml.to_string()]);
    let d = dispatcher(registry, DispatchConfig::default());

    let resp = d
        .dispatch(PredictRequest::new(b64(&png(10, 10, WHITE)).as_str()))
        .await;
    assert_eq!(resp.message, json!("7"));
}

// =============================================================================
// Composite models
// =============================================================================

fn grid_yaml(coordinates: bool, auxiliary: bool) -> String {
    let mut extra = format!(
        "crop:\n  coordinates: {}\n  groups:\n    - {{ start: [0, 0], size: [50, 30], count: [2, 1], gap: [0, 0] }}\n",
        coordinates
    );
    if auxiliary {
        extra.push_str("auxiliary:\n  - { index: 0, model: title }\n");
    }
    descriptor_yaml("grid", 50, 30, &extra)
}

#[tokio::test]
async fn test_crop_coordinates_with_auxiliary_title() {
    let engine = MockEngine::new();
    let registry = registry_with(
        &engine,
        &[descriptor_yaml("title", 20, 20, ""), grid_yaml(true, true)],
    );
    let d = dispatcher(registry, DispatchConfig::default());

    let mut req = PredictRequest::new("");
    req.model_name = Some("grid".to_string());
    req.image = ImagePayload::Batch(vec![
        b64(&png(20, 20, WHITE)),
        b64(&split_png(100, 30, WHITE, WHITE)),
    ]);
    let resp = d.dispatch(req.clone()).await;
    assert_eq!(resp.code, ErrorCode::Success);
    assert_eq!(resp.message, json!([[25, 15], [75, 15]]));

    req.image = ImagePayload::Batch(vec![
        b64(&png(20, 20, WHITE)),
        b64(&split_png(100, 30, BLACK, WHITE)),
    ]);
    let resp = d.dispatch(req).await;
    assert_eq!(resp.message, json!([[75, 15]]));
}

#[tokio::test]
async fn test_crop_coordinates_with_title_cell() {
    let engine = MockEngine::new();
    let extra = "crop:\n  coordinates: true\n  title_index: [0]\n  groups:\n    - { start: [0, 0], size: [50, 30], count: [1, 1] }\n    - { start: [0, 30], size: [50, 30], count: [2, 1] }\n";
    let registry = registry_with(&engine, &[descriptor_yaml("grid", 50, 30, extra)]);
    let d = dispatcher(registry, DispatchConfig::default());

    // Title top-left is white; candidates below are black then white
    let img = RgbImage::from_fn(100, 60, |x, y| {
        if y >= 30 && x < 50 {
            Rgb(BLACK)
        } else {
            Rgb(WHITE)
        }
    });
    let mut req = PredictRequest::new(b64(&encode(DynamicImage::ImageRgb8(img))).as_str());
    req.model_name = Some("grid".to_string());
    let resp = d.dispatch(req).await;
    assert_eq!(resp.code, ErrorCode::Success);
    assert_eq!(resp.message, json!([[75, 45]]));
}

#[tokio::test]
async fn test_crop_labels_without_coordinates() {
    let engine = MockEngine::new();
    let registry = registry_with(&engine, &[grid_yaml(false, false)]);
    let d = dispatcher(registry, DispatchConfig::default());

    let mut req = PredictRequest::new(b64(&split_png(100, 30, WHITE, BLACK)).as_str());
    req.model_name = Some("grid".to_string());
    let resp = d.dispatch(req).await;
    assert_eq!(resp.message, json!("AB"));
}

#[tokio::test]
async fn test_missing_auxiliary_model() {
    let engine = MockEngine::new();
    let registry = registry_with(&engine, &[grid_yaml(true, true)]);
    let d = dispatcher(registry, DispatchConfig::default());

    let mut req = PredictRequest::new("");
    req.model_name = Some("grid".to_string());
    req.image = ImagePayload::Batch(vec![
        b64(&png(20, 20, WHITE)),
        b64(&split_png(100, 30, WHITE, WHITE)),
    ]);
    let resp = d.dispatch(req).await;
    assert_eq!(resp.code, ErrorCode::ServiceNotReady);
    assert!(resp.charged);
}

#[tokio::test]
async fn test_auxiliary_labels_prefix_main_output() {
    let engine = MockEngine::new();
    let registry = registry_with(
        &engine,
        &[
            descriptor_yaml("title", 20, 20, ""),
            descriptor_yaml("main", 10, 10, "auxiliary:\n  - { index: 0, model: title }\n"),
        ],
    );
    let d = dispatcher(registry, DispatchConfig::default());

    let mut req = PredictRequest::new("");
    req.model_name = Some("main".to_string());
    req.image = ImagePayload::Batch(vec![b64(&png(20, 20, BLACK)), b64(&png(10, 10, WHITE))]);
    let resp = d.dispatch(req).await;
    assert_eq!(resp.message, json!("B,A"));
}

// =============================================================================
// Audit
// =============================================================================

#[tokio::test]
async fn test_audit_writes_first_image() {
    let audit = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    let registry = registry_with(&engine, &[descriptor_yaml("m", 10, 10, "")]);
    let config = DispatchConfig {
        audit_dir: Some(audit.path().to_path_buf()),
        ..Default::default()
    };
    let d = dispatcher(registry, config);

    let resp = d
        .dispatch(PredictRequest::new(b64(&png(10, 10, WHITE)).as_str()))
        .await;
    let expected = audit.path().join(format!("A_{}.png", resp.request_id));
    assert!(eventually(|| expected.exists()).await);
}
