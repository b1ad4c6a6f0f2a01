//! # glyphgate runtime
//!
//! Serving core of the glyphgate image-recognition gateway.
//!
//! ## Modules
//!
//! - [`descriptor`]: YAML model descriptors
//! - [`model`]: loaded model instances and the loader
//! - [`registry`]: routing across ready instances
//! - [`watcher`]: hot reload of the descriptor directory
//! - [`dispatch`]: the per-request prediction pipeline
//! - [`admission`]: signature verification and rate limiting
//! - [`engine`] / [`preprocess`]: inference and image transform seams
//!
//! ## Example
//!
//! ```rust,no_run
//! use glyphgate_runtime::{
//!     default_engine, DispatchConfig, Dispatcher, ImagePreprocessor, InferencePool,
//!     ModelLoader, ModelRegistry, ModelWatcher, PredictRequest, WatcherConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> std::io::Result<()> {
//! let registry = Arc::new(ModelRegistry::new());
//! let loader = Arc::new(ModelLoader::new(default_engine(), "graphs"));
//! let watcher = Arc::new(ModelWatcher::new(
//!     WatcherConfig::new("models"),
//!     registry.clone(),
//!     loader,
//! ));
//! let baseline = watcher.initial_scan().await?;
//! let _handle = watcher.spawn(baseline);
//!
//! let dispatcher = Dispatcher::new(
//!     registry,
//!     Arc::new(ImagePreprocessor::new()),
//!     Arc::new(InferencePool::new(4, None)),
//!     DispatchConfig::default(),
//! );
//! let response = dispatcher.dispatch(PredictRequest::new("iVBORw0KGgo...")).await;
//! println!("{:?}", response.message);
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod arithmetic;
pub mod crop;
pub mod descriptor;
pub mod dispatch;
pub mod engine;
pub mod model;
pub mod payload;
pub mod pool;
pub mod preprocess;
pub mod registry;
pub mod response;
pub mod watcher;

pub use admission::{
    AdmissionError, Credential, QuotaTicket, RateLimitConfig, RateLimiter, SignatureVerifier,
    SizeAllowlist,
};
pub use descriptor::{DescriptorError, ImageSize, ModelDescriptor, TransformStep};
pub use dispatch::{DispatchConfig, DispatchError, Dispatcher, PredictRequest};
pub use engine::{default_engine, EngineError, InferenceEngine, InferenceSession, Tensor};
pub use model::{LoadError, ModelInstance, ModelLoader, ModelState};
pub use payload::{ImagePayload, BATCH_DELIMITER};
pub use pool::{InferencePool, PoolError};
pub use preprocess::{ImagePreprocessor, PreprocessError, Preprocessor, TargetColor};
pub use registry::{ModelRegistry, RegistryStatus};
pub use response::{ErrorCode, PredictResponse, ResponseFields};
pub use watcher::{ModelWatcher, WatchEvent, WatcherConfig, WatcherHandle};
