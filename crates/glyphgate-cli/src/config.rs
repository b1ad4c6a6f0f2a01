//! Configuration file support for glyphgate
//!
//! Supports both YAML and TOML configuration files.
//!
//! # Example YAML configuration:
//! ```yaml
//! server:
//!   port: 19952
//!   bind: "0.0.0.0"
//!   workers: 4
//!
//! models:
//!   descriptor_dir: /srv/glyphgate/models
//!   graph_dir: /srv/glyphgate/graphs
//!   default_model: digits
//!
//! auth:
//!   credentials:
//!     - accessKey: client-a
//!       secretKey: s3cret
//!
//! rate_limit:
//!   address_limit: 1000
//!   blacklist_trigger: 5
//!
//! logging:
//!   level: info
//!   format: json
//! ```

use glyphgate_runtime::{Credential, ImageSize, RateLimitConfig, ResponseFields};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Model directories and hot reload settings
    pub models: ModelsConfig,

    /// Signature credentials for the authenticated endpoint
    pub auth: AuthConfig,

    /// Quotas, black/whitelists and the image-size allowlist
    pub rate_limit: RateLimitConfig,

    /// Field names used in prediction responses
    pub response: ResponseFields,

    /// Copy of every recognized image
    pub audit: AuditConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Server port
    pub port: u16,

    /// Bind address
    pub bind: String,

    /// Inference worker threads, defaults to the available parallelism
    pub workers: Option<usize>,

    /// Per-job inference timeout in milliseconds, `0` disables it
    pub inference_timeout_ms: u64,

    /// Take the client address from `X-Forwarded-For`
    pub trust_forwarded_for: bool,

    /// Maximum request body size in bytes
    pub max_body_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 19952,
            bind: "127.0.0.1".to_string(),
            workers: None,
            inference_timeout_ms: 10_000,
            trust_forwarded_for: false,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn inference_timeout(&self) -> Option<Duration> {
        (self.inference_timeout_ms > 0).then(|| Duration::from_millis(self.inference_timeout_ms))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Model directories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ModelsConfig {
    /// Directory of YAML model descriptors, watched for changes
    pub descriptor_dir: PathBuf,

    /// Base directory for relative artifact paths
    pub graph_dir: PathBuf,

    /// Model registered as the routing fallback
    pub default_model: Option<String>,

    /// Descriptor directory polling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Load attempts for a new or changed descriptor
    pub retry_attempts: u32,

    /// Delay between load attempts in seconds
    pub retry_delay_secs: u64,

    /// Site routing ignores image size
    pub strict_sites: bool,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            descriptor_dir: PathBuf::from("models"),
            graph_dir: PathBuf::from("graphs"),
            default_model: None,
            poll_interval_ms: 1000,
            retry_attempts: 12,
            retry_delay_secs: 5,
            strict_sites: true,
        }
    }
}

/// Signature credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Accepted access/secret key pairs. When empty a key pair is derived
    /// from the host identity.
    pub credentials: Vec<Credential>,

    /// Accepted clock skew for the `timestamp` parameter
    pub timestamp_tolerance_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            timestamp_tolerance_secs: glyphgate_runtime::admission::DEFAULT_TIMESTAMP_TOLERANCE_SECS,
        }
    }
}

/// Audit configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("audit"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file (YAML or TOML, auto-detected by extension)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let config = match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => {
                // Try YAML first, then TOML
                Self::from_yaml(&content).or_else(|_| Self::from_toml(&content))
            }
        }?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Reject values that would only fail later at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.workers == Some(0) {
            return Err(ConfigError::Invalid("server.workers must be at least 1".into()));
        }
        if self.server.max_body_bytes == 0 {
            return Err(ConfigError::Invalid("server.max_body_bytes must be positive".into()));
        }
        if self.models.descriptor_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("models.descriptor_dir is required".into()));
        }
        if self.models.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "models.poll_interval_ms must be positive".into(),
            ));
        }
        if self.models.retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "models.retry_attempts must be at least 1".into(),
            ));
        }
        if self.auth.timestamp_tolerance_secs < 0 {
            return Err(ConfigError::Invalid(
                "auth.timestamp_tolerance_secs must not be negative".into(),
            ));
        }
        if let Some(c) = self
            .auth
            .credentials
            .iter()
            .find(|c| c.access_key.is_empty() || c.secret_key.is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "credential '{}' has an empty key",
                c.access_key
            )));
        }
        if self.rate_limit.max_tracked_addresses == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.max_tracked_addresses must be positive".into(),
            ));
        }
        for size in &self.rate_limit.allowed_sizes {
            size.parse::<ImageSize>().map_err(|e| {
                ConfigError::Invalid(format!("rate_limit.allowed_sizes: '{}': {}", size, e))
            })?;
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// Create an example configuration
    pub fn example() -> Self {
        Self {
            server: ServerConfig {
                port: 19952,
                bind: "0.0.0.0".to_string(),
                workers: Some(4),
                ..Default::default()
            },
            models: ModelsConfig {
                descriptor_dir: PathBuf::from("/srv/glyphgate/models"),
                graph_dir: PathBuf::from("/srv/glyphgate/graphs"),
                default_model: Some("digits".to_string()),
                ..Default::default()
            },
            auth: AuthConfig {
                credentials: vec![Credential::new("your-access-key", "your-secret-key")],
                ..Default::default()
            },
            rate_limit: RateLimitConfig {
                address_limit: 1000,
                global_limit: 100_000,
                blacklist_trigger: Some(5),
                blacklist_file: Some(PathBuf::from("/srv/glyphgate/blacklist.txt")),
                allowed_sizes: vec!["100x30".to_string()],
                ..Default::default()
            },
            response: ResponseFields::default(),
            audit: AuditConfig {
                enabled: false,
                dir: PathBuf::from("/srv/glyphgate/audit"),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "json".to_string(),
            },
        }
    }

    /// Generate example YAML configuration
    pub fn example_yaml() -> String {
        serde_yaml::to_string(&Self::example()).unwrap_or_default()
    }

    /// Generate example TOML configuration
    pub fn example_toml() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
