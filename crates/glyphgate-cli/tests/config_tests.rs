//! Config parsing (YAML, TOML), defaults, validation and example generation.

use glyphgate_cli::config::*;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Defaults
// =============================================================================

#[test]
fn config_default_server() {
    let cfg = Config::default();
    assert_eq!(cfg.server.port, 19952);
    assert_eq!(cfg.server.bind, "127.0.0.1");
    assert_eq!(cfg.server.inference_timeout(), Some(Duration::from_secs(10)));
    assert!(!cfg.server.trust_forwarded_for);
}

#[test]
fn config_default_models() {
    let cfg = Config::default();
    assert_eq!(cfg.models.descriptor_dir, PathBuf::from("models"));
    assert_eq!(cfg.models.poll_interval_ms, 1000);
    assert_eq!(cfg.models.retry_attempts, 12);
    assert_eq!(cfg.models.retry_delay_secs, 5);
    assert!(cfg.models.strict_sites);
}

#[test]
fn config_default_rate_limit_is_unlimited() {
    let cfg = Config::default();
    assert!(cfg.rate_limit.is_unlimited());
    assert_eq!(cfg.rate_limit.address_reset_secs, 3600);
    assert_eq!(cfg.rate_limit.global_reset_secs, 86400);
}

#[test]
fn config_default_response_fields() {
    let cfg = Config::default();
    assert_eq!(cfg.response.message, "message");
    assert_eq!(cfg.response.code, "code");
    assert_eq!(cfg.response.success, "success");
    assert_eq!(cfg.response.request_id, "uid");
}

#[test]
fn config_default_auth() {
    let cfg = Config::default();
    assert!(cfg.auth.credentials.is_empty());
    assert_eq!(cfg.auth.timestamp_tolerance_secs, 120);
}

// =============================================================================
// Parsing
// =============================================================================

#[test]
fn config_full_yaml() {
    let yaml = r#"
server:
  port: 8000
  bind: "0.0.0.0"
  trust_forwarded_for: true
models:
  descriptor_dir: /srv/models
  graph_dir: /srv/graphs
  default_model: digits
  strict_sites: false
auth:
  credentials:
    - accessKey: a
      secretKey: b
    - access_key: c
      secret_key: d
rate_limit:
  address_limit: 100
  global_limit: 1000
  blacklist_trigger: 3
  whitelist_only: true
  whitelist: ["10.0.0.1"]
  allowed_sizes: ["100x30"]
response:
  message: result
audit:
  enabled: true
  dir: /srv/audit
logging:
  level: debug
  format: json
"#;
    let cfg = Config::from_yaml(yaml).unwrap();
    cfg.validate().unwrap();

    assert_eq!(cfg.server.port, 8000);
    assert!(cfg.server.trust_forwarded_for);
    assert_eq!(cfg.models.graph_dir, PathBuf::from("/srv/graphs"));
    assert!(!cfg.models.strict_sites);
    assert_eq!(cfg.auth.credentials.len(), 2);
    assert_eq!(cfg.auth.credentials[1].access_key, "c");
    assert_eq!(cfg.rate_limit.blacklist_trigger, Some(3));
    assert_eq!(
        cfg.rate_limit.whitelist,
        vec!["10.0.0.1".parse::<IpAddr>().unwrap()]
    );
    assert_eq!(cfg.response.message, "result");
    assert_eq!(cfg.response.code, "code");
    assert!(cfg.audit.enabled);
    assert_eq!(cfg.logging.format, "json");
}

#[test]
fn config_toml() {
    let toml = r#"
[server]
port = 8000

[models]
descriptor_dir = "/srv/models"

[rate_limit]
address_limit = 5
blacklist_file = "/srv/blacklist.txt"

[[auth.credentials]]
accessKey = "a"
secretKey = "b"
"#;
    let cfg = Config::from_toml(toml).unwrap();
    assert_eq!(cfg.server.port, 8000);
    assert_eq!(cfg.rate_limit.address_limit, 5);
    assert_eq!(
        cfg.rate_limit.blacklist_file,
        Some(PathBuf::from("/srv/blacklist.txt"))
    );
    assert_eq!(cfg.auth.credentials[0].secret_key, "b");
}

#[test]
fn config_invalid_yaml() {
    assert!(matches!(
        Config::from_yaml("server: [1, 2"),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
fn config_rejects_unknown_keys() {
    assert!(matches!(
        Config::from_yaml("rate_limt:\n  address_limit: 5\n"),
        Err(ConfigError::ParseError(_))
    ));
    assert!(matches!(
        Config::from_yaml("rate_limit:\n  adress_limit: 5\n"),
        Err(ConfigError::ParseError(_))
    ));
    assert!(matches!(
        Config::from_toml("[server]\nprot = 8000\n"),
        Err(ConfigError::ParseError(_))
    ));
}

// =============================================================================
// Loading from files
// =============================================================================

#[test]
fn config_load_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = dir.path().join("glyphgate.yaml");
    std::fs::write(&yaml, "server:\n  port: 8001\n").unwrap();
    let toml = dir.path().join("glyphgate.toml");
    std::fs::write(&toml, "[server]\nport = 8002\n").unwrap();
    let other = dir.path().join("glyphgate.conf");
    std::fs::write(&other, "[server]\nport = 8003\n").unwrap();

    assert_eq!(Config::load(&yaml).unwrap().server.port, 8001);
    assert_eq!(Config::load(&toml).unwrap().server.port, 8002);
    assert_eq!(Config::load(&other).unwrap().server.port, 8003);
}

#[test]
fn config_load_missing_file() {
    assert!(matches!(
        Config::load("/nonexistent/glyphgate.yaml"),
        Err(ConfigError::IoError(_, _))
    ));
}

#[test]
fn config_load_validates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("glyphgate.yaml");
    std::fs::write(&path, "logging:\n  format: xml\n").unwrap();
    assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn config_rejects_empty_credential() {
    let cfg = Config::from_yaml("auth:\n  credentials:\n    - { accessKey: a, secretKey: '' }\n")
        .unwrap();
    assert!(cfg.validate().is_err());
}

#[test]
fn config_rejects_zero_retry_attempts() {
    let mut cfg = Config::default();
    cfg.models.retry_attempts = 0;
    assert!(cfg.validate().is_err());
}

// =============================================================================
// Examples
// =============================================================================

#[test]
fn example_yaml_round_trips() {
    let cfg = Config::from_yaml(&Config::example_yaml()).unwrap();
    assert_eq!(cfg, Config::example());
    cfg.validate().unwrap();
}

#[test]
fn example_toml_round_trips() {
    let cfg = Config::from_toml(&Config::example_toml()).unwrap();
    assert_eq!(cfg, Config::example());
}
