//! MD5 request signatures.
//!
//! A signed request carries `accessKey`, `timestamp` and `sign` alongside its
//! business parameters. The signature is the uppercase MD5 hex digest of
//! every parameter except `sign`, rendered as `k=v` pairs sorted by key and
//! joined with `&`, followed by `&` and the secret key.

use super::AdmissionError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_TIMESTAMP_TOLERANCE_SECS: i64 = 120;

const SIGN: &str = "sign";
const TIMESTAMP: &str = "timestamp";
const ACCESS_KEY: &str = "accessKey";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credential {
    #[serde(rename = "accessKey", alias = "access_key")]
    pub access_key: String,
    #[serde(rename = "secretKey", alias = "secret_key")]
    pub secret_key: String,
}

impl Credential {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Deterministic credential for deployments without configured keys.
    pub fn derive_default(model_name: &str, hardware_id: &str) -> Self {
        let access_key = format!("{:x}", md5::compute(format!("{}{}", model_name, hardware_id)));
        let secret_key = format!(
            "{:x}",
            md5::compute(format!("{}{}{}", hardware_id, model_name, access_key))
        );
        Self {
            access_key,
            secret_key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    credentials: Vec<Credential>,
    tolerance_secs: i64,
}

impl SignatureVerifier {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            credentials,
            tolerance_secs: DEFAULT_TIMESTAMP_TOLERANCE_SECS,
        }
    }

    pub fn with_tolerance(mut self, secs: i64) -> Self {
        self.tolerance_secs = secs;
        self
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    pub fn verify(&self, params: &Map<String, Value>) -> Result<(), AdmissionError> {
        self.verify_at(params, Utc::now().timestamp())
    }

    /// Verify against an explicit clock, in Unix seconds.
    pub fn verify_at(&self, params: &Map<String, Value>, now: i64) -> Result<(), AdmissionError> {
        let sign = params
            .get(SIGN)
            .ok_or(AdmissionError::MissingPublicParam(SIGN))?;
        let timestamp = params
            .get(TIMESTAMP)
            .ok_or(AdmissionError::MissingPublicParam(TIMESTAMP))?;
        let access_key = params
            .get(ACCESS_KEY)
            .ok_or(AdmissionError::MissingPublicParam(ACCESS_KEY))?;

        let timestamp = value_text(timestamp);
        if timestamp.len() != 10 || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AdmissionError::InvalidTimestamp);
        }
        let ts: i64 = timestamp
            .parse()
            .map_err(|_| AdmissionError::InvalidTimestamp)?;
        if (now - ts).abs() > self.tolerance_secs {
            return Err(AdmissionError::InvalidTimestamp);
        }

        let access_key = value_text(access_key);
        let credential = self
            .credentials
            .iter()
            .find(|c| constant_time_compare(&c.access_key, &access_key))
            .ok_or(AdmissionError::InvalidAccessKey)?;

        let expected = sign_params(params, &credential.secret_key);
        if constant_time_compare(&expected, &value_text(sign)) {
            Ok(())
        } else {
            Err(AdmissionError::InvalidSignature)
        }
    }
}

/// `k=v` pairs of every parameter except `sign`, sorted by key.
pub fn canonical_query(params: &Map<String, Value>) -> String {
    let mut pairs: Vec<(&String, &Value)> = params.iter().filter(|(k, _)| *k != SIGN).collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, value_text(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Uppercase MD5 signature of `params` under `secret_key`.
pub fn sign_params(params: &Map<String, Value>, secret_key: &str) -> String {
    let payload = format!("{}&{}", canonical_query(params), secret_key);
    format!("{:x}", md5::compute(payload)).to_uppercase()
}

// Strings sign raw; booleans and null use the spelling existing clients emit.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

/// Constant-time comparison to prevent timing attacks
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }

    result == 0
}
