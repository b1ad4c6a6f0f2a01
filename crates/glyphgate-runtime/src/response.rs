//! Stable response codes and the structured prediction response.
//!
//! Every request, successful or not, produces a [`PredictResponse`]. The
//! numeric codes are part of the wire contract and never change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wire-stable result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    InvalidPublicParams,
    UnknownServerError,
    InvalidTimestamp,
    InvalidAccessKey,
    InvalidQueryString,
    AddressQuotaExceeded,
    GlobalQuotaExceeded,
    Blacklisted,
    NotWhitelisted,
    ImageSizeNotAllowed,
    InvalidImageFormat,
    InvalidBase64String,
    ImageDamage,
    ImageSizeMismatch,
    MissingParameter,
    UnsupportedParameter,
    InferenceFailed,
    InferenceTimeout,
    ServiceUnavailable,
    ServiceNotReady,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 21] = [
        ErrorCode::Success,
        ErrorCode::InvalidPublicParams,
        ErrorCode::UnknownServerError,
        ErrorCode::InvalidTimestamp,
        ErrorCode::InvalidAccessKey,
        ErrorCode::InvalidQueryString,
        ErrorCode::AddressQuotaExceeded,
        ErrorCode::GlobalQuotaExceeded,
        ErrorCode::Blacklisted,
        ErrorCode::NotWhitelisted,
        ErrorCode::ImageSizeNotAllowed,
        ErrorCode::InvalidImageFormat,
        ErrorCode::InvalidBase64String,
        ErrorCode::ImageDamage,
        ErrorCode::ImageSizeMismatch,
        ErrorCode::MissingParameter,
        ErrorCode::UnsupportedParameter,
        ErrorCode::InferenceFailed,
        ErrorCode::InferenceTimeout,
        ErrorCode::ServiceUnavailable,
        ErrorCode::ServiceNotReady,
    ];

    pub fn code(self) -> i64 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::InvalidPublicParams => 400001,
            ErrorCode::UnknownServerError => 400002,
            ErrorCode::InvalidTimestamp => 400004,
            ErrorCode::InvalidAccessKey => 400005,
            ErrorCode::InvalidQueryString => 400006,
            ErrorCode::AddressQuotaExceeded => 300001,
            ErrorCode::GlobalQuotaExceeded => 300002,
            ErrorCode::Blacklisted => 300003,
            ErrorCode::NotWhitelisted => 300004,
            ErrorCode::ImageSizeNotAllowed => 300005,
            ErrorCode::InvalidImageFormat => 500001,
            ErrorCode::InvalidBase64String => 500002,
            ErrorCode::ImageDamage => 500003,
            ErrorCode::ImageSizeMismatch => 500004,
            ErrorCode::MissingParameter => 500005,
            ErrorCode::UnsupportedParameter => 500006,
            ErrorCode::InferenceFailed => 500007,
            ErrorCode::InferenceTimeout => 500008,
            ErrorCode::ServiceUnavailable => -999,
            ErrorCode::ServiceNotReady => -998,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::InvalidPublicParams => "Invalid Public Params",
            ErrorCode::UnknownServerError => "Unknown Server Error",
            ErrorCode::InvalidTimestamp => "Invalid Timestamp",
            ErrorCode::InvalidAccessKey => "Invalid Access Key",
            ErrorCode::InvalidQueryString => "Invalid Query String",
            ErrorCode::AddressQuotaExceeded => "Request quota exceeded for this address",
            ErrorCode::GlobalQuotaExceeded => "Service request quota exceeded",
            ErrorCode::Blacklisted => "Address is blacklisted",
            ErrorCode::NotWhitelisted => "Address is not whitelisted",
            ErrorCode::ImageSizeNotAllowed => "Image size is not allowed",
            ErrorCode::InvalidImageFormat => "Invalid Image Format",
            ErrorCode::InvalidBase64String => "Invalid Base64 String",
            ErrorCode::ImageDamage => "Image Damage",
            ErrorCode::ImageSizeMismatch => "Image Size Not Match Graph",
            ErrorCode::MissingParameter => "Missing Parameter",
            ErrorCode::UnsupportedParameter => "Unsupported Parameter",
            ErrorCode::InferenceFailed => "Inference Failed",
            ErrorCode::InferenceTimeout => "Inference Timeout",
            ErrorCode::ServiceUnavailable => "The system has not yet loaded the model",
            ErrorCode::ServiceNotReady => "No model matches the request",
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// Names of the four response fields, configurable per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResponseFields {
    pub message: String,
    pub code: String,
    pub success: String,
    pub request_id: String,
}

impl Default for ResponseFields {
    fn default() -> Self {
        Self {
            message: "message".to_string(),
            code: "code".to_string(),
            success: "success".to_string(),
            request_id: "uid".to_string(),
        }
    }
}

/// Structured outcome of one prediction request.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictResponse {
    pub message: Value,
    pub code: ErrorCode,
    pub request_id: String,
    /// False when the request was turned away before a model was selected;
    /// such attempts are refunded to the rate limiter.
    pub charged: bool,
}

impl PredictResponse {
    pub fn success(message: Value, request_id: impl Into<String>) -> Self {
        Self {
            message,
            code: ErrorCode::Success,
            request_id: request_id.into(),
            charged: true,
        }
    }

    pub fn error(code: ErrorCode, request_id: impl Into<String>) -> Self {
        Self {
            message: Value::String(code.message().to_string()),
            code,
            request_id: request_id.into(),
            charged: true,
        }
    }

    pub fn uncharged(mut self) -> Self {
        self.charged = false;
        self
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Render with the configured field names.
    pub fn to_json(&self, fields: &ResponseFields) -> Value {
        let mut body = Map::new();
        body.insert(fields.message.clone(), self.message.clone());
        body.insert(fields.code.clone(), Value::from(self.code.code()));
        body.insert(fields.success.clone(), Value::Bool(self.is_success()));
        body.insert(
            fields.request_id.clone(),
            Value::String(self.request_id.clone()),
        );
        Value::Object(body)
    }
}
