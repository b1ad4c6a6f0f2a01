//! Request admission: signature verification and rate limiting.
//!
//! Both checks run before a request reaches the dispatcher. They are
//! transport independent; the HTTP layer wraps them in filters.

mod limiter;
mod signature;

pub use limiter::{
    read_address_list, spawn_maintenance, QuotaTicket, RateLimitConfig, RateLimiter,
    SizeAllowlist,
};
pub use signature::{
    canonical_query, constant_time_compare, sign_params, Credential, SignatureVerifier,
    DEFAULT_TIMESTAMP_TOLERANCE_SECS,
};

use crate::response::ErrorCode;

/// Why a request was refused before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Missing public parameter: {0}")]
    MissingPublicParam(&'static str),

    #[error("Timestamp is malformed or outside the accepted window")]
    InvalidTimestamp,

    #[error("Unknown access key")]
    InvalidAccessKey,

    #[error("Signature mismatch")]
    InvalidSignature,

    #[error("Address quota exceeded")]
    AddressQuotaExceeded,

    #[error("Global quota exceeded")]
    GlobalQuotaExceeded,

    #[error("Address is blacklisted")]
    Blacklisted,

    #[error("Address is not whitelisted")]
    NotWhitelisted,

    #[error("Image size {0} is not allowed")]
    ImageSizeNotAllowed(String),
}

impl AdmissionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AdmissionError::MissingPublicParam(_) => ErrorCode::InvalidPublicParams,
            AdmissionError::InvalidTimestamp => ErrorCode::InvalidTimestamp,
            AdmissionError::InvalidAccessKey => ErrorCode::InvalidAccessKey,
            AdmissionError::InvalidSignature => ErrorCode::InvalidQueryString,
            AdmissionError::AddressQuotaExceeded => ErrorCode::AddressQuotaExceeded,
            AdmissionError::GlobalQuotaExceeded => ErrorCode::GlobalQuotaExceeded,
            AdmissionError::Blacklisted => ErrorCode::Blacklisted,
            AdmissionError::NotWhitelisted => ErrorCode::NotWhitelisted,
            AdmissionError::ImageSizeNotAllowed(_) => ErrorCode::ImageSizeNotAllowed,
        }
    }
}
