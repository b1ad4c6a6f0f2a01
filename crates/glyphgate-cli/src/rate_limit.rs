//! Rate limiting filter for the prediction endpoints
//!
//! Wraps the runtime [`RateLimiter`] in a warp filter that resolves the client
//! address and hands a [`QuotaTicket`] to the handler.

use glyphgate_runtime::{AdmissionError, PredictResponse, QuotaTicket, RateLimiter, ResponseFields};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use warp::http::StatusCode;
use warp::Filter;

// =============================================================================
// Client address
// =============================================================================

/// Resolve the client address.
///
/// With `trust_forwarded_for` the first valid entry of `X-Forwarded-For`
/// wins; otherwise the peer address is used, falling back to localhost.
pub fn client_address(
    remote: Option<SocketAddr>,
    forwarded_for: Option<&str>,
    trust_forwarded_for: bool,
) -> IpAddr {
    if trust_forwarded_for {
        if let Some(ip) = forwarded_for
            .and_then(|h| h.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok())
        {
            return ip;
        }
    }
    remote
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

// =============================================================================
// Warp Filter
// =============================================================================

/// Warp rejection type for rate limiting
#[derive(Debug)]
pub struct RateLimitRejection(pub AdmissionError);

impl warp::reject::Reject for RateLimitRejection {}

/// Create a warp filter that counts the request against the limiter
pub fn with_admission(
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
) -> impl warp::Filter<Extract = (QuotaTicket,), Error = warp::Rejection> + Clone {
    warp::addr::remote()
        .and(warp::header::optional::<String>("x-forwarded-for"))
        .and_then(move |addr: Option<SocketAddr>, forwarded: Option<String>| {
            let limiter = limiter.clone();
            async move {
                let ip = client_address(addr, forwarded.as_deref(), trust_forwarded_for);
                limiter
                    .acquire(ip)
                    .map_err(|e| warp::reject::custom(RateLimitRejection(e)))
            }
        })
}

/// HTTP status for an admission failure
pub fn admission_status(error: &AdmissionError) -> StatusCode {
    match error {
        AdmissionError::AddressQuotaExceeded | AdmissionError::GlobalQuotaExceeded => {
            StatusCode::TOO_MANY_REQUESTS
        }
        AdmissionError::Blacklisted | AdmissionError::NotWhitelisted => StatusCode::FORBIDDEN,
        AdmissionError::ImageSizeNotAllowed(_) => StatusCode::BAD_REQUEST,
        AdmissionError::MissingPublicParam(_)
        | AdmissionError::InvalidTimestamp
        | AdmissionError::InvalidAccessKey
        | AdmissionError::InvalidSignature => StatusCode::UNAUTHORIZED,
    }
}

/// Render an admission failure with the configured response fields
pub fn admission_reply(
    error: &AdmissionError,
    fields: &ResponseFields,
) -> warp::reply::WithStatus<warp::reply::Json> {
    let response = PredictResponse::error(error.code(), String::new());
    warp::reply::with_status(
        warp::reply::json(&response.to_json(fields)),
        admission_status(error),
    )
}

/// Handle rate limit rejection in recovery
pub fn handle_rate_limit_rejection(
    rejection: &warp::Rejection,
    fields: &ResponseFields,
) -> Option<warp::reply::WithStatus<warp::reply::Json>> {
    rejection
        .find::<RateLimitRejection>()
        .map(|r| admission_reply(&r.0, fields))
}

// =============================================================================
// Tests
// =============================================================================
