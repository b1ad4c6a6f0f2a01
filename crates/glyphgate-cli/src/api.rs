//! HTTP API for the recognition gateway
//!
//! - `POST /captcha/v1`: unauthenticated prediction
//! - `POST /captcha/auth/v2`: prediction with a signed body
//! - `GET /status`: loaded models and pool occupancy
//! - `GET /heartbeat`: liveness probe, empty body
//!
//! Prediction outcomes, including recognition errors, are returned with
//! HTTP 200 and the stable error code in the body. Admission failures use
//! 401/403/429.
//!
//! The body is parsed, and on v2 its signature verified, before the rate
//! limiter counts the attempt. A counted attempt is refunded when the
//! dispatcher turns it away before selecting a model.

use crate::auth::{self, AuthRejection};
use crate::rate_limit::{self, admission_reply};
use glyphgate_runtime::{
    Dispatcher, ErrorCode, PredictRequest, PredictResponse, QuotaTicket, RateLimiter,
    ResponseFields, SignatureVerifier,
};
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

// =============================================================================
// State
// =============================================================================

/// Everything the routes share.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub limiter: Arc<RateLimiter>,
    pub verifier: Arc<SignatureVerifier>,
    pub fields: Arc<ResponseFields>,
    pub trust_forwarded_for: bool,
    pub max_body_bytes: u64,
    pub started: Instant,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        limiter: Arc<RateLimiter>,
        verifier: Arc<SignatureVerifier>,
        fields: ResponseFields,
    ) -> Self {
        Self {
            dispatcher,
            limiter,
            verifier,
            fields: Arc::new(fields),
            trust_forwarded_for: false,
            max_body_bytes: 8 * 1024 * 1024,
            started: Instant::now(),
        }
    }
}

pub type SharedState = Arc<AppState>;

// =============================================================================
// API Routes
// =============================================================================

/// Build the complete route tree, with rejection recovery.
pub fn api_routes(
    state: SharedState,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let admission = rate_limit::with_admission(state.limiter.clone(), state.trust_forwarded_for);

    let predict_v1 = warp::path!("captcha" / "v1")
        .and(warp::post())
        .and(warp::body::content_length_limit(state.max_body_bytes))
        .and(warp::body::json::<Map<String, Value>>())
        .and(admission.clone())
        .and(with_state(state.clone()))
        .and_then(handle_predict);

    let predict_v2 = warp::path!("captcha" / "auth" / "v2")
        .and(warp::post())
        .and(auth::with_signature(
            state.verifier.clone(),
            state.max_body_bytes,
        ))
        .and(admission)
        .and(with_state(state.clone()))
        .and_then(handle_predict);

    let status = warp::path!("status")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_status);

    let heartbeat = warp::path!("heartbeat")
        .and(warp::get())
        .map(warp::reply);

    let fields = state.fields.clone();
    predict_v1
        .or(predict_v2)
        .or(status)
        .or(heartbeat)
        .recover(move |err: Rejection| handle_rejection(err, fields.clone()))
}

// =============================================================================
// Filters
// =============================================================================

fn with_state(state: SharedState) -> impl Filter<Extract = (SharedState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

// =============================================================================
// Handlers
// =============================================================================

async fn handle_predict(
    body: Map<String, Value>,
    ticket: QuotaTicket,
    state: SharedState,
) -> Result<warp::reply::Response, Infallible> {
    let request: PredictRequest = match serde_json::from_value(Value::Object(body)) {
        Ok(r) => r,
        Err(e) => {
            debug!("Invalid prediction body: {}", e);
            state.limiter.release(ticket);
            let response = PredictResponse::error(ErrorCode::MissingParameter, String::new());
            return Ok(warp::reply::with_status(
                warp::reply::json(&response.to_json(&state.fields)),
                StatusCode::BAD_REQUEST,
            )
            .into_response());
        }
    };

    let response = state.dispatcher.dispatch(request).await;
    if response.charged {
        drop(ticket);
    } else {
        state.limiter.release(ticket);
    }

    Ok(warp::reply::json(&response.to_json(&state.fields)).into_response())
}

async fn handle_status(state: SharedState) -> Result<impl Reply, Infallible> {
    let registry = state.dispatcher.registry().status();
    let pool = state.dispatcher.pool();
    Ok(warp::reply::json(&json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started.elapsed().as_secs_f64(),
        "workers": pool.workers(),
        "workers_available": pool.available(),
        "registry": registry,
    })))
}

// =============================================================================
// Rejections
// =============================================================================

/// Handle admission, body and routing rejections
pub async fn handle_rejection(
    err: Rejection,
    fields: Arc<ResponseFields>,
) -> Result<warp::reply::Response, Infallible> {
    if let Some(reply) = rate_limit::handle_rate_limit_rejection(&err, &fields) {
        return Ok(reply.into_response());
    }
    if let Some(AuthRejection(e)) = err.find::<AuthRejection>() {
        return Ok(admission_reply(e, &fields).into_response());
    }

    let (code, message): (StatusCode, String) =
        if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
            (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e))
        } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request payload too large".into(),
            )
        } else if err.find::<warp::reject::LengthRequired>().is_some() {
            (StatusCode::LENGTH_REQUIRED, "Content length required".into())
        } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
            (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Unsupported media type".into(),
            )
        } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
            (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".into())
        } else if err.is_not_found() {
            (StatusCode::NOT_FOUND, "Not found".into())
        } else {
            tracing::error!("Unhandled rejection: {:?}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".into(),
            )
        };

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({
            "error": message
        })),
        code,
    )
    .into_response())
}
