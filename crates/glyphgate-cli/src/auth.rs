//! Signature authentication for the `/captcha/auth/v2` endpoint

use glyphgate_runtime::{AdmissionError, Credential, SignatureVerifier};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use warp::Filter;

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Warp rejection carrying the admission failure
#[derive(Debug)]
pub struct AuthRejection(pub AdmissionError);

impl warp::reject::Reject for AuthRejection {}

/// Parse the JSON object body and verify its signature.
///
/// The verified parameters are passed on unchanged so the handler can build
/// the prediction request from them.
pub fn with_signature(
    verifier: Arc<SignatureVerifier>,
    max_body_bytes: u64,
) -> impl Filter<Extract = (Map<String, Value>,), Error = warp::Rejection> + Clone {
    warp::body::content_length_limit(max_body_bytes)
        .and(warp::body::json::<Map<String, Value>>())
        .and_then(move |params: Map<String, Value>| {
            let verifier = verifier.clone();
            async move {
                match verifier.verify(&params) {
                    Ok(()) => Ok(params),
                    Err(e) => {
                        debug!("Signature rejected: {}", e);
                        Err(warp::reject::custom(AuthRejection(e)))
                    }
                }
            }
        })
}

/// A stable host identifier: the machine id when present, else the host name.
pub fn hardware_id() -> String {
    MACHINE_ID_PATHS
        .iter()
        .find_map(|p| {
            std::fs::read_to_string(p)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "glyphgate".to_string())
}

/// Credentials to use when none are configured.
pub fn default_credentials(model_name: &str) -> Vec<Credential> {
    vec![Credential::derive_default(model_name, &hardware_id())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use glyphgate_runtime::admission::sign_params;
    use serde_json::json;

    fn signed_body(secret: &str) -> Map<String, Value> {
        let mut params = json!({
            "image": "abc",
            "accessKey": "client",
            "timestamp": chrono::Utc::now().timestamp().to_string(),
        })
        .as_object()
        .cloned()
        .unwrap();
        let sign = sign_params(&params, secret);
        params.insert("sign".to_string(), Value::String(sign));
        params
    }

    fn verifier() -> Arc<SignatureVerifier> {
        Arc::new(SignatureVerifier::new(vec![Credential::new("client", "secret")]))
    }

    #[tokio::test]
    async fn test_valid_signature_passes_body_through() {
        let body = signed_body("secret");
        let params = warp::test::request()
            .method("POST")
            .json(&body)
            .filter(&with_signature(verifier(), 1024))
            .await
            .unwrap();
        assert_eq!(params, body);
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let rejection = warp::test::request()
            .method("POST")
            .json(&signed_body("other"))
            .filter(&with_signature(verifier(), 1024))
            .await
            .unwrap_err();
        let auth = rejection.find::<AuthRejection>().unwrap();
        assert_eq!(auth.0, AdmissionError::InvalidSignature);
    }

    #[tokio::test]
    async fn test_missing_sign_rejected() {
        let rejection = warp::test::request()
            .method("POST")
            .json(&json!({"image": "abc"}))
            .filter(&with_signature(verifier(), 1024))
            .await
            .unwrap_err();
        let auth = rejection.find::<AuthRejection>().unwrap();
        assert_eq!(auth.0, AdmissionError::MissingPublicParam("sign"));
    }

    #[test]
    fn test_default_credentials_are_stable() {
        assert_eq!(default_credentials("digits"), default_credentials("digits"));
        assert_ne!(default_credentials("digits"), default_credentials("letters"));
    }
}
