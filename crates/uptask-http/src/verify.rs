//! Upstash signature verification
//!
//! The broker signs every webhook call with an HS256 JWT in the
//! `Upstash-Signature` header. The token's `body` claim is the
//! base64url-encoded SHA-256 of the raw request body, tying the signature
//! to the exact payload. Any mismatch short-circuits at 401 before the
//! dispatch pipeline runs.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE as BASE64_URL;
use base64::Engine as _;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;

const SIGNATURE_HEADER: &str = "Upstash-Signature";

/// Shared-secret configuration for signature verification.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub signing_key: String,
    pub issuer: String,
}

impl VerifyConfig {
    pub fn new(signing_key: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            signing_key: signing_key.into(),
            issuer: issuer.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpstashClaims {
    body: String,
    #[allow(dead_code)]
    iss: String,
    #[allow(dead_code)]
    exp: i64,
    #[serde(default)]
    #[allow(dead_code)]
    nbf: i64,
}

/// Axum middleware verifying the broker signature on every request. Use
/// with [`axum::middleware::from_fn_with_state`]:
///
/// ```ignore
/// let router = task_routes(service)
///     .layer(middleware::from_fn_with_state(config, verify_signature));
/// ```
pub async fn verify_signature(
    State(config): State<VerifyConfig>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response()
        }
    };

    let token = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if let Err(err) = check_signature(&bytes, token, &config) {
        warn!(error = %err, "signature verification failed");
        return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
    }

    // Hand the body back for downstream extractors.
    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}

fn check_signature(body: &Bytes, token: &str, config: &VerifyConfig) -> anyhow::Result<()> {
    if token.is_empty() {
        anyhow::bail!("missing {SIGNATURE_HEADER} header");
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[&config.issuer]);
    validation.validate_nbf = true;

    let data = jsonwebtoken::decode::<UpstashClaims>(
        token,
        &DecodingKey::from_secret(config.signing_key.as_bytes()),
        &validation,
    )?;

    let expected = BASE64_URL.encode(Sha256::digest(body));
    if data.claims.body != expected {
        anyhow::bail!("body hash does not match");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const SIGNING_KEY: &str = "test-signing-key";
    const ISSUER: &str = "Upstash";

    #[derive(Serialize)]
    struct SignedClaims {
        iss: String,
        exp: i64,
        nbf: i64,
        body: String,
    }

    fn sign(body: &[u8], issuer: &str, exp_offset: i64, nbf_offset: i64, key: &str) -> String {
        let now = Utc::now().timestamp();
        let claims = SignedClaims {
            iss: issuer.to_string(),
            exp: now + exp_offset,
            nbf: now + nbf_offset,
            body: BASE64_URL.encode(Sha256::digest(body)),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(key.as_bytes()),
        )
        .unwrap()
    }

    fn config() -> VerifyConfig {
        VerifyConfig::new(SIGNING_KEY, ISSUER)
    }

    #[test]
    fn test_valid_signature_passes() {
        let body = Bytes::from_static(b"{\"hello\":\"world\"}");
        let token = sign(&body, ISSUER, 300, -300, SIGNING_KEY);
        check_signature(&body, &token, &config()).unwrap();
    }

    #[test]
    fn test_missing_header_fails() {
        let body = Bytes::from_static(b"{}");
        assert!(check_signature(&body, "", &config()).is_err());
    }

    #[test]
    fn test_wrong_issuer_fails() {
        let body = Bytes::from_static(b"{}");
        let token = sign(&body, "someone-else", 300, -300, SIGNING_KEY);
        assert!(check_signature(&body, &token, &config()).is_err());
    }

    #[test]
    fn test_expired_token_fails() {
        let body = Bytes::from_static(b"{}");
        let token = sign(&body, ISSUER, -300, -600, SIGNING_KEY);
        assert!(check_signature(&body, &token, &config()).is_err());
    }

    #[test]
    fn test_not_yet_valid_token_fails() {
        let body = Bytes::from_static(b"{}");
        let token = sign(&body, ISSUER, 600, 300, SIGNING_KEY);
        assert!(check_signature(&body, &token, &config()).is_err());
    }

    #[test]
    fn test_tampered_body_fails() {
        let body = Bytes::from_static(b"{\"hello\":\"world\"}");
        let token = sign(&body, ISSUER, 300, -300, SIGNING_KEY);
        let tampered = Bytes::from_static(b"{\"hello\":\"tampered\"}");
        assert!(check_signature(&tampered, &token, &config()).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let body = Bytes::from_static(b"{}");
        let token = sign(&body, ISSUER, 300, -300, "other-key");
        assert!(check_signature(&body, &token, &config()).is_err());
    }
}
