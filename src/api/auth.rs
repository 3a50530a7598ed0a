// =============================================================================
// Role authentication — §6.1
// =============================================================================
//
// Two roles reach the ingestion surface:
//   - MONITOR: an upstream signal relay presenting a static API key
//     (`ApiKeyAuth`), generalized from this codebase's original admin-token
//     extractor to compare against a caller-supplied `expected` value rather
//     than a single hardcoded env var, so MONITOR and any future key class
//     share one implementation.
//   - USER: an end user's own client presenting a JWT (`JwtAuth`), whose
//     `sub` claim is the authenticated `userId` that `/execute-trade`
//     dispatches against.
//
// Both extractors short-circuit with 403 before the handler body runs.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use jsonwebtoken::{DecodingKey, Validation};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. Returns `true` if they are
/// identical. The comparison always examines every byte of both slices even
/// when a mismatch is found early, preventing timing side-channels.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

// =============================================================================
// Role MONITOR — static API key
// =============================================================================

/// Axum extractor validating `Authorization: Bearer <key>` against
/// `MONITOR_API_KEY`. Yields nothing beyond proof of the role; the ingestion
/// handlers don't need the raw key.
pub struct ApiKeyAuth;

impl<S> FromRequestParts<S> for ApiKeyAuth
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var("MONITOR_API_KEY").unwrap_or_default();
        if expected.is_empty() {
            warn!("MONITOR_API_KEY is not set — all MONITOR requests will be rejected");
            return Err(AuthRejection { status: StatusCode::FORBIDDEN, message: "server authentication not configured" });
        }

        let token = bearer_token(parts).ok_or(AuthRejection {
            status: StatusCode::FORBIDDEN,
            message: "missing or invalid authorization token",
        })?;

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid MONITOR API key presented");
            return Err(AuthRejection { status: StatusCode::FORBIDDEN, message: "invalid authorization token" });
        }

        Ok(ApiKeyAuth)
    }
}

// =============================================================================
// Role USER — JWT bearer
// =============================================================================

#[derive(Debug, Deserialize, serde::Serialize)]
struct Claims {
    sub: Uuid,
}

/// Axum extractor decoding `Authorization: Bearer <jwt>` against
/// `JWT_HMAC_SECRET` and yielding the authenticated user's id from the `sub`
/// claim.
pub struct JwtAuth {
    pub user_id: Uuid,
}

impl<S> FromRequestParts<S> for JwtAuth
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let secret = std::env::var("JWT_HMAC_SECRET").unwrap_or_default();
        if secret.is_empty() {
            warn!("JWT_HMAC_SECRET is not set — all USER requests will be rejected");
            return Err(AuthRejection { status: StatusCode::FORBIDDEN, message: "server authentication not configured" });
        }

        let token = bearer_token(parts).ok_or(AuthRejection {
            status: StatusCode::FORBIDDEN,
            message: "missing or invalid authorization token",
        })?;

        let decoded = jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| {
            warn!(error = %e, "JWT validation failed");
            AuthRejection { status: StatusCode::FORBIDDEN, message: "invalid or expired token" }
        })?;

        Ok(JwtAuth { user_id: decoded.claims.sub })
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn jwt_round_trip_yields_same_user_id() {
        let secret = "test-secret";
        let user_id = Uuid::new_v4();
        let claims = Claims { sub: user_id };
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let decoded = jsonwebtoken::decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .unwrap();
        assert_eq!(decoded.claims.sub, user_id);
    }
}
