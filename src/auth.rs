//! Identity boundary: verified-user extraction from signed tokens.
//!
//! Token issuance lives in an external identity service; this layer only
//! verifies the HS256 signature of the `x-auth-token` header and yields the
//! embedded user id. A missing or invalid token is `Unauthorized`, distinct
//! from the session layer's `NotFound`.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

/// Header carrying the signed identity token
pub const AUTH_HEADER: &str = "x-auth-token";

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(rename = "userId")]
    user_id: String,
    #[allow(dead_code)]
    exp: u64,
}

/// Authentication failures, all mapped to 401
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("No token, authorization denied")]
    MissingToken,

    #[error("Token is not valid")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Verify a token signature and return the user id it carries
pub fn verify_token(token: &str, secret: &str) -> Result<String, AuthError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AuthError::InvalidToken)?;
    Ok(data.claims.user_id)
}

/// The verified user behind a request
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingToken)?;

        let user_id = verify_token(token, &state.jwt_secret)?;
        Ok(AuthUser { user_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        #[serde(rename = "userId")]
        user_id: String,
        exp: u64,
    }

    fn make_token(user_id: &str, secret: &str) -> String {
        let claims = TestClaims {
            user_id: user_id.to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as u64,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_yields_user_id() {
        let token = make_token("user-42", "secret");
        assert_eq!(verify_token(&token, "secret").unwrap(), "user-42");
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = make_token("user-42", "secret");
        assert!(matches!(
            verify_token(&token, "other"),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        assert!(matches!(
            verify_token("not-a-jwt", "secret"),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let claims = TestClaims {
            user_id: "user-42".to_string(),
            exp: (chrono::Utc::now().timestamp() - 3600) as u64,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        assert!(matches!(
            verify_token(&token, "secret"),
            Err(AuthError::InvalidToken)
        ));
    }
}
