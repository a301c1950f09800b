//! Token verification and request extractors. The user/credential store
//! itself is an external collaborator; the core only verifies tokens.

use crate::error::{LumiereError, Result};
use crate::server::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::response::Response;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const ACCESS_TOKEN: &str = "access";
pub const REFRESH_TOKEN: &str = "refresh";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(rename = "type", default)]
    pub token_type: String,
    pub exp: i64,
}

/// Verify an HS256 token of the expected kind and return its claims.
pub fn verify_token(secret: &str, token: &str, kind: &str) -> Result<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| LumiereError::Forbidden(format!("Invalid token: {}", e)))?;

    if data.claims.token_type != kind {
        return Err(LumiereError::Forbidden(format!(
            "Expected {} token",
            kind
        )));
    }

    Ok(data.claims)
}

pub fn issue_access_token(
    secret: &str,
    subject: &str,
    is_admin: bool,
    expire_minutes: i64,
) -> Result<String> {
    let claims = Claims {
        sub: subject.to_string(),
        is_admin,
        token_type: ACCESS_TOKEN.to_string(),
        exp: (Utc::now() + Duration::minutes(expire_minutes)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| LumiereError::Internal(format!("Failed to sign token: {}", e)))
}

fn bearer_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(axum::http::header::AUTHORIZATION) {
        let value = value.to_str().ok()?;
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    // Browser media elements cannot set headers; accept ?api_key=.
    let query = parts.uri.query()?;
    for pair in query.split('&') {
        if let Some(token) = pair.strip_prefix("api_key=") {
            return Some(token.to_string());
        }
    }
    None
}

/// Authenticated user; rejects with 401.
pub struct CurrentUser(pub Claims);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts) else {
            return Err(super::unauthorized("Not authenticated"));
        };
        match verify_token(&state.config.auth.secret_key, &token, ACCESS_TOKEN) {
            Ok(claims) => Ok(CurrentUser(claims)),
            Err(_) => Err(super::unauthorized("Could not validate credentials")),
        }
    }
}

/// Admin-only endpoints; 401 without a token, 403 for non-admins.
pub struct RequireAdmin(pub Claims);

#[async_trait]
impl FromRequestParts<AppState> for RequireAdmin {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, Self::Rejection> {
        let CurrentUser(claims) = CurrentUser::from_request_parts(parts, state).await?;
        if !claims.is_admin {
            return Err(axum::response::IntoResponse::into_response(
                LumiereError::Forbidden("Admin privileges required".into()),
            ));
        }
        Ok(RequireAdmin(claims))
    }
}

/// Streaming endpoints accept anonymous requests; a bad token is treated
/// as anonymous rather than rejected.
pub struct OptionalUser(pub Option<Claims>);

#[async_trait]
impl FromRequestParts<AppState> for OptionalUser {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, Self::Rejection> {
        let claims = bearer_token(parts)
            .and_then(|token| verify_token(&state.config.auth.secret_key, &token, ACCESS_TOKEN).ok());
        Ok(OptionalUser(claims))
    }
}
