//! Bearer-token authentication for operators and dashboard sockets.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::state::AppState;

/// Claims carried by operator/dashboard tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Operator identity.
    pub sub: String,
    /// Organization the session belongs to; scopes the default WS room.
    pub org_id: String,
    pub exp: usize,
}

/// Validate an HS256 bearer token.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

/// Extract a bearer token from `Authorization: Bearer <token>`.
pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Middleware requiring a valid operator token; claims land in request
/// extensions for handlers that care about identity.
pub async fn require_operator(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer(request.headers()) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Authorization required" })),
        )
            .into_response();
    };

    match verify_token(&state.config().jwt_secret, &token) {
        Ok(claims) => {
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(err) => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": format!("invalid token: {}", err) })),
        )
            .into_response(),
    }
}
