use std::sync::Arc;

use axum::{
    Json,
    extract::FromRequestParts,
    http::{HeaderValue, StatusCode, header::AUTHORIZATION, header::WWW_AUTHENTICATE, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;

use super::{CurrentUser, helpers::extract_bearer};
use crate::error::Error;
use crate::server::AppState;

/// Extractor that requires a valid access token.
pub struct RequireAuth(pub CurrentUser);

#[derive(Debug)]
pub enum AuthError {
    MissingAuth,
    InvalidScheme,
    InvalidToken,
    Rejected(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let detail = match self {
            AuthError::MissingAuth => "authentication required".to_string(),
            AuthError::InvalidScheme => "invalid authorization scheme".to_string(),
            AuthError::InvalidToken => "invalid token".to_string(),
            AuthError::Rejected(reason) => reason,
        };

        let body = json!({ "error": format!("not authorized: {detail}") });
        let mut response = (StatusCode::UNAUTHORIZED, Json(body)).into_response();
        response.headers_mut().insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Bearer realm=\"sandpiper\""),
        );
        response
    }
}

impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok());

        let token = extract_bearer(auth_header)?.ok_or(AuthError::MissingAuth)?;

        let user = state
            .tokens
            .verify_access(token)
            .and_then(|claims| claims.current_user())
            .map_err(|e| match e {
                Error::NotAuthorized(reason) => AuthError::Rejected(reason),
                other => AuthError::Rejected(other.to_string()),
            })?;

        Ok(RequireAuth(user))
    }
}
