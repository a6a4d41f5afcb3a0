//! Login, token refresh, and caller identity.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use tracing::{info, warn};

use crate::auth::{RequireAuth, TokenPair};
use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::LoginRequest;
use crate::server::response::ApiResult;
use crate::types::{Settings, User};

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<TokenPair>> {
    let Some(user) = state.store.user_by_username(&req.username)? else {
        warn!(username = %req.username, "login for unknown user");
        return Err(Error::InvalidCredentials.into());
    };
    if !state.hasher.verify(&req.password, &user.password_hash)? {
        warn!(username = %req.username, "login with bad password");
        return Err(Error::InvalidCredentials.into());
    }
    if !user.active {
        return Err(Error::NotAuthorized("user is inactive".to_string()).into());
    }

    let pair = state.tokens.issue(&user)?;
    info!(username = %user.username, "user logged in");
    Ok(Json(pair))
}

/// Trades a refresh token for a new pair. The user is reloaded so that
/// deactivation takes effect at the next refresh.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> ApiResult<Json<TokenPair>> {
    let claims = state.tokens.verify_refresh(&token)?;
    let user = state.store.user(claims.id).map_err(|e| match e {
        Error::NotFound => Error::NotAuthorized("user no longer exists".to_string()),
        e => e,
    })?;
    if !user.active {
        return Err(Error::NotAuthorized("user is inactive".to_string()).into());
    }
    Ok(Json(state.tokens.issue(&user)?))
}

pub async fn me(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<User>> {
    Ok(Json(state.store.user(caller.id)?))
}

pub async fn role(
    RequireAuth(_caller): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> Json<Settings> {
    Json(state.settings)
}
