//! Both halves of the sync protocol: the secondary's session trigger and the
//! primary's read-only feeds.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
};

use crate::auth::{RequireAuth, enforce_role, enforce_server_role};
use crate::server::AppState;
use crate::server::dto::{BriefParams, GrainList, SubscriptionList, flag, parse_uuid};
use crate::server::response::{ApiError, ApiResult};
use crate::sync::SyncReport;
use crate::types::{Role, ServerRole};

/// Runs a session against a primary. The engine drives a blocking HTTP
/// client, so it runs off the async workers.
pub async fn start_sync(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(primary_id): Path<String>,
) -> ApiResult<Json<SyncReport>> {
    let primary_id = parse_uuid(&primary_id)?;
    let engine = state.engine.clone();
    let report = tokio::task::spawn_blocking(move || engine.start(&caller, primary_id))
        .await
        .map_err(|e| ApiError::internal(format!("sync task failed: {e}")))??;
    Ok(Json(report))
}

pub async fn list_subscriptions(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<SubscriptionList>> {
    enforce_server_role(state.settings.server_role, ServerRole::Primary)?;
    enforce_role(&caller, Role::CompanyAdmin)?;
    let subscriptions = state.store.subscriptions(caller.company_id)?;
    Ok(Json(SubscriptionList {
        subscriptions,
        page: None,
    }))
}

/// Every grain of a subscribed slice; `brief=yes` leaves payloads out.
pub async fn slice_grains(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<BriefParams>,
) -> ApiResult<Json<GrainList>> {
    enforce_server_role(state.settings.server_role, ServerRole::Primary)?;
    enforce_role(&caller, Role::CompanyAdmin)?;
    let slice_id = parse_uuid(&id)?;
    let brief = flag(params.brief.as_deref(), false)?;
    state.store.slice_access(caller.company_id, slice_id)?;

    let store = state.store.clone();
    let grains = tokio::task::spawn_blocking(move || store.grains(slice_id, brief))
        .await
        .map_err(|e| ApiError::internal(format!("grain listing failed: {e}")))??;
    Ok(Json(GrainList { grains, page: None }))
}
