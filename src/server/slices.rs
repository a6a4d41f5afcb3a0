use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::auth::{CurrentUser, RequireAuth, enforce_role, enforce_scope};
use crate::error::{Error, Result};
use crate::server::AppState;
use crate::server::dto::{
    CreateSliceRequest, CreateTagRequest, ListSlicesParams, SliceList, UpdateSliceRequest, parse_uuid,
};
use crate::server::response::{ApiError, ApiResult};
use crate::store::{Pagination, Store};
use crate::types::{Role, Slice};

/// Admins see every slice; company admins only those their company actively
/// subscribes to.
pub(super) fn check_slice_access(store: &dyn Store, caller: &CurrentUser, slice_id: Uuid) -> Result<()> {
    if caller.role.satisfies(Role::Admin) {
        return Ok(());
    }
    enforce_role(caller, Role::CompanyAdmin)?;
    store.slice_access(caller.company_id, slice_id)
}

pub async fn list_slices(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListSlicesParams>,
) -> ApiResult<Json<SliceList>> {
    let scope = enforce_scope(&caller, "company_id")?;
    let page = Pagination::new(params.limit, params.offset)?;
    let slices = state
        .store
        .list_slices(scope.as_ref(), page, params.tag.as_deref())?;
    Ok(Json(SliceList {
        slices,
        page: Some(page),
    }))
}

pub async fn get_slice(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Slice>> {
    let id = parse_uuid(&id)?;
    check_slice_access(state.store.as_ref(), &caller, id)?;
    Ok(Json(state.store.slice(id)?))
}

pub async fn get_slice_by_name(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Slice>> {
    let slice = state.store.slice_by_name(&name)?;
    check_slice_access(state.store.as_ref(), &caller, slice.id)?;
    Ok(Json(slice))
}

pub async fn create_slice(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSliceRequest>,
) -> ApiResult<(StatusCode, Json<Slice>)> {
    enforce_role(&caller, Role::Admin)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(Error::BadRequest("slice name cannot be empty".to_string()).into());
    }

    let mut slice = Slice::new(name, req.slice_type);
    slice.allow_sync = req.allow_sync.unwrap_or(true);
    slice.metadata = req.metadata;
    state.store.create_slice(&slice)?;

    info!(slice = %slice.name, id = %slice.id, "slice created");
    Ok((StatusCode::CREATED, Json(state.store.slice(slice.id)?)))
}

pub async fn update_slice(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateSliceRequest>,
) -> ApiResult<Json<Slice>> {
    enforce_role(&caller, Role::Admin)?;
    let id = parse_uuid(&id)?;
    let mut slice = state.store.slice(id)?;

    if let Some(name) = req.name {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::BadRequest("slice name cannot be empty".to_string()).into());
        }
        slice.name = name.to_string();
    }
    if let Some(slice_type) = req.slice_type {
        slice.slice_type = slice_type;
    }
    if let Some(allow_sync) = req.allow_sync {
        slice.allow_sync = allow_sync;
    }
    if let Some(metadata) = req.metadata {
        slice.metadata = metadata;
    }
    slice.updated_at = Utc::now();
    state.store.update_slice(&slice)?;

    Ok(Json(state.store.slice(id)?))
}

pub async fn delete_slice(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    enforce_role(&caller, Role::Admin)?;
    let id = parse_uuid(&id)?;
    state.store.delete_slice(id)?;
    info!(%id, "slice deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Recomputes hash, count, and content date after a batch of grain writes.
pub async fn refresh_slice(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Slice>> {
    enforce_role(&caller, Role::Admin)?;
    let id = parse_uuid(&id)?;
    let store = state.store.clone();
    // Hashing reads and decodes every payload in the slice.
    let slice = tokio::task::spawn_blocking(move || store.refresh_slice(id))
        .await
        .map_err(|e| ApiError::internal(format!("refresh task failed: {e}")))??;
    info!(slice = %slice.name, hash = slice.content_hash.as_deref().unwrap_or_default(), count = slice.content_count, "slice refreshed");
    Ok(Json(slice))
}

pub async fn lock_slice(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Slice>> {
    enforce_role(&caller, Role::Admin)?;
    let id = parse_uuid(&id)?;
    state.store.lock_slice(id)?;
    info!(%id, "slice locked");
    Ok(Json(state.store.slice(id)?))
}

pub async fn unlock_slice(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Slice>> {
    enforce_role(&caller, Role::Admin)?;
    let id = parse_uuid(&id)?;
    state.store.unlock_slice(id)?;
    info!(%id, "slice unlocked");
    Ok(Json(state.store.slice(id)?))
}

pub async fn create_tag(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTagRequest>,
) -> ApiResult<StatusCode> {
    enforce_role(&caller, Role::Admin)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(Error::BadRequest("tag name cannot be empty".to_string()).into());
    }
    state.store.create_tag(name, &req.description)?;
    Ok(StatusCode::CREATED)
}

/// Tags a slice, creating the tag on first use.
pub async fn tag_slice(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((id, tag)): Path<(String, String)>,
) -> ApiResult<Json<Slice>> {
    enforce_role(&caller, Role::Admin)?;
    let id = parse_uuid(&id)?;
    let slice = state.store.slice(id)?;
    state.store.tag_slice(slice.id, tag.trim())?;
    Ok(Json(slice))
}
