use std::io;
use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::info;
use uuid::Uuid;

use super::slices::check_slice_access;
use crate::auth::{CurrentUser, RequireAuth, enforce_role, enforce_scope};
use crate::codec::{self, Encoding};
use crate::error::{Error, Result};
use crate::server::AppState;
use crate::server::dto::{
    CreateGrainRequest, GrainList, ListGrainsParams, PageParams, PayloadParams, ReplaceParams,
    UploadParams, flag, parse_uuid,
};
use crate::server::response::{ApiError, ApiResult};
use crate::store::{Pagination, Store};
use crate::types::{Grain, Role};

/// Header naming the encoding of a bare payload body.
pub const ENCODING_HEADER: &str = "x-grain-encoding";

/// Scheme used for uploads that do not name one.
const DEFAULT_UPLOAD_ENCODING: Encoding = Encoding::Z64;

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::BadRequest("grain key cannot be empty".to_string()));
    }
    Ok(())
}

/// Checks the payload decodes under its scheme, then stores it.
fn store_grain(store: &dyn Store, replace: bool, grain: &Grain) -> Result<()> {
    store.slice(grain.slice_id)?;
    if let Some(payload) = &grain.payload {
        codec::decode_to(payload, grain.encoding, &mut io::sink())?;
    }
    store.create_grain(replace, grain)
}

/// Callers below admin must be subscribed to the grain's slice.
fn check_grain_access(store: &dyn Store, caller: &CurrentUser, id: Uuid) -> Result<()> {
    if caller.role.satisfies(Role::Admin) {
        return Ok(());
    }
    enforce_role(caller, Role::CompanyAdmin)?;
    if !store.company_subscribed(caller.company_id, id)? {
        return Err(Error::forbidden("no active subscription to this grain's slice"));
    }
    Ok(())
}

async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("grain task failed: {e}")))?;
    Ok(result?)
}

pub async fn list_grains(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListGrainsParams>,
) -> ApiResult<Json<GrainList>> {
    let scope = enforce_scope(&caller, "company_id")?;
    let page = Pagination::new(params.limit, params.offset)?;
    let include_payload = flag(params.payload.as_deref(), false)?;
    let slice_id = params.slice_id.as_deref().map(parse_uuid).transpose()?;

    if let Some(key) = params.grain_key.as_deref() {
        // A key names a grain only within a slice.
        let Some(slice_id) = slice_id else {
            return Err(Error::MissingQueryParams("grain_key requires slice_id".to_string()).into());
        };
        check_slice_access(state.store.as_ref(), &caller, slice_id)?;
        let grain = state.store.grain_by_key(slice_id, key, include_payload)?;
        return Ok(Json(GrainList {
            grains: vec![grain],
            page: Some(page),
        }));
    }

    let grains = state
        .store
        .list_grains(slice_id, include_payload, scope.as_ref(), page)?;
    Ok(Json(GrainList {
        grains,
        page: Some(page),
    }))
}

pub async fn slice_grains(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<PayloadParams>,
    Query(paging): Query<PageParams>,
) -> ApiResult<Json<GrainList>> {
    let id = parse_uuid(&id)?;
    check_slice_access(state.store.as_ref(), &caller, id)?;
    let include_payload = flag(params.payload.as_deref(), false)?;
    let page = paging.pagination()?;

    let grains = state
        .store
        .list_grains(Some(id), include_payload, None, page)?;
    Ok(Json(GrainList {
        grains,
        page: Some(page),
    }))
}

/// A single grain with its payload.
pub async fn get_grain(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Grain>> {
    let id = parse_uuid(&id)?;
    check_grain_access(state.store.as_ref(), &caller, id)?;
    Ok(Json(state.store.grain(id, true)?))
}

/// The encoded payload alone as a text body with an exact length, so a
/// secondary can copy it into its store as it arrives.
pub async fn get_grain_payload(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<([(&'static str, String); 1], String)> {
    let id = parse_uuid(&id)?;
    check_grain_access(state.store.as_ref(), &caller, id)?;
    let grain = state.store.grain(id, true)?;
    let payload = grain.payload.unwrap_or_default();
    Ok(([(ENCODING_HEADER, grain.encoding.to_string())], payload))
}

pub async fn get_grain_by_key(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((slice_id, grain_key)): Path<(String, String)>,
    Query(params): Query<PayloadParams>,
) -> ApiResult<Json<Grain>> {
    let slice_id = parse_uuid(&slice_id)?;
    check_slice_access(state.store.as_ref(), &caller, slice_id)?;
    let include_payload = flag(params.payload.as_deref(), true)?;
    Ok(Json(
        state
            .store
            .grain_by_key(slice_id, &grain_key, include_payload)?,
    ))
}

pub async fn create_grain(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ReplaceParams>,
    Json(req): Json<CreateGrainRequest>,
) -> ApiResult<(StatusCode, Json<Grain>)> {
    enforce_role(&caller, Role::Admin)?;
    validate_key(&req.grain_key)?;
    let replace = flag(params.replace.as_deref(), false)?;

    let mut grain = Grain::new(req.slice_id, req.grain_key, req.encoding, req.payload);
    grain.source = req.source;

    let store = state.store.clone();
    let grain = blocking(move || {
        store_grain(store.as_ref(), replace, &grain)?;
        store.grain(grain.id, false)
    })
    .await?;

    info!(slice_id = %grain.slice_id, key = %grain.grain_key, "grain created");
    Ok((StatusCode::CREATED, Json(grain)))
}

/// Stores a raw request body, encoding it on the way in.
pub async fn upload_grain(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((slice_id, grain_key)): Path<(String, String)>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Grain>)> {
    enforce_role(&caller, Role::Admin)?;
    let slice_id = parse_uuid(&slice_id)?;
    validate_key(&grain_key)?;
    let encoding = match params.encoding.as_deref() {
        None | Some("") => DEFAULT_UPLOAD_ENCODING,
        Some(name) => name.parse()?,
    };
    let replace = flag(params.replace.as_deref(), false)?;
    let source = params.source.unwrap_or_default();

    let store = state.store.clone();
    let grain = blocking(move || {
        store.slice(slice_id)?;
        let payload = codec::encode(body.as_ref(), encoding)?;
        let mut grain = Grain::new(slice_id, grain_key, encoding, payload);
        grain.source = source;
        store.create_grain(replace, &grain)?;
        store.grain(grain.id, false)
    })
    .await?;

    info!(
        slice_id = %grain.slice_id,
        key = %grain.grain_key,
        encoding = %grain.encoding,
        "grain uploaded"
    );
    Ok((StatusCode::CREATED, Json(grain)))
}

pub async fn delete_grain(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    enforce_role(&caller, Role::Admin)?;
    let id = parse_uuid(&id)?;
    state.store.delete_grain(id)?;
    info!(%id, "grain deleted");
    Ok(StatusCode::NO_CONTENT)
}
