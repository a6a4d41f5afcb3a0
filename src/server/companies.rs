use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::info;

use crate::auth::{RequireAuth, enforce_company, enforce_role, enforce_scope};
use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::{CompanyList, PageParams, UpdateCompanyRequest, parse_uuid};
use crate::server::response::ApiResult;
use crate::types::{Company, Role};

pub async fn list_companies(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<CompanyList>> {
    let scope = enforce_scope(&caller, "id")?;
    let page = params.pagination()?;
    let companies = state.store.list_companies(scope.as_ref(), page)?;
    Ok(Json(CompanyList { companies, page }))
}

pub async fn get_company(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Company>> {
    let id = parse_uuid(&id)?;
    enforce_company(&caller, id)?;
    Ok(Json(state.store.company(id)?))
}

/// Company admins may rename their own company. Sync settings and the active
/// flag are admin-only.
pub async fn update_company(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateCompanyRequest>,
) -> ApiResult<Json<Company>> {
    let id = parse_uuid(&id)?;
    enforce_company(&caller, id)?;
    if req.sync_addr.is_some() || req.active.is_some() {
        enforce_role(&caller, Role::Admin)?;
    }

    let mut company = state.store.company(id)?;
    if let Some(name) = req.name {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::BadRequest("company name cannot be empty".to_string()).into());
        }
        company.name = name.to_string();
    }
    if let Some(addr) = req.sync_addr {
        company.sync_addr = addr.trim().trim_end_matches('/').to_string();
    }
    if let Some(active) = req.active {
        company.active = active;
    }
    state.store.update_company(&company)?;

    info!(company = %company.name, %id, "company updated");
    Ok(Json(state.store.company(id)?))
}

pub async fn delete_company(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    enforce_role(&caller, Role::Admin)?;
    let id = parse_uuid(&id)?;
    if id == caller.company_id {
        return Err(Error::forbidden("cannot delete your own company").into());
    }
    state.store.delete_company(id)?;
    info!(%id, "company deleted");
    Ok(StatusCode::NO_CONTENT)
}
