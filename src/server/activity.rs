use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
};

use crate::auth::{RequireAuth, enforce_role};
use crate::server::AppState;
use crate::server::dto::{ActivityList, PageParams};
use crate::server::response::ApiResult;
use crate::types::Role;

/// The activity log, newest first.
pub async fn list_activity(
    RequireAuth(caller): RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<ActivityList>> {
    enforce_role(&caller, Role::Admin)?;
    let page = params.pagination()?;
    let activity = state.store.list_activity(page)?;
    Ok(Json(ActivityList { activity, page }))
}
