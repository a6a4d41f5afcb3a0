use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{
    Router,
    routing::{get, post, put},
};

use super::{activity, auth, companies, grains, slices, sync};
use crate::auth::{Hasher, TokenIssuer};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::remote::{Connector, HttpConnector};
use crate::store::Store;
use crate::sync::SyncEngine;
use crate::types::Settings;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub tokens: TokenIssuer,
    pub hasher: Hasher,
    /// This server's role and id, fixed at startup.
    pub settings: Settings,
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    /// Builds the state for a server whose database has been initialized.
    pub fn new(store: Arc<dyn Store>, config: &ServerConfig) -> Result<Self> {
        let connector = Arc::new(HttpConnector {
            debug: config.debug,
        });
        Self::with_connector(store, config, connector)
    }

    pub fn with_connector(
        store: Arc<dyn Store>,
        config: &ServerConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let settings = store.settings()?.ok_or_else(|| {
            Error::Config("server not initialized, run 'sandpiper admin init' first".to_string())
        })?;
        let tokens = TokenIssuer::new(&config.jwt_secret)?;
        let engine = SyncEngine::new(
            store.clone(),
            connector,
            config.sync_key()?,
            settings.server_role,
        );
        Ok(Self {
            store,
            tokens,
            hasher: Hasher::new(),
            settings,
            engine: Arc::new(engine),
        })
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

fn v1_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/login", post(auth::login))
        .route("/refresh/{token}", get(auth::refresh))
        .route("/me", get(auth::me))
        .route("/role", get(auth::role))
        .route("/activity", get(activity::list_activity))
        .route("/sync/subs", get(sync::list_subscriptions))
        .route("/sync/slice/{id}", get(sync::slice_grains))
        .route("/sync/{primary_id}", post(sync::start_sync))
        .route("/companies", get(companies::list_companies))
        .route(
            "/companies/{id}",
            get(companies::get_company)
                .put(companies::update_company)
                .delete(companies::delete_company),
        )
        .route("/tags", post(slices::create_tag))
        .route("/slices", get(slices::list_slices).post(slices::create_slice))
        .route("/slices/name/{name}", get(slices::get_slice_by_name))
        .route("/slices/refresh/{id}", post(slices::refresh_slice))
        .route("/slices/lock/{id}", put(slices::lock_slice))
        .route("/slices/unlock/{id}", put(slices::unlock_slice))
        .route("/slices/{id}/tags/{tag}", put(slices::tag_slice))
        .route(
            "/slices/{id}",
            get(slices::get_slice)
                .put(slices::update_slice)
                .delete(slices::delete_slice),
        )
        .route("/grains", get(grains::list_grains).post(grains::create_grain))
        .route("/grains/slice/{id}", get(grains::slice_grains))
        .route("/grains/payload/{id}", get(grains::get_grain_payload))
        .route(
            "/grains/{id}",
            get(grains::get_grain).delete(grains::delete_grain),
        )
        .route(
            "/grains/{id}/{grain_key}",
            get(grains::get_grain_by_key).post(grains::upload_grain),
        )
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/v1", v1_router())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
