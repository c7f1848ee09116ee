/*
* HA VM Manager API Routes
* ------------------------
* @project: ha-vm-manager
*
* JSON front door for the inventory store, the delegated VM actions and the
* migration coordinator. Handlers stay thin: they pick the right core call,
* and ErrorResponse turns ClusterError into a status code.
*
* Endpoints (relative to server.api_prefix, /api/v1 by default):
* ------------------------------------------------------------
* GET    /health
* GET    /nodes                              - online cluster nodes
* GET    /vms                                - inventory snapshot
* POST   /vms                                - vm-mgr create
* POST   /vms/refresh                        - rebuild the inventory now
* GET    /vms/{name}
* DELETE /vms/{name}                         - vm-mgr remove
* POST   /vms/{name}/start|stop|enable|disable|restart   (?force=true)
* GET    /vms/{name}/snapshots
* POST   /vms/{name}/snapshots               - { "snapshot": "name" }
* POST   /vms/{name}/snapshots/{snap}/rollback
* GET    /vms/{name}/targets                 - where the VM could go
* POST   /vms/{name}/migrate                 - { "target": "node2" }, 202
* GET    /migrations
* GET    /migrations/{name}                  - running job, else the last finished one
* DELETE /migrations/{name}                  - abort polling
* GET|PUT|DELETE /selection
*/

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::error::{ApiResult, ErrorResponse};
use crate::config::MigrationSettings;
use crate::core::{
    ClusterSource, InventoryResolver, InventoryStore, MigrationCoordinator, VmAction, VmActions,
    VmCreateRequest,
};
use crate::errors::ClusterError;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<InventoryStore>,
    pub actions: Arc<VmActions>,
    pub migrations: Arc<MigrationCoordinator>,
}

impl AppState {
    pub fn new(source: Arc<dyn ClusterSource>, migration: MigrationSettings) -> Self {
        let store = Arc::new(InventoryStore::new(InventoryResolver::new(source)));
        Self {
            actions: Arc::new(VmActions::new(store.clone())),
            migrations: Arc::new(MigrationCoordinator::new(store.clone(), migration)),
            store,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    pub snapshot: String,
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub target: String,
}

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub name: String,
}

const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn create_router(app_state: Arc<AppState>, api_prefix: &str) -> Router {
    let vm_router = Router::new()
        .route("/vms", get(list_vms).post(create_vm))
        .route("/vms/refresh", post(refresh_vms))
        .route("/vms/{name}", get(get_vm).delete(remove_vm))
        .route("/vms/{name}/start", post(start_vm))
        .route("/vms/{name}/stop", post(stop_vm))
        .route("/vms/{name}/enable", post(enable_vm))
        .route("/vms/{name}/disable", post(disable_vm))
        .route("/vms/{name}/restart", post(restart_vm))
        .route("/vms/{name}/snapshots", get(list_snapshots).post(create_snapshot))
        .route("/vms/{name}/snapshots/{snapshot}/rollback", post(rollback_snapshot));

    let migration_router = Router::new()
        .route("/vms/{name}/targets", get(migration_targets))
        .route("/vms/{name}/migrate", post(migrate_vm))
        .route("/migrations", get(list_migrations))
        .route("/migrations/{name}", get(get_migration).delete(abort_migration));

    let api = Router::new()
        .route("/health", get(health))
        .route("/nodes", get(list_nodes))
        .route("/selection", get(get_selection).put(select_vm).delete(clear_selection))
        .merge(vm_router)
        .merge(migration_router);

    let api = if api_prefix.is_empty() || api_prefix == "/" {
        api
    } else {
        Router::new().nest(api_prefix, api)
    };

    api.with_state(app_state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "inventory_generation": state.store.generation(),
        "active_migrations": state.migrations.active_jobs().len(),
    }))
}

async fn list_nodes(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let nodes = state.store.resolver().online_nodes().await?;
    Ok(Json(nodes))
}

#[axum::debug_handler]
async fn list_vms(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    // first request after startup builds the inventory
    let vms = if state.store.generation() == 0 {
        state.store.refresh().await?
    } else {
        state.store.snapshot().await
    };
    Ok(Json(vms))
}

async fn refresh_vms(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.refresh().await?))
}

async fn get_vm(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.find_or_refresh(&name).await?))
}

#[axum::debug_handler]
async fn create_vm(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VmCreateRequest>,
) -> ApiResult<impl IntoResponse> {
    info!(vm = %request.name, "create requested");
    let vm = state.actions.create(&request).await?;
    Ok((StatusCode::CREATED, Json(vm)))
}

async fn run_action(state: &AppState, name: &str, action: VmAction) -> ApiResult<impl IntoResponse> {
    let vm = state.actions.execute(name, &action).await?;
    Ok(Json(json!({ "action": action.to_string(), "vm": vm })))
}

async fn start_vm(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    run_action(&state, &name, VmAction::Start).await
}

async fn stop_vm(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> ApiResult<impl IntoResponse> {
    run_action(&state, &name, VmAction::Stop { force: query.force }).await
}

async fn enable_vm(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    run_action(&state, &name, VmAction::Enable).await
}

async fn disable_vm(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> ApiResult<impl IntoResponse> {
    run_action(&state, &name, VmAction::Disable { force: query.force }).await
}

async fn restart_vm(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    run_action(&state, &name, VmAction::Restart).await
}

async fn remove_vm(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    state.actions.execute(&name, &VmAction::Remove).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.actions.list_snapshots(&name).await?))
}

async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<SnapshotRequest>,
) -> ApiResult<impl IntoResponse> {
    let action = VmAction::CreateSnapshot {
        snapshot: request.snapshot,
    };
    let vm = state.actions.execute(&name, &action).await?;
    Ok((StatusCode::CREATED, Json(json!({ "action": action.to_string(), "vm": vm }))))
}

async fn rollback_snapshot(
    State(state): State<Arc<AppState>>,
    Path((name, snapshot)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    run_action(&state, &name, VmAction::Rollback { snapshot }).await
}

async fn migration_targets(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let vm = state.store.find_or_refresh(&name).await?;
    let targets = state.store.resolver().migration_targets(&vm.current_node).await?;
    Ok(Json(targets))
}

#[axum::debug_handler]
async fn migrate_vm(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<MigrateRequest>,
) -> ApiResult<impl IntoResponse> {
    let handle = state.migrations.request_migration(&name, &request.target).await?;
    // the poller reports the outcome through the logs and /migrations
    Ok((StatusCode::ACCEPTED, Json(handle.job().clone())))
}

async fn list_migrations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.migrations.active_jobs())
}

async fn get_migration(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .migrations
        .latest_job(&name)
        .map(Json)
        .ok_or_else(|| no_migration(&name))
}

async fn abort_migration(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if state.migrations.abort(&name) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(no_migration(&name))
    }
}

fn no_migration(name: &str) -> ErrorResponse {
    ErrorResponse::new(ClusterError::VmNotFound {
        vm_name: format!("{} (no active migration)", name),
    })
}

async fn get_selection(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.selected().await)
}

async fn select_vm(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SelectRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.select(&request.name).await?))
}

async fn clear_selection(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.store.clear_selection();
    StatusCode::NO_CONTENT
}
