use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};

use super::common::{created_response, success_response, validate_input};
use crate::{
    auth::ActorContext,
    dto::manufacturing::assembly::{
        BindDeviceRequest, CreatePackRequest, LinkModuleRequest, ListPacksQuery,
        SetQcStatusRequest,
    },
    errors::ServiceError,
    AppState,
};

/// Creates the router for pack assembly endpoints
pub fn pack_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_pack).get(list_packs))
        .route("/:id", get(get_pack))
        .route("/:id/modules", post(link_module))
        .route("/:id/modules/:module_id", delete(unlink_module))
        .route("/:id/device", post(bind_device))
        .route("/:id/serial", post(assign_pack_serial))
        .route("/:id/qc", put(set_qc_status))
        .route("/:id/ready", post(mark_ready_for_eol))
        .route("/:id/dispatch", post(dispatch_pack))
}

async fn create_pack(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(payload): Json<CreatePackRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let pack = state.engine.packs().create_pack(&actor, payload.into()).await?;
    Ok(created_response(pack))
}

async fn list_packs(
    State(state): State<AppState>,
    actor: ActorContext,
    Query(query): Query<ListPacksQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let packs = state.engine.packs().list_packs(&actor, query.status).await?;
    Ok(success_response(packs))
}

async fn get_pack(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let pack = state.engine.packs().get_pack(&actor, &id).await?;
    Ok(success_response(pack))
}

async fn link_module(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
    Json(payload): Json<LinkModuleRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let pack = state
        .engine
        .packs()
        .link_module(&actor, &id, &payload.module_id)
        .await?;
    Ok(success_response(pack))
}

async fn unlink_module(
    State(state): State<AppState>,
    actor: ActorContext,
    Path((id, module_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ServiceError> {
    let pack = state
        .engine
        .packs()
        .unlink_module(&actor, &id, &module_id)
        .await?;
    Ok(success_response(pack))
}

async fn bind_device(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
    Json(payload): Json<BindDeviceRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let pack = state
        .engine
        .packs()
        .bind_device(&actor, &id, &payload.bms_id)
        .await?;
    Ok(success_response(pack))
}

async fn assign_pack_serial(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let pack = state.engine.packs().assign_pack_serial(&actor, &id).await?;
    Ok(success_response(pack))
}

async fn set_qc_status(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
    Json(payload): Json<SetQcStatusRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let pack = state
        .engine
        .packs()
        .set_qc_status(&actor, &id, payload.status)
        .await?;
    Ok(success_response(pack))
}

async fn mark_ready_for_eol(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let pack = state.engine.packs().mark_ready_for_eol(&actor, &id).await?;
    Ok(success_response(pack))
}

async fn dispatch_pack(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let pack = state.engine.packs().dispatch_pack(&actor, &id).await?;
    Ok(success_response(pack))
}
