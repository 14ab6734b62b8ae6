use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};

use super::common::{created_response, override_grant, success_response, validate_input};
use crate::{
    auth::{ActorContext, Screen},
    dto::manufacturing::assembly::{
        BindCellRequest, CreateModuleRequest, ListBindingsQuery, ListModulesQuery,
        QuarantineModuleRequest, UnbindCellRequest,
    },
    errors::ServiceError,
    AppState,
};

/// Creates the router for module assembly endpoints
pub fn module_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_module).get(list_modules))
        .route("/:id", get(get_module))
        .route("/:id/cells", post(bind_cell).get(list_bindings))
        .route("/:id/cells/:serial", delete(unbind_cell))
        .route("/:id/seal", post(seal_module))
        .route("/:id/quarantine", post(quarantine_module))
}

async fn create_module(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(payload): Json<CreateModuleRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let module = state
        .engine
        .modules()
        .create_module(&actor, payload.into())
        .await?;
    Ok(created_response(module))
}

async fn list_modules(
    State(state): State<AppState>,
    actor: ActorContext,
    Query(query): Query<ListModulesQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let modules = state.engine.modules().list_modules(&actor, query.status).await?;
    Ok(success_response(modules))
}

async fn get_module(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let module = state.engine.modules().get_module(&actor, &id).await?;
    Ok(success_response(module))
}

async fn bind_cell(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
    Json(payload): Json<BindCellRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let grant = override_grant(
        &state,
        &actor,
        Screen::Modules,
        payload.override_reason.as_deref(),
    )?;
    let binding = state
        .engine
        .modules()
        .bind_cell(&actor, &id, &payload.serial, grant.as_ref())
        .await?;
    Ok(created_response(binding))
}

async fn list_bindings(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
    Query(query): Query<ListBindingsQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let bindings = state
        .engine
        .modules()
        .list_module_bindings(&actor, &id, query.include_released)
        .await?;
    Ok(success_response(bindings))
}

async fn unbind_cell(
    State(state): State<AppState>,
    actor: ActorContext,
    Path((id, serial)): Path<(String, String)>,
    payload: Option<Json<UnbindCellRequest>>,
) -> Result<impl IntoResponse, ServiceError> {
    let (reason, override_reason) = match payload {
        Some(Json(payload)) => {
            validate_input(&payload)?;
            (payload.reason, payload.override_reason)
        }
        None => (None, None),
    };
    let grant = override_grant(&state, &actor, Screen::Modules, override_reason.as_deref())?;
    let binding = state
        .engine
        .modules()
        .unbind_cell(&actor, &id, &serial, reason, grant.as_ref())
        .await?;
    Ok(success_response(binding))
}

async fn seal_module(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let module = state.engine.modules().seal_module(&actor, &id).await?;
    Ok(success_response(module))
}

async fn quarantine_module(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
    Json(payload): Json<QuarantineModuleRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let module = state
        .engine
        .modules()
        .quarantine_module(&actor, &id, &payload.reason)
        .await?;
    Ok(success_response(module))
}
