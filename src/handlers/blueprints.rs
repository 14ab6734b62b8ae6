use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};

use super::common::{created_response, success_response, validate_input};
use crate::{
    auth::ActorContext,
    dto::manufacturing::blueprint::{
        CreateBlueprintRequest, ListBlueprintsQuery, UpdateBlueprintRequest,
    },
    errors::ServiceError,
    AppState,
};

/// Creates the router for blueprint endpoints
pub fn blueprint_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_blueprint).get(list_blueprints))
        .route("/:id", get(get_blueprint).put(update_blueprint))
        .route("/:id/activate", post(activate_blueprint))
}

async fn create_blueprint(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(payload): Json<CreateBlueprintRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let blueprint = state
        .engine
        .blueprints()
        .create(&actor, payload.into())
        .await?;
    Ok(created_response(blueprint))
}

async fn list_blueprints(
    State(state): State<AppState>,
    actor: ActorContext,
    Query(query): Query<ListBlueprintsQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let blueprints = state.engine.blueprints().list(&actor, query.status).await?;
    Ok(success_response(blueprints))
}

async fn get_blueprint(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let blueprint = state.engine.blueprints().get(&actor, &id).await?;
    Ok(success_response(blueprint))
}

async fn update_blueprint(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
    Json(payload): Json<UpdateBlueprintRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let blueprint = state
        .engine
        .blueprints()
        .update(&actor, &id, payload.into())
        .await?;
    Ok(success_response(blueprint))
}

async fn activate_blueprint(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let blueprint = state.engine.blueprints().activate(&actor, &id).await?;
    Ok(success_response(blueprint))
}
