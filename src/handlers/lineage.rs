use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};

use super::common::success_response;
use crate::{
    auth::ActorContext, errors::ServiceError, services::lineage::SubjectRef, AppState,
};

/// Creates the router for lineage queries
pub fn lineage_routes() -> Router<AppState> {
    Router::new()
        .route("/resolve", post(resolve_typed))
        .route("/resolve/:identifier", get(resolve))
        .route("/packs/:pack_id/genealogy", get(genealogy))
}

async fn resolve(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(identifier): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let view = state.engine.lineage().resolve(&actor, &identifier).await?;
    Ok(success_response(view))
}

async fn resolve_typed(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(subject): Json<SubjectRef>,
) -> Result<impl IntoResponse, ServiceError> {
    let view = state.engine.lineage().resolve_typed(&actor, subject).await?;
    Ok(success_response(view))
}

async fn genealogy(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(pack_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let tree = state.engine.lineage().genealogy(&actor, &pack_id).await?;
    Ok(success_response(tree))
}
