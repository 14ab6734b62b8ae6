use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};

use super::common::{created_response, override_grant, success_response, validate_input};
use crate::{
    auth::{ActorContext, Screen},
    dto::manufacturing::eol::{
        FinalizeDecisionRequest, HoldPackRequest, ListQuarantineQuery, ReleaseQuarantineRequest,
        UpdateTestItemRequest,
    },
    entities::manufacturing::ItemUpdate,
    errors::ServiceError,
    AppState,
};

/// Creates the router for EOL test endpoints
pub fn eol_routes() -> Router<AppState> {
    Router::new()
        .route("/packs/:pack_id/run", post(open_test_run))
        .route("/packs/:pack_id/runs", get(list_test_runs))
        .route("/runs/:run_id", get(get_test_run))
        .route("/runs/:run_id/items/:item_id", put(update_test_item))
        .route("/runs/:run_id/decision", post(finalize_decision))
}

/// Creates the router for quarantine endpoints
pub fn quarantine_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_quarantine_records))
        .route("/packs/:pack_id/hold", post(hold_pack))
        .route("/packs/:pack_id/release", post(release_from_quarantine))
}

async fn open_test_run(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(pack_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let run = state.engine.eol().open_test_run(&actor, &pack_id).await?;
    Ok(success_response(run))
}

async fn list_test_runs(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(pack_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let runs = state.engine.eol().list_test_runs(&actor, &pack_id).await?;
    Ok(success_response(runs))
}

async fn get_test_run(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let run = state.engine.eol().get_test_run(&actor, &run_id).await?;
    Ok(success_response(run))
}

async fn update_test_item(
    State(state): State<AppState>,
    actor: ActorContext,
    Path((run_id, item_id)): Path<(String, String)>,
    Json(payload): Json<UpdateTestItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let update = ItemUpdate::try_from(payload)?;
    let run = state
        .engine
        .eol()
        .update_test_item(&actor, &run_id, &item_id, update)
        .await?;
    Ok(success_response(run))
}

async fn finalize_decision(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(run_id): Path<String>,
    Json(payload): Json<FinalizeDecisionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let grant = override_grant(&state, &actor, Screen::Eol, payload.override_reason.as_deref())?;
    let outcome = state
        .engine
        .eol()
        .finalize_decision(&actor, &run_id, payload.decision, payload.notes, grant.as_ref())
        .await?;
    Ok(success_response(outcome))
}

async fn list_quarantine_records(
    State(state): State<AppState>,
    actor: ActorContext,
    Query(query): Query<ListQuarantineQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let records = state
        .engine
        .eol()
        .list_quarantine_records(&actor, query.pack_id.as_deref(), query.open_only)
        .await?;
    Ok(success_response(records))
}

async fn hold_pack(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(pack_id): Path<String>,
    Json(payload): Json<HoldPackRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let record = state
        .engine
        .eol()
        .hold_pack(&actor, &pack_id, &payload.reason, payload.ncr_ref)
        .await?;
    Ok(created_response(record))
}

async fn release_from_quarantine(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(pack_id): Path<String>,
    Json(payload): Json<ReleaseQuarantineRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let outcome = state
        .engine
        .eol()
        .release_from_quarantine(&actor, &pack_id, payload.disposition, payload.notes)
        .await?;
    Ok(success_response(outcome))
}
