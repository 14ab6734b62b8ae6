use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};

use super::common::{created_response, success_response, validate_input};
use crate::{
    auth::ActorContext,
    dto::manufacturing::lot::{
        CreateLotRequest, GenerateSerialsRequest, ListLotsQuery, ListSerialsQuery,
        ScanSerialRequest,
    },
    errors::ServiceError,
    AppState,
};

/// Creates the router for cell lot endpoints
pub fn lot_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_lot).get(list_lots))
        .route("/:id", get(get_lot))
        .route("/:id/serials", post(generate_serials).get(list_lot_serials))
        .route("/:id/scan", post(scan_serial))
        .route("/:id/publish", post(publish_lot))
        .route("/:id/counters", get(verify_lot_counters))
}

/// Serial lookup independent of the owning lot
pub fn serial_routes() -> Router<AppState> {
    Router::new().route("/:serial", get(find_serial))
}

async fn create_lot(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(payload): Json<CreateLotRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let lot = state.engine.ledger().create_lot(&actor, payload.into()).await?;
    Ok(created_response(lot))
}

async fn list_lots(
    State(state): State<AppState>,
    actor: ActorContext,
    Query(query): Query<ListLotsQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let lots = state.engine.ledger().list_lots(&actor, query.status).await?;
    Ok(success_response(lots))
}

async fn get_lot(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let lot = state.engine.ledger().get_lot(&actor, &id).await?;
    Ok(success_response(lot))
}

async fn generate_serials(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
    Json(payload): Json<GenerateSerialsRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let generated = state
        .engine
        .ledger()
        .generate_serials(&actor, &id, &payload.prefix, payload.count)
        .await?;
    Ok(created_response(generated))
}

async fn list_lot_serials(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
    Query(query): Query<ListSerialsQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let serials = state
        .engine
        .ledger()
        .list_lot_serials(&actor, &id, query.status)
        .await?;
    Ok(success_response(serials))
}

async fn scan_serial(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
    Json(payload): Json<ScanSerialRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let serial = state
        .engine
        .ledger()
        .scan_serial(&actor, &id, &payload.serial)
        .await?;
    Ok(success_response(serial))
}

async fn publish_lot(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let lot = state.engine.ledger().publish_lot(&actor, &id).await?;
    Ok(success_response(lot))
}

async fn verify_lot_counters(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let report = state.engine.ledger().verify_lot_counters(&actor, &id).await?;
    Ok(success_response(report))
}

async fn find_serial(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(serial): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let serial = state
        .engine
        .ledger()
        .find_serial_globally(&actor, &serial)
        .await?;
    Ok(success_response(serial))
}
