use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Instant;

use crate::{repositories::EntityKey, AppState};

/// Tracks application start time for uptime calculation
static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Initialize the start time (call this on application startup)
pub fn init_start_time() {
    let _ = START_TIME.get_or_init(Instant::now);
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub version: String,
    pub timestamp: String,
    pub uptime_secs: u64,
    pub store: ComponentStatus,
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

/// Liveness plus a probe read against the persistence provider
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let probe = EntityKey::new(crate::repositories::EntityKind::Pack, "__health__");
    let store = match state.engine.context().store.get(&probe).await {
        Ok(_) => ComponentStatus::Up,
        Err(e) => {
            tracing::warn!(error = %e, "Store health probe failed");
            ComponentStatus::Down
        }
    };

    let status = store.clone();
    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: START_TIME.get().map_or(0, |t| t.elapsed().as_secs()),
        store,
    })
}
