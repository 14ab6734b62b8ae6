pub mod blueprints;
pub mod common;
pub mod eol;
pub mod health;
pub mod lineage;
pub mod lots;
pub mod modules;
pub mod packs;

use axum::Router;

pub use crate::AppState;

/// Every engine operation under `/api/v1`
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .nest("/blueprints", blueprints::blueprint_routes())
        .nest("/lots", lots::lot_routes())
        .nest("/serials", lots::serial_routes())
        .nest("/modules", modules::module_routes())
        .nest("/packs", packs::pack_routes())
        .nest("/eol", eol::eol_routes())
        .nest("/quarantine", eol::quarantine_routes())
        .nest("/lineage", lineage::lineage_routes())
}
