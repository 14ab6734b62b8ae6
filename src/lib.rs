//! PackTrace API Library
//!
//! Traceability and workflow authorization engine for battery-pack
//! manufacturing: cell lots and serials, module and pack assembly, EOL
//! disposition and lineage, each transition gated by the cluster
//! permission table.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod dto;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod repositories;
pub mod services;

use axum::{extract::FromRef, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::auth::Authorizer;
use crate::services::TraceabilityEngine;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub engine: TraceabilityEngine,
    pub authorizer: Arc<Authorizer>,
}

impl AppState {
    pub fn new(engine: TraceabilityEngine) -> Self {
        let authorizer = engine.context().authorizer.clone();
        Self { engine, authorizer }
    }
}

impl FromRef<AppState> for Arc<Authorizer> {
    fn from_ref(state: &AppState) -> Self {
        state.authorizer.clone()
    }
}

/// Full HTTP application: health probe plus the versioned API
pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/health", handlers::health::health_routes())
        .nest("/api/v1", handlers::api_v1_routes())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
