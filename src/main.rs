use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{signal, sync::mpsc};
use tracing::info;

use packtrace_api as api;
use api::{
    auth::{Authorizer, PermissionTable},
    events::EventSender,
    repositories::InMemoryStore,
    services::TraceabilityEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);
    api::handlers::health::init_start_time();

    // Permission table is built once and injected
    let table = PermissionTable::from_config(&cfg.authorization)
        .context("invalid authorization table")?;
    let authorizer = Arc::new(Authorizer::new(Arc::new(table)));

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    tokio::spawn(api::events::process_events(event_rx));

    let engine = TraceabilityEngine::builder(Arc::new(InMemoryStore::new()), authorizer)
        .settings(cfg.engine.clone())
        .eol(cfg.eol.clone())
        .events(EventSender::new(event_tx))
        .build()
        .context("failed to build traceability engine")?;

    let app = api::app(api::AppState::new(engine));

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, environment = %cfg.environment, "PackTrace API listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
