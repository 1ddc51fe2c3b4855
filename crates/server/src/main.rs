//! Switchyard Server
//!
//! Serves agent sessions to web chat, voice and chat-ops clients over
//! WebSocket.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use switchyard::config::ServerConfig;
use switchyard::logging::init_logging;
use switchyard::persistence::{self, create_persistence_channel, PersistenceWriter};
use switchyard::state::{AppState, ConnectionSettings};
use switchyard::websocket::ws_handler;
use switchyard::{auth, paths, Registry};
use switchyard_connector_core::MockExecutor;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

const WRITER_EXIT_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    paths::init_data_dir(config.data_dir.as_deref());
    paths::ensure_dirs()?;
    let logging = init_logging(&paths::log_dir())?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %paths::data_dir().display(),
        bind = %config.bind,
        "Starting Switchyard server"
    );

    let db_path = paths::db_path();
    persistence::init_store(&db_path)?;

    let (persist_tx, persist_rx) = create_persistence_channel();
    let writer = tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

    let executor = Arc::new(MockExecutor::new());
    let registry = Registry::new(
        executor,
        config.registry_config(db_path),
        persist_tx.clone(),
    );
    let state = Arc::new(AppState::new(
        registry.clone(),
        ConnectionSettings::from(&config),
        persist_tx.clone(),
    ));

    let mut api = Router::new()
        .route("/api/sessions", get(list_sessions_handler))
        .route("/api/sessions/history", get(session_history_handler));
    if let Some(key) = state.settings.api_key.clone() {
        api = api.route_layer(middleware::from_fn_with_state(key, auth::auth_middleware));
    }

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(
        component = "server",
        event = "server.listening",
        addr = %config.bind,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(
        component = "server",
        event = "server.draining",
        "Draining sessions before exit"
    );
    registry.stop().await;
    persistence::flush(state.persist()).await;
    drop(state);
    drop(persist_tx);
    drop(registry);
    // Lingering connection tasks may still hold a sender.
    let _ = tokio::time::timeout(WRITER_EXIT_GRACE, writer).await;

    info!(component = "server", event = "server.stopped", "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(
            component = "server",
            event = "server.signal_failed",
            error = %e,
            "Failed to listen for ctrl-c"
        );
        std::future::pending::<()>().await;
    }
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn list_sessions_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list_active_sessions())
}

async fn session_history_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list_session_history().await)
}
