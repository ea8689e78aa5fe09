mod cleanup;
mod config;

use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use lounge_gateway::connection;
use lounge_gateway::coordinator::RoomCoordinator;
use lounge_gateway::dispatcher::Dispatcher;
use lounge_gateway::irc::{AdmissionGovernor, IrcBridgeManager};
use lounge_store::SharedStateStore;
use lounge_types::models::now_ms;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "lounge=debug,lounge_gateway=debug,lounge_store=info,tower_http=debug".into()
            }),
        )
        .init();

    let config = Config::from_env()?;

    // Shared state
    let store = match &config.redis_url {
        Some(url) => SharedStateStore::connect(url).await,
        None => {
            info!("No LOUNGE_REDIS_URL set, keeping shared state in memory");
            SharedStateStore::memory()
        }
    };
    let dispatcher = Dispatcher::new(store, config.instance_id.clone());
    let irc = IrcBridgeManager::new(config.irc.clone(), dispatcher.clone(), AdmissionGovernor::spawn());
    let coordinator = RoomCoordinator::new(dispatcher, irc.clone());

    let restored = coordinator.tube().restore_all().await;
    info!("Restored tube state for {} rooms", restored);

    tokio::spawn(coordinator.clone().run_bus());
    tokio::spawn(cleanup::run_cleanup_loop(coordinator.clone(), config.tube_grace));

    if config.irc_shared {
        if irc.is_enabled() {
            irc.start_shared().await;
        } else {
            warn!("LOUNGE_IRC_SHARED is set but LOUNGE_IRC_SERVER is not, relay not started");
        }
    }

    // Routes
    let app = Router::new()
        .route("/socket", get(ws_upgrade))
        .route("/health", get(health))
        .route("/rooms/{room_id}/tube", get(room_tube))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(coordinator);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(instance = %config.instance_id, "Lounge server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    irc.shutdown().await;
    info!("Server shut down gracefully");
    Ok(())
}

async fn ws_upgrade(
    State(coordinator): State<RoomCoordinator>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, coordinator))
}

async fn health(State(coordinator): State<RoomCoordinator>) -> impl IntoResponse {
    let dispatcher = coordinator.dispatcher();
    let rooms = dispatcher.registry().read().await.room_ids().len();
    Json(json!({
        "status": "ok",
        "instance": dispatcher.instance_id(),
        "store": if dispatcher.store().is_remote() { "redis" } else { "memory" },
        "irc": coordinator.irc().is_enabled(),
        "rooms": rooms,
    }))
}

async fn room_tube(
    State(coordinator): State<RoomCoordinator>,
    Path(room_id): Path<String>,
) -> impl IntoResponse {
    if let Some(snapshot) = coordinator.tube().peek(&room_id).await {
        return Json(snapshot).into_response();
    }
    match coordinator.dispatcher().store().get_tube_state(&room_id).await {
        Ok(Some(state)) => Json(state.snapshot(now_ms())).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(room_id = %room_id, "Could not read tube state: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
