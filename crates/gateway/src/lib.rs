//! Gateway: the relay process's WebSocket + REST surface, the bridge
//! into the vault, and the Upstream Chat Bridge.

pub mod auth;
pub mod chat_handler;
pub mod command_handler;
pub mod event_forwarder;
pub mod job_handler;
pub mod registry;
pub mod rest;
pub mod state;
pub mod system_handler;
pub mod ws;

pub use state::{ChatFallbackConfig, GatewayState};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::info;

/// Build the full gateway router: health, REST, and the `/ws` upgrade
/// endpoint, backed by shared state.
pub fn build_app(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade_handler))
        .merge(rest::router())
        .with_state(state)
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_connection(socket, state, addr))
}

/// Spawn the background tasks every gateway instance needs regardless
/// of how it's wired up by a caller: the Change Bus forwarder and, if
/// an Upstream Chat Bridge was configured, its event forwarder.
pub fn spawn_background_tasks(
    state: Arc<GatewayState>,
    bridge_events: Option<tokio::sync::mpsc::UnboundedReceiver<relay_chat::BridgeEvent>>,
) {
    tokio::spawn(event_forwarder::run_change_bus_forwarder(state.clone()));
    if let Some(events) = bridge_events {
        tokio::spawn(event_forwarder::run_bridge_forwarder(state, events));
    }
    info!("gateway background tasks started");
}

/// Serve `app` on `addr` until the process receives a shutdown signal.
pub async fn serve(app: Router, addr: SocketAddr, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
}
