//! HTTP surface: the websocket upgrade endpoint and a health check.
//!
//! No origin checking — the original allows every origin by design (its
//! upgrader's `CheckOrigin` always returns true) since clients are expected
//! to be server-side SDKs as often as browsers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use mycelium_auth::{ApiKeyStore, ConnectQuery};
use mycelium_bus::Bus;
use serde::Deserialize;
use tokio::sync::watch;

use crate::connection::{handle_connection, ConnectionDeps};
use crate::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub api_key_store: Arc<dyn ApiKeyStore>,
    pub bus: Arc<dyn Bus>,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectQueryParams {
    key: Option<String>,
    token: Option<String>,
}

#[must_use]
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/realtime", get(upgrade_handler))
        .route("/ws", get(upgrade_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQueryParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let deps = ConnectionDeps {
        hub: Arc::clone(&state.hub),
        api_key_store: Arc::clone(&state.api_key_store),
        bus: Arc::clone(&state.bus),
        shutdown: state.shutdown.clone(),
    };

    ws.on_upgrade(move |socket| async move {
        let connect_query = ConnectQuery {
            key: query.key.as_deref(),
            token: query.token.as_deref(),
        };
        handle_connection(socket, connect_query, addr, deps).await;
    })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.hub.client_count().await,
    }))
}
