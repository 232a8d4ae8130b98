//! HTTP front end
//!
//! Three endpoints:
//!
//! - `GET /health` answers `OK`
//! - `GET /status` lists the connected names as JSON
//! - `GET <ws_path>` authenticates the request and upgrades it to a
//!   WebSocket served by a [`Client`]
//!
//! Authentication happens before the upgrade, so a rejected request never
//! reaches the switch.

use crate::auth::{Credentials, authenticate};
use crate::client::Client;
use crate::relay::IceServerProvider;
use crate::switch::SwitchHandle;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Shared state for the handlers
#[derive(Clone)]
pub struct AppState {
    pub switch: SwitchHandle,
    pub credentials: Arc<dyn Credentials>,
    pub relays: Arc<dyn IceServerProvider>,
    pub mailbox_capacity: usize,
}

/// Build the router serving the WebSocket endpoint at `ws_path`
pub fn router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route(ws_path, get(connect))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<AppState>) -> Response {
    match state.switch.clients().await {
        Ok(names) => Json(names).into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let header = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok());
    let name = match authenticate(state.credentials.as_ref(), header) {
        Ok(name) => name,
        Err(err) => {
            debug!(error = %err, "rejecting connection");
            return (
                StatusCode::UNAUTHORIZED,
                [(WWW_AUTHENTICATE, "Basic realm=\"devnet\"")],
                "Unauthorized",
            )
                .into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    info!(user = %name, "accepted connection");
    let config = state.relays.config_for(&name);
    let client = Client::new(name, state.mailbox_capacity);
    let switch = state.switch.clone();
    upgrade.on_upgrade(move |socket| client.attach(socket, switch, config))
}
