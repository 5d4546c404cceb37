//! Router assembly for the controller's external interface (§6): the
//! signaling WebSocket plus a plain health check, the way the
//! corpus's own control-plane services expose a `/healthz` route
//! alongside their real endpoint.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::login::LoginHandler;
use crate::registry::UpdateBroker;
use crate::ws::{signaling_upgrade, WsState};
use overlay_ports::PeerStore;

pub fn router(login: Arc<LoginHandler>, broker: UpdateBroker, store: Arc<dyn PeerStore>, oidc_endpoints: Vec<String>) -> Router {
    let state = WsState {
        login,
        broker,
        store,
        oidc_endpoints,
    };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/signaling", get(signaling_upgrade))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
