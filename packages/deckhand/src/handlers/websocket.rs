use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use crate::AppState;
use crate::ws;

/// Upgrade to a websocket that receives every envelope the hub publishes.
pub async fn websocket_handler(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| ws::handle_socket(socket, state.hub, state.metrics))
}
