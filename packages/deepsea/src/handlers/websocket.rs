use axum::{
    extract::{State, WebSocketUpgrade, ws::rejection::WebSocketUpgradeRejection},
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::{views, ws};

/// Upgrade requests join the relay; anything else gets the landing page.
pub async fn relay_handler(
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(upgrade) => {
            let relay = state.relay.clone();
            upgrade.on_upgrade(move |socket| ws::handle_relay_ws(socket, relay))
        }
        Err(_) => views::index_page(State(state)).await.into_response(),
    }
}
