use axum::{
    extract::State,
    response::{Html, IntoResponse},
};
use maud::{DOCTYPE, PreEscaped, html};

use super::CSS;
use crate::AppState;
use crate::relay::{PING_TOKEN, PONG_TOKEN};

/// Static landing page for plain HTTP requests.
pub async fn index_page(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.relay.config();
    let connections = state.relay.registry().len().await;

    let markup = html! {
        (DOCTYPE)
        html {
            head {
                title { "Deep Sea Relay" }
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                script src="https://cdn.tailwindcss.com" {}
                style { (PreEscaped(CSS)) }
            }
            body class="bg-gray-900 text-gray-200 min-h-screen flex items-center justify-center" {
                div class="fade-in max-w-xl p-8 bg-gray-800 rounded-lg border border-gray-700" {
                    h1 class="text-2xl font-bold mb-2" { "🌊 Deep Sea Relay" }
                    p class="text-gray-400 mb-6" {
                        "This is a WebSocket broadcast relay. Connect with a WebSocket client; "
                        "every chat message is stored and relayed to everyone connected."
                    }
                    ul class="space-y-1 text-sm" {
                        li { "Connected clients: " (connections) }
                        li { "History replayed on join: " (config.history_limit) " messages" }
                        li { "Heartbeat every " (config.heartbeat_interval.as_secs()) "s" }
                        @match &config.chat_delimiter {
                            Some(d) => {
                                li { "Chat messages must contain " code { (d) } }
                            }
                            None => {
                                li { "Any non-blank text is a chat message" }
                            }
                        }
                    }
                    p class="text-xs text-gray-500 mt-6" {
                        "Application heartbeats use " code { (PING_TOKEN) } " / " code { (PONG_TOKEN) } "."
                    }
                }
            }
        }
    };

    Html(markup.into_string())
}
