//! Request handlers for the hub's HTTP endpoints

pub mod websocket;

use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use warp::{Filter, Rejection, Reply};

use crate::constants::WS_PATH;
use crate::core::SharedHub;

// Re-export the websocket handler
pub use websocket::{handle_ws_client, WsTransport};

/// Query parameters accepted on the WebSocket upgrade
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// User identity to bind the new connection to
    pub user: Option<String>,
}

/// All routes served by the hub: `/ws`, `/health` and `/stats`
pub fn routes(
    hub: SharedHub,
    transport: Arc<WsTransport>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let ws_route = warp::path(WS_PATH)
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::query::<ConnectParams>())
        .and(with_hub(hub.clone()))
        .and(with_transport(transport))
        .map(
            |ws: warp::ws::Ws, params: ConnectParams, hub: SharedHub, transport: Arc<WsTransport>| {
                log::info!("New websocket connection");
                let user = params.user.filter(|user| !user.is_empty());
                ws.on_upgrade(move |socket| handle_ws_client(socket, user, hub, transport))
            },
        );

    let health_route = warp::path("health").and(warp::path::end()).map(|| "OK");

    let stats_route = warp::path("stats")
        .and(warp::path::end())
        .and(with_hub(hub))
        .map(|hub: SharedHub| {
            warp::reply::json(&serde_json::json!({
                "connections": hub.connection_count(),
                "groups": hub.group_count(),
            }))
        });

    ws_route.or(health_route).or(stats_route)
}

// Helper function to include hub state in request
fn with_hub(hub: SharedHub) -> impl Filter<Extract = (SharedHub,), Error = Infallible> + Clone {
    warp::any().map(move || hub.clone())
}

fn with_transport(
    transport: Arc<WsTransport>,
) -> impl Filter<Extract = (Arc<WsTransport>,), Error = Infallible> + Clone {
    warp::any().map(move || transport.clone())
}
