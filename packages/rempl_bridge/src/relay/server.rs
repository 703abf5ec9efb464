//! WebSocket front-end for the relay hub.
//!
//! Routes:
//! - `GET /page/{tab_id}`: page side of the session for `tab_id`
//! - `GET /plugin`: panel side; the first frame must be `plugin:init`
//! - `GET /health`: liveness plus the number of known sessions

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{sink::SinkExt, stream::StreamExt};
use rempl_protocol::{Frame, PluginInit, ProtocolError, TabId};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::actor::{HubHandle, Port};
use crate::config::RelayConfig;

pub fn router(hub: HubHandle) -> Router {
    Router::new()
        .route("/page/{tab_id}", get(page_socket))
        .route("/plugin", get(plugin_socket))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

async fn page_socket(
    State(hub): State<HubHandle>,
    Path(tab_id): Path<u64>,
    ws: WebSocketUpgrade,
) -> Response {
    let tab = TabId(tab_id);
    match hub.connect_page(tab) {
        Ok(port) => ws.on_upgrade(move |socket| run_socket(socket, port, true)),
        Err(e) => {
            error!(%tab, "Cannot attach page: {}", e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn plugin_socket(State(hub): State<HubHandle>, ws: WebSocketUpgrade) -> Response {
    match hub.connect_plugin() {
        Ok(port) => ws.on_upgrade(move |socket| run_socket(socket, port, false)),
        Err(e) => {
            error!("Cannot attach plugin: {}", e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn health(State(hub): State<HubHandle>) -> Response {
    match hub.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "status": "ok",
            "sessions": stats.sessions,
        }))
        .into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// Pump packets between one socket and its port until either side closes.
/// `bound` is false for plugin sockets that still have to send `plugin:init`.
async fn run_socket(socket: WebSocket, port: Port, bound: bool) {
    let endpoint = port.id();
    info!(%endpoint, "Relay socket opened");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (port_tx, mut port_rx) = port.split();

    let sender_task = async move {
        while let Some(frame) = port_rx.recv_frame().await {
            if ws_sender
                .send(Message::Text(frame.into_text().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    };

    let receiver_task = async move {
        let mut bound = bound;
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            if !bound {
                match PluginInit::decode(text.as_str()) {
                    Ok(init) => {
                        debug!(%endpoint, tab = %init.tab_id, "plugin:init");
                        if port_tx.init(init.tab_id).is_err() {
                            break;
                        }
                        bound = true;
                    }
                    Err(e) => warn!(%endpoint, "Expected plugin:init: {}", e),
                }
                continue;
            }

            match Frame::parse(text.as_str()) {
                Ok(frame) => {
                    if port_tx.post_frame(frame).is_err() {
                        break;
                    }
                }
                Err(ProtocolError::UnknownType(kind)) => {
                    warn!(%endpoint, kind = %kind, "Ignoring packet of unknown type");
                }
                Err(e) => warn!(%endpoint, "Ignoring malformed packet: {}", e),
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(%endpoint, "Sender task ended"),
        _ = receiver_task => debug!(%endpoint, "Receiver task ended"),
    }

    info!(%endpoint, "Relay socket closed");
}

/// Bind and serve until Ctrl+C.
pub async fn serve(config: RelayConfig, hub: HubHandle) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Relay hub listening on ws://{}", actual_addr);
    info!("  GET /page/{{tab_id}} - page endpoint");
    info!("  GET /plugin         - panel endpoint (send plugin:init first)");
    info!("  GET /health         - health check");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, stopping relay...");
    };

    axum::serve(listener, router(hub))
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}
