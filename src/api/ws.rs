// =============================================================================
// WebSocket Handler — Push-based state + bus relay
// =============================================================================
//
// Clients connect to `/ws?token=<token>` and receive:
//   1. An immediate full StateSnapshot on connect.
//   2. A fresh snapshot whenever `state_version` advances (checked every
//      500 ms), so polling dashboards never miss a mutation even if the bus
//      message that caused it was dropped for lack of a subscriber.
//   3. Every message published on the `system_status`, `spx_stream_price`,
//      and `spx_stream_log` bus topics, forwarded verbatim as
//      `{"topic": ..., "payload": ..., "ts": ...}`.
//
// The handler also answers Ping with Pong and tracks the shared
// `ws_user_connected` flag / `last_ws_user_event` timestamp on AppState.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::bus::BusMessage;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state)).into_response()
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    {
        *state.ws_user_connected.write() = true;
        *state.last_ws_user_event.write() = std::time::Instant::now();
    }
    state.increment_version();

    let (mut sender, mut receiver) = socket.split();
    use futures_util::{SinkExt, StreamExt};

    let mut sequence: u64 = 0;
    if let Err(e) = send_snapshot(&mut sender, &state, &mut sequence).await {
        warn!(error = %e, "failed to send initial WebSocket snapshot");
        cleanup(&state);
        return;
    }
    let mut last_sent_version = state.current_state_version();

    let mut status_rx = state.bus.subscribe("system_status");
    let mut price_rx = state.bus.subscribe("spx_stream_price");
    let mut log_rx = state.bus.subscribe("spx_stream_log");
    let mut push_interval = interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                let current_version = state.current_state_version();
                if current_version != last_sent_version {
                    match send_snapshot(&mut sender, &state, &mut sequence).await {
                        Ok(()) => last_sent_version = current_version,
                        Err(e) => { debug!(error = %e, "WebSocket send failed — disconnecting"); break; }
                    }
                }
            }

            msg = status_rx.recv() => {
                if let Ok(bus_msg) = msg {
                    if forward_bus_message(&mut sender, bus_msg).await.is_err() { break; }
                }
            }

            msg = price_rx.recv() => {
                if let Ok(bus_msg) = msg {
                    if forward_bus_message(&mut sender, bus_msg).await.is_err() { break; }
                }
            }

            msg = log_rx.recv() => {
                if let Ok(bus_msg) = msg {
                    if forward_bus_message(&mut sender, bus_msg).await.is_err() { break; }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket text message received (heartbeat)");
                        *state.last_ws_user_event.write() = std::time::Instant::now();
                        state.increment_version();
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    cleanup(&state);
}

async fn forward_bus_message<S>(sender: &mut S, msg: BusMessage) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    use futures_util::SinkExt;
    let payload = serde_json::json!({"topic": msg.topic, "payload": msg.payload, "ts": msg.ts.to_rfc3339()});
    sender.send(Message::Text(payload.to_string().into())).await
}

async fn send_snapshot<S>(sender: &mut S, state: &Arc<AppState>, sequence: &mut u64) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    use futures_util::SinkExt;
    state.ws_sequence_number.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    *sequence += 1;

    let snapshot = state.build_snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            sender.send(Message::Text(json.into())).await?;
            debug!(version = snapshot.state_version, seq = *sequence, "WebSocket snapshot sent");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "failed to serialize snapshot");
            Ok(())
        }
    }
}

fn cleanup(state: &Arc<AppState>) {
    *state.ws_user_connected.write() = false;
    state.increment_version();
    info!("WebSocket connection closed — cleanup complete");
}
