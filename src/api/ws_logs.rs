// =============================================================================
// Log Tail WebSocket — `/ws/logs`
// =============================================================================
//
// Replays up to the last 500 lines of today's rotating log file, then tails
// newly-appended lines by polling the file length every second and reading
// only the bytes written since the last check.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::logging::current_log_path;

const REPLAY_LINES: usize = 500;
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Deserialize)]
pub struct LogsQuery {
    token: Option<String>,
}

pub async fn ws_logs_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("log tail WebSocket rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }
    ws.on_upgrade(move |socket| handle_log_tail(socket, state)).into_response()
}

async fn handle_log_tail(socket: WebSocket, state: Arc<AppState>) {
    use futures_util::{SinkExt, StreamExt};
    let (mut sender, mut receiver) = socket.split();
    let path = current_log_path(&state.log_dir);

    let mut offset = match replay_tail(&path, REPLAY_LINES) {
        Ok((lines, len)) => {
            for line in lines {
                if sender.send(Message::Text(line.into())).await.is_err() {
                    return;
                }
            }
            len
        }
        Err(e) => {
            info!(error = %e, path = %path.display(), "log file not available yet for tailing");
            0
        }
    };

    let mut poll = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                match read_new_bytes(&path, offset).await {
                    Ok((text, new_offset)) => {
                        offset = new_offset;
                        for line in text.lines() {
                            if line.is_empty() { continue; }
                            if sender.send(Message::Text(line.to_string().into())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(_) => { /* file rotated past midnight or not yet created; retry next tick */ }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(_)) => return,
                    _ => {}
                }
            }
        }
    }
}

/// Reads the whole file and returns the last `max_lines` lines plus the
/// file's current byte length (the tail's starting offset).
fn replay_tail(path: &std::path::Path, max_lines: usize) -> std::io::Result<(Vec<String>, u64)> {
    let content = std::fs::read_to_string(path)?;
    let len = content.len() as u64;
    let lines: Vec<String> = content.lines().map(str::to_string).collect();
    let start = lines.len().saturating_sub(max_lines);
    Ok((lines[start..].to_vec(), len))
}

/// Reads bytes appended to the file since `offset`, returning the new
/// offset. If the file has shrunk (e.g. rotated past midnight), resets to
/// the new end-of-file without emitting anything for this tick.
async fn read_new_bytes(path: &std::path::Path, offset: u64) -> std::io::Result<(String, u64)> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<(String, u64)> {
        let mut file = std::fs::File::open(&path)?;
        let len = file.metadata()?.len();
        if len <= offset {
            return Ok((String::new(), len));
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        Ok((buf, len))
    })
    .await
    .unwrap_or_else(|e| Err(std::io::Error::new(std::io::ErrorKind::Other, e)))
}
