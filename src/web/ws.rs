/// WebSocket feed: streams the log ring (backlog, then live) and ~1 Hz
/// transfer snapshots to the browser; accepts textual operator commands
/// back (`/join`, `/part`, `/msg`, `/echo`, `/help`).
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use super::AppState;
use crate::dcc::registry::TransferRecord;
use crate::logbuf::LogRecord;

#[derive(Serialize)]
#[serde(tag = "type")]
enum ServerMessage {
    #[serde(rename = "log")]
    Log {
        #[serde(flatten)]
        record: LogRecord,
    },
    #[serde(rename = "transfers")]
    Transfers { transfers: Vec<TransferRecord> },
    #[serde(rename = "status")]
    Status {
        status: &'static str,
        message: String,
    },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(ws: WebSocket, state: AppState) {
    let (mut tx, mut rx) = ws.split();

    // Late joiners get the retained log history first.
    for record in state.logbuf.backlog() {
        if send_json(&mut tx, &ServerMessage::Log { record }).await.is_err() {
            return;
        }
    }

    let mut log_rx = state.logbuf.subscribe();
    let mut snapshot_tick = tokio::time::interval(std::time::Duration::from_secs(1));
    let shutdown = state.supervisor.shutdown_token();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            result = log_rx.recv() => match result {
                Ok(record) => {
                    if send_json(&mut tx, &ServerMessage::Log { record }).await.is_err() {
                        break;
                    }
                }
                // A slow client lost some records; keep streaming.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },

            _ = snapshot_tick.tick() => {
                let message = ServerMessage::Transfers {
                    transfers: state.supervisor.registry.snapshot(),
                };
                if send_json(&mut tx, &message).await.is_err() {
                    break;
                }
            }

            incoming = rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_ws_command(&state, text.as_str(), &mut tx).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}

/// Textual operator commands, `/command args...`.
async fn handle_ws_command(
    state: &AppState,
    input: &str,
    tx: &mut SplitSink<WebSocket, Message>,
) {
    let input = input.trim();
    let Some(stripped) = input.strip_prefix('/') else {
        info!("ws client says: {input}");
        return;
    };
    let mut parts = stripped.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    let reply = match command {
        "echo" => status("ok", args.join(" ")),
        "help" => status("ok", "Available commands: echo, join, part, msg".into()),
        "join" if args.len() >= 2 => {
            let channels: Vec<String> = args[1..].iter().map(|c| c.to_string()).collect();
            match state.supervisor.join(args[0], &channels).await {
                Ok(()) => status("ok", format!("joining {}", channels.join(", "))),
                Err(e) => status("error", e.to_string()),
            }
        }
        "part" if args.len() >= 2 => {
            let channels: Vec<String> = args[1..].iter().map(|c| c.to_string()).collect();
            match state.supervisor.part(args[0], &channels, None).await {
                Ok(()) => status("ok", format!("parting {}", channels.join(", "))),
                Err(e) => status("error", e.to_string()),
            }
        }
        "msg" if args.len() >= 3 => {
            let text = args[2..].join(" ");
            match state
                .supervisor
                .msg(args[0], args[1], &text, Vec::new())
                .await
            {
                Ok(()) => status("ok", format!("sent to {}", args[1])),
                Err(e) => status("error", e.to_string()),
            }
        }
        _ => status("error", format!("unknown or incomplete command: /{command}")),
    };
    let _ = send_json(tx, &reply).await;
}

fn status(state: &'static str, message: String) -> ServerMessage {
    ServerMessage::Status {
        status: state,
        message,
    }
}

async fn send_json(
    tx: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let encoded = serde_json::to_string(message).unwrap_or_default();
    tx.send(Message::Text(encoded.into())).await
}
