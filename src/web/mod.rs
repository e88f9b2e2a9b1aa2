/// HTTP control plane: JSON command endpoints, the `/info` snapshot, the
/// WebSocket feed, and the static viewer pages.
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::dcc::registry::TransferRecord;
use crate::error::BotError;
use crate::irc::session::SessionState;
use crate::irc::supervisor::Supervisor;
use crate::logbuf::LogBuffer;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub logbuf: Arc<LogBuffer>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/join", post(join))
        .route("/part", post(part))
        .route("/msg", post(msg))
        .route("/cancel", post(cancel))
        .route("/shutdown", post(shutdown))
        .route("/info", get(info_snapshot))
        .route("/ws", get(ws::ws_handler))
        .route("/log.html", get(|| static_page("log.html")))
        .route("/info.html", get(|| static_page("info.html")))
        .nest_service("/static", ServeDir::new("static"))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Request bodies ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub server: String,
    pub channel: Option<String>,
    pub channels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct PartRequest {
    pub server: String,
    pub channel: Option<String>,
    pub channels: Option<Vec<String>>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MsgRequest {
    pub server: String,
    pub user: Option<String>,
    pub channel: Option<String>,
    pub channels: Option<Vec<String>>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub server: String,
    pub nick: String,
    pub filename: String,
}

/// Merge the single-channel and list forms, lowercased and trimmed.
fn channel_list(channel: Option<String>, channels: Option<Vec<String>>) -> Vec<String> {
    let mut list: Vec<String> = channels.unwrap_or_default();
    if let Some(channel) = channel {
        list.push(channel);
    }
    list.iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect()
}

fn ok() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

fn error_response(status: StatusCode, error: &BotError) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(json!({"error": error.kind(), "detail": error.to_string()})),
    )
}

// ── Handlers ─────────────────────────────────────────────────────

async fn join(
    State(state): State<AppState>,
    Json(req): Json<JoinRequest>,
) -> impl IntoResponse {
    let channels = channel_list(req.channel, req.channels);
    if channels.is_empty() {
        let error = BotError::ConfigInvalid("missing channel".into());
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, &error).into_response();
    }
    match state.supervisor.join(&req.server, &channels).await {
        Ok(()) => ok().into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

async fn part(
    State(state): State<AppState>,
    Json(req): Json<PartRequest>,
) -> impl IntoResponse {
    let channels = channel_list(req.channel, req.channels);
    if channels.is_empty() {
        let error = BotError::ConfigInvalid("missing channel".into());
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, &error).into_response();
    }
    match state.supervisor.part(&req.server, &channels, req.reason).await {
        Ok(()) => ok().into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

async fn msg(State(state): State<AppState>, Json(req): Json<MsgRequest>) -> impl IntoResponse {
    let channels = channel_list(req.channel, req.channels);
    // Target is the user when given, otherwise the channel itself.
    let target = match req.user.as_deref() {
        Some(user) if !user.trim().is_empty() => user.trim().to_owned(),
        _ => match channels.first() {
            Some(channel) => channel.clone(),
            None => {
                let error = BotError::ConfigInvalid("missing user or channel".into());
                return error_response(StatusCode::UNPROCESSABLE_ENTITY, &error).into_response();
            }
        },
    };
    if req.message.trim().is_empty() {
        let error = BotError::ConfigInvalid("missing message".into());
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, &error).into_response();
    }

    match state
        .supervisor
        .msg(&req.server, &target, &req.message, channels)
        .await
    {
        Ok(()) => ok().into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

async fn cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> impl IntoResponse {
    if state
        .supervisor
        .cancel(&req.server, &req.nick, &req.filename)
    {
        info!("cancelled transfer of {} from {}", req.filename, req.nick);
        Json(json!({"status": "ok", "message": "Transfer cancelled."})).into_response()
    } else {
        let error = BotError::Internal("transfer not found or not running".into());
        error_response(StatusCode::BAD_REQUEST, &error).into_response()
    }
}

async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    let supervisor = Arc::clone(&state.supervisor);
    tokio::spawn(async move {
        supervisor.shutdown().await;
    });
    ok()
}

// ── /info ────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChannelInfo {
    name: String,
    last_active: String,
}

#[derive(Serialize)]
struct NetworkInfo {
    server: String,
    nickname: String,
    state: SessionState,
    channels: Vec<ChannelInfo>,
}

#[derive(Serialize)]
struct InfoResponse {
    networks: Vec<NetworkInfo>,
    transfers: Vec<TransferRecord>,
}

async fn info_snapshot(State(state): State<AppState>) -> Json<InfoResponse> {
    let mut networks = Vec::new();
    for session in state.supervisor.sessions().await {
        let channels = session
            .channels()
            .into_iter()
            .map(|(name, idle_secs)| ChannelInfo {
                name,
                last_active: (chrono::Local::now()
                    - chrono::Duration::seconds(idle_secs as i64))
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            })
            .collect();
        networks.push(NetworkInfo {
            server: session.server.clone(),
            nickname: session.nick(),
            state: session.state(),
            channels,
        });
    }

    Json(InfoResponse {
        networks,
        transfers: state.supervisor.registry.snapshot(),
    })
}

// ── Static pages ─────────────────────────────────────────────────

async fn static_page(name: &'static str) -> impl IntoResponse {
    match tokio::fs::read_to_string(format!("static/{name}")).await {
        Ok(body) => Html(body).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}
