//! HTTP and WebSocket handlers for the pairing server
//!
//! The WebSocket boundary is where untyped frames become typed events:
//! every inbound frame is size-capped, JSON-parsed against the
//! [`ClientEvent`] schema and silently dropped when it does not conform.
//! No internal error detail ever reaches a client.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::gateway;
use crate::metrics;
use crate::models::{
    AdmissionRejection, ClientEvent, ErrorResponse, HealthResponse, StatsResponse,
};
use crate::state::SharedState;

/// Health check endpoint
pub async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime(),
    })
}

/// Live counters endpoint
pub async fn stats_handler(State(state): State<SharedState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        online: state.online_count().await,
        waiting: state.matchmaking.queue_len().await,
        active_pairs: state.matchmaking.active_pairs().await,
    })
}

/// Prometheus text endpoint
pub async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(err) => {
            tracing::error!("failed to gather metrics: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ── WebSocket ──

/// WebSocket upgrade handler. Admission runs before the upgrade so refused
/// connections never cost a socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<SharedState>,
) -> Response {
    if !state.accepting.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "shutting_down".into(),
                code: 503,
            }),
        )
            .into_response();
    }

    let address = gateway::client_ip(&headers, &peer.ip().to_string());
    let country = gateway::client_country(&headers);

    match gateway::admit(&state, &address, country.as_deref()).await {
        Ok(identity) => {
            ws.on_upgrade(move |socket| websocket_session(socket, identity, state))
        }
        Err(rejection) => {
            info!(%address, reason = rejection.as_str(), "connection refused");
            let status = match rejection {
                AdmissionRejection::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::FORBIDDEN,
            };
            (
                status,
                Json(ErrorResponse {
                    error: rejection.as_str().into(),
                    code: status.as_u16(),
                }),
            )
                .into_response()
        }
    }
}

async fn websocket_session(socket: WebSocket, identity: String, state: SharedState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let session_id = gateway::start_session(&state, identity, tx).await;
    info!(session = %session_id, "session admitted, challenge issued");

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(payload) => {
                    if sink.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                // Sender removed from the connection table: the server
                // tore this session down. Close out.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, session_id, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(session = %session_id, "websocket error: {err}");
                    break;
                }
            },
        }
    }

    state.teardown_session(session_id).await;
    info!(session = %session_id, "session closed");
}

/// Size-cap, parse and dispatch one inbound frame. Non-conforming frames
/// are ValidationErrors: dropped, never echoed back.
async fn handle_frame(state: &SharedState, session_id: Uuid, text: &str) {
    if text.len() > state.config.max_payload_bytes {
        debug!(session = %session_id, len = text.len(), "oversized frame dropped");
        return;
    }

    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(_) => {
            debug!(session = %session_id, "malformed frame dropped");
            return;
        }
    };

    match event {
        ClientEvent::SolveChallenge { candidate } => {
            gateway::solve_challenge(state, session_id, &candidate).await;
        }
        ClientEvent::FindMatch => {
            state.matchmaking.find_match(state, session_id).await;
        }
        ClientEvent::SendMessage { text, ack } => {
            state.relay.send_message(state, session_id, &text, ack).await;
        }
        ClientEvent::Typing { is_typing } => {
            state.relay.typing(state, session_id, is_typing).await;
        }
        ClientEvent::ReportUser => {
            state.moderation.report_user(state, session_id).await;
        }
        ClientEvent::LeaveChat { ack } => {
            state.relay.leave_chat(state, session_id, ack).await;
        }
    }
}
