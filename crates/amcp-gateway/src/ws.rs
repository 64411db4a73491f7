//! WebSocket connection handling — `/ws?session_id=…` (§6.2).
//!
//! Grounded on the teacher's `handle_connection` (the `tokio::select!` race
//! between reading client frames and forwarding a broadcast firehose, the
//! "send an info/hello frame on connect" opener). The teacher's JSON-RPC
//! method dispatch (`rpc::route_rpc`) has no spec counterpart — a WS client
//! only ever does two things, `prompt` and `cancel` (§6.2) — so this
//! rewrite replaces the RPC router with a direct call into `SessionManager`
//! and mirrors every bus event for the bound session back to the socket as
//! a `WsFrame` (§4.J).

use crate::manager::PromptOutcome;
use crate::server::AppState;
use amcp_core::protocol::{to_ws_frame, ClientAction, FrameType, IncomingFrame, WsFrame};
use amcp_core::Event;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Handle one WebSocket connection. `bound_session` is the `session_id`
/// query parameter, if any — events are mirrored only for that session
/// (an unscoped connection sees nothing on the firehose, matching §6.1's
/// `GET /sessions/{id}/events` being the filtered counterpart of the
/// unfiltered `GET /events`).
pub async fn handle_connection(socket: WebSocket, state: Arc<AppState>, bound_session: Option<String>) {
    state.ws_connections.fetch_add(1, Ordering::Relaxed);
    handle_connection_inner(socket, state.clone(), bound_session).await;
    state.ws_connections.fetch_sub(1, Ordering::Relaxed);
}

async fn handle_connection_inner(socket: WebSocket, state: Arc<AppState>, bound_session: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut bus_rx = state.bus.subscribe_all();

    let hello = WsFrame::new(
        FrameType::Event,
        None,
        serde_json::json!({
            "event": "hello",
            "version": env!("CARGO_PKG_VERSION"),
        }),
    );
    if let Ok(json) = serde_json::to_string(&hello) {
        let _ = ws_tx.send(WsMessage::Text(json)).await;
    }

    let mut authenticated = matches!(state.auth.mode, amcp_core::AuthMode::None);

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let replies = handle_text_message(&text, &state, &mut authenticated, &bound_session).await;
                        for reply in replies {
                            if ws_tx.send(WsMessage::Text(reply)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = ws_tx.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        info!("client disconnected");
                        return;
                    }
                    Some(Err(e)) => {
                        warn!("websocket error: {}", e);
                        return;
                    }
                    None => return,
                    _ => {}
                }
            }

            event = bus_rx.recv() => {
                match event {
                    Ok(ev) => {
                        if !event_is_visible(&ev, &bound_session) {
                            continue;
                        }
                        let frame = to_ws_frame(&ev);
                        if let Ok(json) = serde_json::to_string(&frame) {
                            if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("client lagged, dropped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("event bus closed");
                        return;
                    }
                }
            }
        }
    }
}

/// An unscoped connection (no `?session_id=`) sees every event; a scoped
/// one only sees events tagged with its session.
fn event_is_visible(event: &Event, bound_session: &Option<String>) -> bool {
    match bound_session {
        None => true,
        Some(id) => event.session_id.as_deref() == Some(id.as_str()),
    }
}

async fn handle_text_message(
    text: &str,
    state: &Arc<AppState>,
    authenticated: &mut bool,
    bound_session: &Option<String>,
) -> Vec<String> {
    let mut replies = Vec::new();

    let incoming: IncomingFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            let frame = WsFrame::error(None, "INVALID_JSON", e.to_string());
            if let Ok(json) = serde_json::to_string(&frame) {
                replies.push(json);
            }
            return replies;
        }
    };

    if let IncomingFrame::Auth { token } = &incoming {
        match state.auth.verify_token(token.as_deref()) {
            Ok(()) => {
                *authenticated = true;
                let frame = WsFrame::new(FrameType::Response, None, serde_json::json!({ "kind": "auth", "ok": true }));
                if let Ok(json) = serde_json::to_string(&frame) {
                    replies.push(json);
                }
                info!("client authenticated");
            }
            Err(e) => {
                let frame = WsFrame::error(None, "UNAUTHORIZED", e.to_string());
                if let Ok(json) = serde_json::to_string(&frame) {
                    replies.push(json);
                }
                warn!("auth failed: {}", e);
            }
        }
        return replies;
    }

    if !*authenticated {
        let frame = WsFrame::error(None, "UNAUTHORIZED", "not authenticated");
        if let Ok(json) = serde_json::to_string(&frame) {
            replies.push(json);
        }
        return replies;
    }

    let Some((id, request)) = incoming.request() else {
        return replies;
    };

    let Some(session_id) = request.session_id.clone().or_else(|| bound_session.clone()) else {
        let frame = WsFrame::error(id, "VALIDATION_ERROR", "session_id required");
        if let Ok(json) = serde_json::to_string(&frame) {
            replies.push(json);
        }
        return replies;
    };

    match request.action {
        ClientAction::Prompt => {
            let Some(content) = request.content else {
                let frame = WsFrame::error(id, "VALIDATION_ERROR", "content required for prompt");
                if let Ok(json) = serde_json::to_string(&frame) {
                    replies.push(json);
                }
                return replies;
            };
            let (tx, mut rx) = mpsc::channel(256);
            tokio::spawn(async move { while rx.recv().await.is_some() {} });
            let priority = request.priority.unwrap_or_default();
            let conflict_strategy = request.conflict_strategy.unwrap_or_default();
            match state
                .manager
                .prompt(&session_id, &content, priority, conflict_strategy, tx)
                .await
            {
                Ok(PromptOutcome::Started) => {
                    let frame = WsFrame::new(FrameType::Response, id, serde_json::json!({ "status": "started" }));
                    if let Ok(json) = serde_json::to_string(&frame) {
                        replies.push(json);
                    }
                }
                Ok(PromptOutcome::Queued { position }) => {
                    let frame = WsFrame::new(FrameType::Response, id, serde_json::json!({ "status": "queued", "position": position }));
                    if let Ok(json) = serde_json::to_string(&frame) {
                        replies.push(json);
                    }
                }
                Ok(PromptOutcome::Rejected) => {
                    let frame = WsFrame::error(id, "SESSION_BUSY", "session is busy");
                    if let Ok(json) = serde_json::to_string(&frame) {
                        replies.push(json);
                    }
                }
                Err(e) => {
                    let frame = WsFrame::error(id, e.error_code(), e.to_string());
                    if let Ok(json) = serde_json::to_string(&frame) {
                        replies.push(json);
                    }
                }
            }
        }
        ClientAction::Cancel => {
            match state.manager.cancel(&session_id, request.force).await {
                Ok(()) => {
                    let frame = WsFrame::new(FrameType::Response, id, serde_json::json!({ "status": "cancelled" }));
                    if let Ok(json) = serde_json::to_string(&frame) {
                        replies.push(json);
                    }
                }
                Err(e) => {
                    let frame = WsFrame::error(id, e.error_code(), e.to_string());
                    if let Ok(json) = serde_json::to_string(&frame) {
                        replies.push(json);
                    }
                }
            }
        }
    }

    replies
}
