use std::{borrow::Cow, sync::Arc};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header::ORIGIN, HeaderMap},
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use session_log::ContextSource;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    state::AppState,
    terminal::{TerminalClientMessage, TerminalServerMessage},
};

/// `GET /api/terminal/ws`: WebSocket upgrade with the same origin check
/// as CORS. Disallowed origins are closed with policy code 1008.
pub async fn terminal_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
) -> impl IntoResponse {
    let origin_ok = match headers.get(ORIGIN).and_then(|value| value.to_str().ok()) {
        Some(origin) => state.config.origin_allowed(origin),
        // Non-browser clients (no Origin header) are local tools.
        None => true,
    };
    ws.on_upgrade(move |socket| handle_socket(state, socket, origin_ok))
}

async fn handle_socket(state: AppState, socket: WebSocket, origin_ok: bool) {
    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    if !origin_ok {
        let _ = sender
            .lock()
            .await
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: Cow::from("origin not allowed"),
            })))
            .await;
        return;
    }

    // A client binds to at most one session at a time.
    let mut bound: Option<(String, u64)> = None;
    let mut forward: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!("terminal ws receive error: {err}");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let parsed = match serde_json::from_str::<TerminalClientMessage>(&text) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        send_error(&sender, format!("malformed message: {err}"), None).await;
                        continue;
                    }
                };
                match parsed {
                    TerminalClientMessage::Open { thread_id, cwd } => {
                        detach(&state, &mut bound, &mut forward).await;

                        let (cwd, source, is_fallback) = match cwd {
                            Some(cwd) => (cwd, "explicit".to_string(), false),
                            None => {
                                let projected = state
                                    .store
                                    .get_thread(&thread_id)
                                    .await
                                    .ok()
                                    .flatten()
                                    .map(|row| row.project_key);
                                let resolved = state
                                    .resolver
                                    .resolve(&thread_id, projected.as_deref())
                                    .await;
                                let is_fallback = resolved.source == ContextSource::Fallback;
                                (
                                    resolved.cwd.to_string_lossy().to_string(),
                                    context_source_label(resolved.source).to_string(),
                                    is_fallback,
                                )
                            }
                        };

                        match state.terminals.open(&thread_id, cwd, source, is_fallback).await {
                            Ok((client_id, mut rx)) => {
                                let sender = sender.clone();
                                forward = Some(tokio::spawn(async move {
                                    while let Some(server_message) = rx.recv().await {
                                        let Ok(text) = serde_json::to_string(&server_message)
                                        else {
                                            continue;
                                        };
                                        if sender
                                            .lock()
                                            .await
                                            .send(Message::Text(text))
                                            .await
                                            .is_err()
                                        {
                                            break;
                                        }
                                    }
                                }));
                                bound = Some((thread_id, client_id));
                            }
                            Err(message) => {
                                send_error(&sender, message, Some("TERMINAL_OPEN_FAILED")).await;
                            }
                        }
                    }
                    TerminalClientMessage::Input { data } => {
                        if let Some((thread_id, _)) = &bound {
                            if let Err(message) = state.terminals.input(thread_id, data).await {
                                send_error(&sender, message, None).await;
                            }
                        }
                    }
                    TerminalClientMessage::Resize { cols, rows } => {
                        if let Some((thread_id, _)) = &bound {
                            if let Err(message) =
                                state.terminals.resize(thread_id, cols, rows).await
                            {
                                send_error(&sender, message, None).await;
                            }
                        }
                    }
                    TerminalClientMessage::SetCwd { cwd } => {
                        if let Some((thread_id, _)) = &bound {
                            // The user picked a new cwd; drop the cached
                            // context so the next resolve re-reads it.
                            state.resolver.invalidate(thread_id).await;
                            if let Err(message) = state.terminals.set_cwd(thread_id, cwd).await {
                                send_error(&sender, message, None).await;
                            }
                        }
                    }
                    TerminalClientMessage::Close => {
                        detach(&state, &mut bound, &mut forward).await;
                    }
                }
            }
            Message::Binary(_) => {
                send_error(
                    &sender,
                    "binary frames are not supported".to_string(),
                    Some("TERMINAL_WS_BINARY_UNSUPPORTED"),
                )
                .await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    detach(&state, &mut bound, &mut forward).await;
}

async fn detach(
    state: &AppState,
    bound: &mut Option<(String, u64)>,
    forward: &mut Option<tokio::task::JoinHandle<()>>,
) {
    if let Some((thread_id, client_id)) = bound.take() {
        state.terminals.detach(&thread_id, client_id).await;
    }
    if let Some(task) = forward.take() {
        task.abort();
    }
}

async fn send_error(
    sender: &Arc<Mutex<futures_util::stream::SplitSink<WebSocket, Message>>>,
    message: String,
    code: Option<&str>,
) {
    let payload = TerminalServerMessage::Error {
        message,
        code: code.map(|code| code.to_string()),
    };
    if let Ok(text) = serde_json::to_string(&payload) {
        let _ = sender.lock().await.send(Message::Text(text)).await;
    }
}

fn context_source_label(source: ContextSource) -> &'static str {
    match source {
        ContextSource::SessionMeta => "sessionMeta",
        ContextSource::TurnContext => "turnContext",
        ContextSource::Projection => "projection",
        ContextSource::Fallback => "fallback",
    }
}
