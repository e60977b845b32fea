// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! WebSocket endpoint for the terminal gateway.
//!
//! A single well-known path, parameterized by query: bearer token,
//! workspace id, and optionally a session id for reattach. Each accepted
//! connection runs two pump directions inside one select loop; a panic or
//! error in either direction tears down that connection only.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::terminal_gateway::{OpenedSession, TerminalGateway, KEEPALIVE_SECS};
use crate::domain::session::{SessionId, TerminalSize};
use crate::domain::workspace::WorkspaceId;
use crate::infrastructure::runtime::strip_stream_frame;
use crate::presentation::protocol::{close_code, close_code_for, Frame};

#[derive(Clone)]
pub struct GatewayState {
    pub gateway: Arc<TerminalGateway>,
}

pub fn router(gateway: Arc<TerminalGateway>) -> Router {
    Router::new()
        .route("/terminal", get(terminal_handler))
        .with_state(GatewayState { gateway })
}

#[derive(Debug, Deserialize)]
pub struct TerminalParams {
    token: Option<String>,
    #[serde(rename = "workspaceId")]
    workspace_id: Option<Uuid>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
}

async fn terminal_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Query(params): Query<TerminalParams>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(state, socket, params))
}

/// How the connection ended, deciding the session's next status.
enum EndReason {
    /// Client socket closed or errored; the session survives.
    ClientGone,
    /// The attach stream ended: multiplexer exit or container stop.
    StreamEnded,
    /// Another connection took the session over.
    Kicked,
}

async fn handle_connection(state: GatewayState, mut socket: WebSocket, params: TerminalParams) {
    let (Some(token), Some(workspace_id)) = (params.token.as_deref(), params.workspace_id) else {
        close(
            &mut socket,
            close_code::MISSING_PARAMS,
            "token and workspaceId are required",
        )
        .await;
        return;
    };
    let workspace_id = WorkspaceId(workspace_id);

    let user_id = match state.gateway.authenticate(token).await {
        Ok(user_id) => user_id,
        Err(e) => {
            let _ = socket
                .send(Message::Text(Frame::Error { error: e.to_string() }.to_json()))
                .await;
            close(&mut socket, close_code::AUTH_FAILED, "authentication failed").await;
            return;
        }
    };

    let size = TerminalSize {
        cols: params.cols.unwrap_or(80),
        rows: params.rows.unwrap_or(24),
    };
    let session_id = params.session_id.map(SessionId::from_string);

    let opened = match state
        .gateway
        .open_session(&user_id, workspace_id, session_id, size)
        .await
    {
        Ok(opened) => opened,
        Err(e) => {
            warn!(workspace_id = %workspace_id, error = %e, "Session setup failed");
            let _ = socket
                .send(Message::Text(Frame::Error { error: e.to_string() }.to_json()))
                .await;
            close(&mut socket, close_code_for(&e), "session setup failed").await;
            return;
        }
    };

    run_session(state, socket, opened).await;
}

async fn run_session(state: GatewayState, socket: WebSocket, opened: OpenedSession) {
    let OpenedSession {
        session,
        replay,
        stream,
        connection_id,
        mut kick,
    } = opened;
    let session_id = session.id.clone();
    let mut stream_input = stream.input;
    let mut stream_output = stream.output;

    let (mut sink, mut source) = socket.split();

    // Replay prefix first on reattach, then the ready mark; output frames
    // may arrive after it.
    if let Some(replay) = replay {
        if sink
            .send(Message::Text(Frame::Reconnect { data: replay }.to_json()))
            .await
            .is_err()
        {
            let _ = state
                .gateway
                .mark_disconnected(&session_id, connection_id)
                .await;
            return;
        }
    }
    if sink
        .send(Message::Text(
            Frame::Ready {
                session_id: session_id.to_string(),
            }
            .to_json(),
        ))
        .await
        .is_err()
    {
        let _ = state
            .gateway
            .mark_disconnected(&session_id, connection_id)
            .await;
        return;
    }

    let mut keepalive = tokio::time::interval(Duration::from_secs(KEEPALIVE_SECS));
    keepalive.tick().await; // first tick completes immediately
    let mut pong_received = true;

    let end_reason = loop {
        tokio::select! {
            // Client -> container.
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match Frame::parse(&text) {
                            Ok(Frame::Input { data }) => {
                                if stream_input.write_all(data.as_bytes()).await.is_err()
                                    || stream_input.flush().await.is_err()
                                {
                                    break EndReason::StreamEnded;
                                }
                                state.gateway.touch(&session_id).await;
                            }
                            Ok(Frame::Resize { cols, rows }) => {
                                state
                                    .gateway
                                    .resize(&session_id, TerminalSize { cols, rows })
                                    .await;
                            }
                            Ok(Frame::Ping) => {
                                if sink
                                    .send(Message::Text(Frame::Pong.to_json()))
                                    .await
                                    .is_err()
                                {
                                    break EndReason::ClientGone;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                debug!(session_id = %session_id, error = %e, "Dropping malformed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break EndReason::ClientGone;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_received = true;
                    }
                    Some(Ok(Message::Close(_))) | None => break EndReason::ClientGone,
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(_)) => break EndReason::ClientGone,
                }
            }

            // Container -> client.
            chunk = stream_output.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        let payload = strip_stream_frame(&bytes);
                        let text = String::from_utf8_lossy(payload).into_owned();
                        if sink
                            .send(Message::Text(Frame::Output { data: text.clone() }.to_json()))
                            .await
                            .is_err()
                        {
                            break EndReason::ClientGone;
                        }
                        if let Err(e) = state.gateway.append_output(&session_id, &text).await {
                            debug!(session_id = %session_id, error = %e, "Replay buffer append failed");
                        }
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "Attach stream error");
                        break EndReason::StreamEnded;
                    }
                    None => break EndReason::StreamEnded,
                }
            }

            // Transport keepalive: close if the previous ping went
            // unanswered, otherwise ping again.
            _ = keepalive.tick() => {
                if !pong_received {
                    info!(session_id = %session_id, "Keepalive lapsed, closing connection");
                    break EndReason::ClientGone;
                }
                pong_received = false;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break EndReason::ClientGone;
                }
            }

            // Another connection took the session over.
            _ = kick.recv() => break EndReason::Kicked,
        }
    };

    match end_reason {
        EndReason::ClientGone | EndReason::Kicked => {
            // The attach stream is dropped here; the multiplexer session
            // inside the container stays alive for reattach.
            if let Err(e) = state
                .gateway
                .mark_disconnected(&session_id, connection_id)
                .await
            {
                warn!(session_id = %session_id, error = %e, "Disconnect bookkeeping failed");
            }
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: "disconnected".into(),
                })))
                .await;
        }
        EndReason::StreamEnded => {
            if let Err(e) = state
                .gateway
                .mark_terminated(&session_id, connection_id)
                .await
            {
                warn!(session_id = %session_id, error = %e, "Termination bookkeeping failed");
            }
            let _ = sink
                .send(Message::Text(
                    Frame::Error {
                        error: "session ended".to_string(),
                    }
                    .to_json(),
                ))
                .await;
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: "session ended".into(),
                })))
                .await;
        }
    }

    debug!(session_id = %session_id, "Connection closed");
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
