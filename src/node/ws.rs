use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::auth;
use crate::config::PING_INTERVAL;
use crate::events::{
    self, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION, ClientFrame,
    PresenceAction, REASON_DUPLICATE_SESSION, REASON_INTERNAL_ERROR, REASON_NOT_OWNED,
    ServerFrame,
};
use crate::node::state::{NodeState, Outbound};

#[derive(Deserialize)]
pub(crate) struct SessionQuery {
    token: Option<String>,
}

/// GET /ws: WebSocket upgrade for a client presence session.
pub(crate) async fn session_ws(
    State(state): State<Arc<NodeState>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state, headers, query.token))
}

async fn handle_session(
    socket: WebSocket,
    state: Arc<NodeState>,
    headers: HeaderMap,
    query_token: Option<String>,
) {
    // Authenticate and check ownership before any state mutation.
    let Some(token) = auth::extract_token(&headers, query_token.as_deref()) else {
        close_with(socket, CLOSE_POLICY_VIOLATION, events::REASON_NO_TOKEN).await;
        return;
    };
    let claims = match auth::validate_token(&token, &state.jwt_secret) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!(error = %e, "rejecting session: invalid token");
            close_with(socket, CLOSE_POLICY_VIOLATION, e.close_reason()).await;
            return;
        }
    };
    let user_id = claims.user_id;

    let Some(vnode) = state.owns_user(&user_id) else {
        tracing::warn!(
            user_id = %user_id,
            "rejecting session: user's vnode is not assigned to this node"
        );
        close_with(socket, CLOSE_POLICY_VIOLATION, REASON_NOT_OWNED).await;
        return;
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let (connection_id, displaced) = state.register_session(&user_id, tx.clone()).await;
    if let Some(previous) = displaced {
        tracing::info!(user_id = %user_id, "displacing previous session");
        let _ = previous.tx.send(Outbound::Close {
            code: CLOSE_GOING_AWAY,
            reason: REASON_DUPLICATE_SESSION,
        });
    }

    tracing::info!(user_id = %user_id, vnode, connection_id, "session established");
    state.publish_presence(&user_id, PresenceAction::Online).await;

    let _ = tx.send(Outbound::Frame(ServerFrame::Welcome {
        user_id: user_id.clone(),
        node_id: state.node_id.clone(),
        timestamp: events::now_ms(),
    }));

    let (ws_sink, mut ws_stream) = socket.split();
    let writer = tokio::spawn(write_loop(ws_sink, rx));

    // Receive loop. Transport-level ping/pong is handled by the websocket
    // layer; this only decodes application frames.
    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(ClientFrame::Ping { .. }) => {
                    let _ = tx.send(Outbound::Frame(ServerFrame::Pong {
                        timestamp: events::now_ms(),
                    }));
                }
                Ok(ClientFrame::Unknown) => {
                    tracing::debug!(user_id = %user_id, "ignoring unrecognized frame type");
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "ignoring malformed frame");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    if state.unregister_session(&user_id, connection_id).await {
        state
            .publish_presence(&user_id, PresenceAction::Offline)
            .await;
        tracing::info!(user_id = %user_id, connection_id, "session closed");
    }
    writer.abort();
}

/// Writer half of a session: forwards queued frames, closes on command, and
/// keeps the connection alive with a server ping every `PING_INTERVAL`.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Frame(frame)) => match serde_json::to_string(&frame) {
                    Ok(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode outbound frame");
                        let _ = sink
                            .send(close_message(CLOSE_INTERNAL_ERROR, REASON_INTERNAL_ERROR))
                            .await;
                        break;
                    }
                },
                Some(Outbound::Close { code, reason }) => {
                    let _ = sink.send(close_message(code, reason)).await;
                    break;
                }
                None => break,
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Reject a connection that never became a session.
async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket.send(close_message(code, reason)).await;
}
