//! WebSocket handlers for real-time change event notifications

use super::handlers::{AppError, PubSubState, ServerState};
use crate::auth::Credential;
use crate::events::{
    parse_endpoint_filter, AuthNotice, ChannelSink, ClientMessage, ConnectionId, ServerMessage,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Query parameters for filtering WebSocket events
#[derive(Debug, Deserialize, Default)]
pub struct WsQuery {
    /// Comma-separated endpoint prefixes to subscribe to (e.g. "/rooms,/accounts")
    pub endpoints: Option<String>,
}

/// WebSocket upgrade handler for `/ws`
pub async fn ws_events(
    ws: WebSocketUpgrade,
    State(state): State<PubSubState>,
    Query(query): Query<WsQuery>,
) -> Result<Response, AppError> {
    if state.shutdown.is_cancelled() {
        return Err(AppError::ServiceUnavailable(
            "server is shutting down".to_string(),
        ));
    }

    let endpoint_filter = query
        .endpoints
        .as_deref()
        .and_then(|endpoints| parse_endpoint_filter([endpoints]));
    let tracker = state.connections.clone();

    Ok(ws.on_upgrade(move |socket| tracker.track_future(handle_ws(socket, state, endpoint_filter))))
}

/// Outcome of handling one client message
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reply {
    Send(ServerMessage),
    /// Send, then close the connection
    Close(ServerMessage),
}

/// Handle a single text frame from a client
pub(crate) async fn handle_client_message(
    state: &ServerState,
    connection_id: ConnectionId,
    text: &str,
) -> Reply {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(connection_id = %connection_id, "Unrecognized client message: {}", e);
            return Reply::Send(ServerMessage::Error {
                message: "unrecognized message".to_string(),
            });
        }
    };

    match message {
        ClientMessage::Ping => Reply::Send(ServerMessage::Pong {
            timestamp: state.publisher.pong_timestamp(),
        }),
        ClientMessage::Subscribe { endpoints } => {
            let filter = parse_endpoint_filter(&endpoints);
            let mut listed: Vec<String> = filter.iter().flatten().cloned().collect();
            listed.sort();
            match state.registry.set_subscriptions(connection_id, filter).await {
                Ok(()) => Reply::Send(ServerMessage::Subscribed { endpoints: listed }),
                Err(e) => {
                    warn!(connection_id = %connection_id, "Subscribe failed: {}", e);
                    Reply::Send(ServerMessage::Error {
                        message: "subscription failed".to_string(),
                    })
                }
            }
        }
        ClientMessage::Authentication(credential) => {
            authenticate(state, connection_id, credential).await
        }
    }
}

/// Run the auth handshake for one connection.
///
/// The client only ever learns accept/reject; rejected clients are disconnected.
async fn authenticate(
    state: &ServerState,
    connection_id: ConnectionId,
    credential: Credential,
) -> Reply {
    let accepted = ServerMessage::Authenticated { success: true };
    let rejected = ServerMessage::Authenticated { success: false };

    let Some(gate) = &state.auth_gate else {
        return Reply::Send(accepted);
    };

    if let Some(connection) = state.registry.get(connection_id).await {
        if connection.is_authenticated() {
            return Reply::Send(accepted);
        }
    }

    if gate.verify(&credential).await.is_err() {
        debug!(connection_id = %connection_id, "WS auth: credential rejected");
        return Reply::Close(rejected);
    }

    match state
        .registry
        .mark_authenticated(connection_id, Some(credential.user_id.clone()))
        .await
    {
        Ok(true) => {
            info!(
                connection_id = %connection_id,
                user_id = %credential.user_id,
                "A user has been authenticated over web sockets"
            );
            state
                .auth_bus
                .notify(AuthNotice::new(connection_id, credential.user_id));
            Reply::Send(accepted)
        }
        Ok(false) => Reply::Send(accepted),
        Err(e) => {
            warn!(connection_id = %connection_id, "WS auth: {}", e);
            Reply::Close(rejected)
        }
    }
}

/// Upper bound on the Close frame write when tearing a connection down
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Serialize and send a ServerMessage
async fn send_message<S>(sender: &mut S, message: &ServerMessage) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let json = serde_json::to_string(message).map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await
}

/// Drive a socket write unless shutdown begins first. Returns false when
/// the connection should stop.
async fn write_until_shutdown<F>(shutdown: &CancellationToken, write: F) -> bool
where
    F: Future<Output = Result<(), axum::Error>>,
{
    tokio::select! {
        result = write => result.is_ok(),
        _ = shutdown.cancelled() => false,
    }
}

/// Handle an individual WebSocket connection
async fn handle_ws(
    socket: WebSocket,
    state: PubSubState,
    endpoint_filter: Option<HashSet<String>>,
) {
    let connection_id = Uuid::new_v4();
    let (sink, mut outbound) = ChannelSink::new(state.session.channel_capacity);

    if let Err(e) = state.registry.register(connection_id, Arc::new(sink)).await {
        warn!("WS events: {}", e);
        return;
    }
    if endpoint_filter.is_some() {
        if let Err(e) = state
            .registry
            .set_subscriptions(connection_id, endpoint_filter)
            .await
        {
            warn!("WS events: {}", e);
        }
    }

    let mut awaiting_auth = state.auth_enabled();
    if !awaiting_auth {
        if let Err(e) = state.registry.mark_authenticated(connection_id, None).await {
            warn!("WS events: {}", e);
        }
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let shutdown = &state.shutdown;

    let auth_deadline = tokio::time::sleep(state.session.auth_timeout);
    tokio::pin!(auth_deadline);

    let mut ping_interval = interval(state.session.ping_interval);
    // Skip the first immediate tick
    ping_interval.tick().await;

    debug!(
        connection_id = %connection_id,
        awaiting_auth,
        "WebSocket events client connected"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(connection_id = %connection_id, "Server shutting down, closing WebSocket");
                break;
            }

            _ = &mut auth_deadline, if awaiting_auth => {
                debug!(connection_id = %connection_id, "WebSocket client did not authenticate in time");
                let rejected = ServerMessage::Authenticated { success: false };
                write_until_shutdown(shutdown, send_message(&mut ws_sender, &rejected)).await;
                break;
            }

            // Forward published events to the client
            Some(message) = outbound.recv() => {
                if !write_until_shutdown(shutdown, send_message(&mut ws_sender, &message)).await {
                    debug!(connection_id = %connection_id, "WebSocket send interrupted, closing");
                    break;
                }
            }

            // Send periodic pings to detect dead clients
            _ = ping_interval.tick() => {
                if !write_until_shutdown(shutdown, ws_sender.send(Message::Ping(vec![].into()))).await {
                    debug!("Ping failed, client disconnected");
                    break;
                }
            }

            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let handled = tokio::select! {
                            reply = handle_client_message(&state, connection_id, text.as_str()) => reply,
                            _ = shutdown.cancelled() => {
                                debug!(connection_id = %connection_id, "Server shutting down mid-request");
                                break;
                            }
                        };
                        let (reply, close) = match handled {
                            Reply::Send(reply) => (reply, false),
                            Reply::Close(reply) => (reply, true),
                        };
                        if matches!(reply, ServerMessage::Authenticated { success: true }) {
                            awaiting_auth = false;
                        }
                        if !write_until_shutdown(shutdown, send_message(&mut ws_sender, &reply)).await {
                            debug!("WebSocket send failed, client disconnected");
                            break;
                        }
                        if close {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {
                        // Pong and binary frames carry nothing for us
                    }
                }
            }
        }
    }

    // Best effort: the peer may already be gone or not reading
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws_sender.send(Message::Close(None))).await;
    state.registry.unregister(connection_id).await;
    debug!(connection_id = %connection_id, "WebSocket connection closed");
}
