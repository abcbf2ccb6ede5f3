//! WebSocket transport.
//!
//! `GET /ws` authenticates the handshake, then runs one task per
//! connection. The reader half dispatches frames in arrival order; a writer
//! task drains the connection's outbound queue into text frames.

use crate::dispatch::ConnectionContext;
use crate::errors::HubError;
use crate::protocol::{outbound, OutboundEvent};
use crate::routes::AppState;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::types::Identity;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long the writer may take to flush after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Browser clients cannot set headers on upgrade requests.
    #[serde(default)]
    pub token: Option<String>,
}

/// Upgrade handler for `GET /ws`.
///
/// Refuses with 401 when the handshake fails authentication and with 503
/// once shutdown has started.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.shutdown.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let identity = match state
        .gatekeeper
        .authenticate(&headers, params.token.as_deref())
    {
        Ok(identity) => identity,
        Err(e) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "code": e.error_code(), "message": e.client_message() })),
            )
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: Option<Identity>) {
    let (connection_id, mut outbound_rx) = state.channels.register(identity.clone()).await;
    let mut ctx = ConnectionContext::new(connection_id, identity);

    info!(
        target: "hub.ws",
        connection_id = %connection_id,
        user_id = ctx.identity.as_ref().map(|i| i.user_id.as_str()).unwrap_or("anonymous"),
        "Connection opened"
    );

    let (mut sink, mut stream) = socket.split();

    // Ends once the hub drops the connection's sender on unregister
    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            if sink.send(Message::Text(event.to_text())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let connected = match &ctx.identity {
        Some(identity) => json!({
            "connectionId": connection_id,
            "userId": identity.user_id,
            "role": identity.role,
        }),
        None => json!({ "connectionId": connection_id }),
    };
    state
        .channels
        .send_to_connection(connection_id, OutboundEvent::new(outbound::CONNECTED, connected))
        .await;

    loop {
        tokio::select! {
            () = state.shutdown.cancelled() => {
                debug!(target: "hub.ws", connection_id = %connection_id, "Closing for shutdown");
                break;
            }

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    state.dispatcher.dispatch(&mut ctx, &text).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    let err = HubError::Validation("Binary frames are not supported".to_string());
                    state
                        .channels
                        .send_to_connection(connection_id, OutboundEvent::error(&err))
                        .await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping and pong are answered by the transport
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(
                        target: "hub.ws",
                        connection_id = %connection_id,
                        error = %e,
                        "Transport error"
                    );
                    break;
                }
            },
        }
    }

    state.dispatcher.disconnect(&mut ctx).await;

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        warn!(
            target: "hub.ws",
            connection_id = %connection_id,
            "Writer did not drain in time, aborting"
        );
        writer.abort();
    }

    info!(target: "hub.ws", connection_id = %connection_id, "Connection closed");
}
