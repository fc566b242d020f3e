//! WebSocket transport for the push channel.
//!
//! One socket per client. Outbound events flow through an unbounded channel
//! so the dispatcher and announcer never block on a slow socket; a dedicated
//! task drains it into the sink. Inbound frames are JSON [`ClientEvent`]s;
//! malformed payloads get an `error` event rather than a disconnect.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatcher::PushDispatcher;
use super::events::{ClientEvent, ServerEvent};

/// GET /ws (WebSocket upgrade)
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Arc<PushDispatcher>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, dispatcher))
}

async fn handle_socket(socket: WebSocket, dispatcher: Arc<PushDispatcher>) {
    let socket_id = Uuid::new_v4().to_string();
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    debug!(socket_id = %socket_id, "Push socket opened");

    // Drain outbound events into the socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to encode server event");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Which participant this socket registered as, once known.
    let mut registered: Option<String> = None;

    loop {
        tokio::select! {
            inbound = ws_stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                dispatcher
                                    .handle_event(&socket_id, &mut registered, event, &tx)
                                    .await;
                            }
                            Err(e) => {
                                warn!(socket_id = %socket_id, error = %e, "Malformed client event");
                                let _ = tx.send(ServerEvent::Error {
                                    message: format!("malformed event payload: {e}"),
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_))) => {
                        // Pong is handled by axum; count it as liveness.
                        if let Some(participant_id) = registered.as_deref() {
                            dispatcher.sessions().touch(participant_id);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(socket_id = %socket_id, error = %e, "Socket read error");
                        break;
                    }
                }
            }
            _ = &mut send_task => break,
        }
    }

    send_task.abort();

    if let Some(participant_id) = registered {
        dispatcher
            .handle_socket_closed(&participant_id, &socket_id)
            .await;
    }
    info!(socket_id = %socket_id, "Push socket closed");
}
