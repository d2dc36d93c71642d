use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use shared::{
    domain::{ConnectionId, UserId},
    protocol::{ClientEvent, ServerEvent},
};

use crate::{http::HttpError, AppState};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Admission gate. The credential travels in the handshake query string
/// and is verified before the upgrade is accepted, so a refused attempt
/// never allocates a session or touches the registry. Rejections share
/// the HTTP error shape: a 401 with a `{"message": ...}` body.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> Result<Response, HttpError> {
    let identity = state.verifier.verify(query.token.as_deref())?;
    Ok(ws.on_upgrade(move |socket| relay_session(state, socket, identity)))
}

/// One admitted connection: join the identity's group, dispatch inbound
/// events in arrival order until the transport closes, then leave. The
/// leave runs unconditionally, whether the peer closed cleanly or the
/// read side errored out.
async fn relay_session(state: Arc<AppState>, socket: WebSocket, identity: UserId) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let connection = ConnectionId::new();
    state
        .relay
        .registry
        .join(identity.clone(), connection, tx.clone())
        .await;
    info!(%connection, user = %identity, "device connected");

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let event = match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => event,
            Err(error) => {
                warn!(%connection, %error, "ignoring malformed client event");
                continue;
            }
        };
        dispatch_event(&state, &identity, connection, &tx, event).await;
    }

    state.relay.registry.leave(connection).await;
    writer.abort();
    info!(%connection, user = %identity, "device disconnected");
}

/// Flat per-event dispatch. A store failure is logged and the session
/// keeps running; it never tears the connection down.
async fn dispatch_event(
    state: &Arc<AppState>,
    identity: &UserId,
    connection: ConnectionId,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    event: ClientEvent,
) {
    match event {
        ClientEvent::PrivateMsg { receiver, msg } => {
            let draft = relay::compose_message(identity, receiver, msg);
            // The ack goes out before the store confirms. If the commit
            // below fails, the origin has already seen an ack for a
            // message nobody will ever receive; the failure is only
            // visible in the log.
            let _ = tx.send(ServerEvent::MessageAccepted(draft.ack()));
            if let Err(error) = relay::commit_message(&state.relay, connection, &draft).await {
                error!(%connection, %error, "failed to persist message");
            }
        }
        ClientEvent::DeleteMessage {
            sender,
            receiver,
            chat_id,
        } => {
            if let Err(error) =
                relay::delete_message(&state.relay, &sender, &receiver, chat_id).await
            {
                error!(%connection, %error, "failed to delete message");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
