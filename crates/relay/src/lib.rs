use chrono::{DateTime, Utc};
use thiserror::Error;

use shared::{
    domain::{ConnectionId, MessageId, UserId},
    protocol::{ChatPayload, DeliveredMessage, MessageAck, ServerEvent},
};
use storage::{ChatStore, StoredChat};

pub mod registry;

pub use registry::MembershipRegistry;

/// Handle threaded through every connection session and HTTP handler.
/// Cheap to clone; the store is a pool handle and the registry is
/// reference-counted.
#[derive(Clone)]
pub struct RelayContext {
    pub store: ChatStore,
    pub registry: MembershipRegistry,
}

#[derive(Debug, Error)]
pub enum RelayError {
    /// Persistence, delete, or list failure. Non-fatal to the connection:
    /// the session logs it and keeps processing events.
    #[error("message store failure: {0}")]
    Store(#[from] anyhow::Error),
}

/// A message accepted from a connection but not yet persisted. Carries the
/// server-assigned timestamp both outbound views derive from.
#[derive(Debug, Clone)]
pub struct DraftMessage {
    pub sender: UserId,
    pub receiver: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl DraftMessage {
    /// Ack payload for the originating connection. `date` is the clock
    /// label of the moment the relay accepted the message.
    pub fn ack(&self) -> MessageAck {
        MessageAck {
            receiver: self.receiver.clone(),
            message: self.body.clone(),
            sender: self.sender.clone(),
            date: self.sent_at.format("%H:%M").to_string(),
        }
    }

    fn delivered(&self) -> DeliveredMessage {
        DeliveredMessage {
            receiver: self.receiver.clone(),
            message: self.body.clone(),
            sender: self.sender.clone(),
            date: self.sent_at,
        }
    }
}

/// Step one of the send path: construct the message with a server-assigned
/// timestamp. The caller acks the origin with `draft.ack()` before awaiting
/// [`commit_message`].
pub fn compose_message(sender: &UserId, receiver: UserId, body: String) -> DraftMessage {
    DraftMessage {
        sender: sender.clone(),
        receiver,
        body,
        sent_at: Utc::now(),
    }
}

/// Steps two and three of the send path: persist, then fan out to the
/// receiver's group. Nothing is broadcast unless the store accepted the
/// row. The origin connection is excluded from the fan-out (it already
/// holds the ack), and the sender's other devices are deliberately not
/// notified: only the receiver side sees the delivery.
pub async fn commit_message(
    ctx: &RelayContext,
    origin: ConnectionId,
    draft: &DraftMessage,
) -> Result<MessageId, RelayError> {
    let stored = ctx
        .store
        .insert_chat(&draft.sender, &draft.receiver, &draft.body, draft.sent_at)
        .await?;
    ctx.registry
        .broadcast_excluding(
            &draft.receiver,
            origin,
            &ServerEvent::MessageDelivered(draft.delivered()),
        )
        .await;
    Ok(stored.chat_id)
}

/// Delete one stored message, then push the re-fetched full conversation
/// to every connection on both sides (full-list replacement). All or
/// nothing: a store failure pushes nothing. Deleting an id that is already
/// gone still refreshes both sides.
pub async fn delete_message(
    ctx: &RelayContext,
    sender: &UserId,
    receiver: &UserId,
    chat_id: MessageId,
) -> Result<(), RelayError> {
    ctx.store.delete_chat(chat_id).await?;
    let history = ctx.store.list_between(sender, receiver).await?;
    let refreshed =
        ServerEvent::ConversationRefreshed(history.into_iter().map(chat_payload).collect());

    ctx.registry.broadcast_to(sender, &refreshed).await;
    if receiver != sender {
        ctx.registry.broadcast_to(receiver, &refreshed).await;
    }
    Ok(())
}

/// Wire rendering of one persisted row.
pub fn chat_payload(chat: StoredChat) -> ChatPayload {
    ChatPayload {
        chat_id: chat.chat_id,
        sender: chat.sender,
        receiver: chat.receiver,
        message: chat.body,
        date: chat.sent_at,
    }
}
