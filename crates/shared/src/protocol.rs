use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, UserId};

/// Events a client may send over an admitted connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Route a message to every live connection of `receiver`.
    #[serde(rename = "private-msg")]
    PrivateMsg { receiver: UserId, msg: String },
    /// Remove one stored message and resync the conversation on both sides.
    #[serde(rename = "delete-message")]
    DeleteMessage {
        sender: UserId,
        receiver: UserId,
        #[serde(rename = "chatId")]
        chat_id: MessageId,
    },
}

/// Ack returned to the connection that sent a `private-msg`. `date` is the
/// wall-clock label assigned when the relay accepted the message, not the
/// persisted timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAck {
    pub receiver: UserId,
    pub message: String,
    pub sender: UserId,
    pub date: String,
}

/// Live delivery pushed to every connection in the receiver's group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveredMessage {
    pub receiver: UserId,
    pub message: String,
    pub sender: UserId,
    pub date: DateTime<Utc>,
}

/// One persisted conversation entry as rendered on the wire and by the
/// HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    #[serde(rename = "chatId")]
    pub chat_id: MessageId,
    pub sender: UserId,
    pub receiver: UserId,
    pub message: String,
    pub date: DateTime<Utc>,
}

/// Events pushed to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Response to `private-msg`, delivered only to the originating
    /// connection.
    #[serde(rename = "private-msg-ack")]
    MessageAccepted(MessageAck),
    /// Fan-out of a persisted message to the receiver's group.
    #[serde(rename = "private-msg-BE")]
    MessageDelivered(DeliveredMessage),
    /// Full-list conversation replacement after a delete.
    #[serde(rename = "send-message-response")]
    ConversationRefreshed(Vec<ChatPayload>),
}
