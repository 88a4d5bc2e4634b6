use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One row of the local user's conversation list.
///
/// Created when the chat list is fetched or a chat is started; mutated
/// in place whenever a message for that chat arrives. Never deleted by
/// the client (the server owns deletion/archival).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPreview {
    pub chat_id: i64,
    pub receiver_username: String,
    #[serde(default)]
    pub last_message_sender: String,
    #[serde(default)]
    pub last_message_content: String,
    #[serde(default)]
    pub last_message_sent_date: String,
}

/// Message as it appears on the wire: REST history pages and inbound
/// live frames share this shape. `id` is server-assigned and may be
/// absent on older deployments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub chat_id: i64,
    pub message: String,
    #[serde(default)]
    pub sender: String,
    pub sent_date: String,
}

impl RawMessage {
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            chat_id: self.chat_id,
            sender: self.sender,
            message: self.message,
            timestamp: self.sent_date,
        }
    }
}

/// A chat message as cached and displayed.
///
/// Within a chat's cached history messages are unique by [`Message::order_key`];
/// display order is ascending by timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub chat_id: i64,
    pub sender: String,
    pub message: String,
    pub timestamp: String,
}

impl Message {
    /// Build an optimistic local message, stamped with the current time.
    /// The server-assigned id arrives later with the echoed copy.
    pub fn outgoing(chat_id: i64, sender: &str, body: &str) -> Self {
        Self {
            id: None,
            chat_id,
            sender: sender.to_string(),
            message: body.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Monotonic ordering key.
    ///
    /// The server-assigned id wins when present. Otherwise the key is
    /// derived from the timestamp string: truncate at the first `.`,
    /// strip every non-digit, parse the rest. Two messages landing in
    /// the same second collide under the fallback, which can cost one
    /// page of over- or under-fetch during reconciliation.
    pub fn order_key(&self) -> i64 {
        self.id.unwrap_or_else(|| derived_ts_id(&self.timestamp))
    }
}

/// Timestamp-derived ordering proxy used when no server id is present.
pub fn derived_ts_id(timestamp: &str) -> i64 {
    let head = timestamp.split('.').next().unwrap_or_default();
    let digits: String = head.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// Envelope of `GET /chats/my-chats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatsResponse {
    pub content: Vec<ChatPreview>,
}

/// Envelope of one history page, `GET /chats/{chatId}/messages`.
/// Page 0 is the newest slice; content within a page is newest-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesPage {
    pub content: Vec<RawMessage>,
    pub last: bool,
}

/// Envelope of `GET /users/following`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowingResponse {
    pub content: Vec<String>,
}

/// Envelope of `POST /chats/start/{username}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartChatResponse {
    pub chat_id: i64,
}
