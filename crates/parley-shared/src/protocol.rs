use serde::{Deserialize, Serialize};

use crate::constants::{chat_destination, INBOUND_QUEUE};

/// Client-to-server frames sent over the multiplexed live connection.
///
/// The transport is a single WebSocket; framing follows the server's
/// STOMP-like convention of a typed command plus a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "UPPERCASE")]
pub enum ClientFrame {
    /// Handshake frame. The bearer credential is absent on cookie-based
    /// deployments, where the session rides on the upgrade request.
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Subscribe to an inbound destination.
    Subscribe { destination: String },

    /// Publish a message body to a chat destination.
    Send { destination: String, body: String },
}

impl ClientFrame {
    /// CONNECT frame carrying an optional bearer credential.
    pub fn connect(token: Option<String>) -> Self {
        ClientFrame::Connect { token }
    }

    /// SUBSCRIBE frame for the single per-user inbound queue.
    pub fn subscribe_inbound() -> Self {
        ClientFrame::Subscribe {
            destination: INBOUND_QUEUE.to_string(),
        }
    }

    /// SEND frame publishing raw message text to a chat.
    pub fn send_to_chat(chat_id: i64, body: &str) -> Self {
        ClientFrame::Send {
            destination: chat_destination(chat_id),
            body: body.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // The enum has no map keys that can fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}
