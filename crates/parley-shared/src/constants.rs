use std::time::Duration;

/// How long a chat's cached history stays fresh before the next open
/// triggers a reconciliation pass.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Number of messages requested per history page.
pub const PAGE_SIZE: u32 = 100;

/// Window within which a server echo of a just-sent message replaces
/// the optimistic local copy instead of appending a duplicate.
pub const ECHO_WINDOW: Duration = Duration::from_secs(10);

/// Inbound queue every client subscribes to after connecting.
pub const INBOUND_QUEUE: &str = "/user/queue/messages";

/// Outbound publish destination for a chat.
pub fn chat_destination(chat_id: i64) -> String {
    format!("/app/chat/{chat_id}/message")
}

/// Default number of transport dial attempts per connect pass.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 3;

/// Base delay between dial attempts; doubles after each failure.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(250);
