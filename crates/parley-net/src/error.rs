use thiserror::Error;

/// Errors produced by the networking layer.
#[derive(Error, Debug)]
pub enum NetError {
    /// HTTP transport or decoding error from the REST client.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status from the REST API.
    #[error("HTTP status {0}")]
    Status(u16),

    /// WebSocket transport failure (dial, handshake, or I/O).
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Publish attempted without an active connection and the single
    /// reconnect pass did not produce one.
    #[error("WebSocket not connected")]
    NotConnected,

    /// Malformed JSON payload.
    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for NetError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        NetError::WebSocket(e.to_string())
    }
}
