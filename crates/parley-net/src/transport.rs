//! WebSocket transport behind object-safe traits.
//!
//! [`Connector`] dials and performs the CONNECT/SUBSCRIBE handshake;
//! [`Transport`] is the live framed connection. The production pair is
//! tokio-tungstenite based; tests substitute channel-backed fakes.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};

use parley_shared::ClientFrame;

use crate::credentials::CredentialProvider;
use crate::error::NetError;

/// Cloneable handle for pushing outbound text frames onto a transport.
#[derive(Clone)]
pub struct FrameSender(mpsc::UnboundedSender<String>);

impl FrameSender {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self(tx)
    }

    /// Queue one frame. Fails once the transport has gone away.
    pub fn send(&self, frame: String) -> Result<(), NetError> {
        self.0.send(frame).map_err(|_| NetError::NotConnected)
    }
}

/// An established, framed live connection. Dropping it tears the
/// connection down.
#[async_trait]
pub trait Transport: Send {
    /// Handle for outbound frames, usable independently of the read side.
    fn sender(&self) -> FrameSender;

    /// Next inbound text frame; `None` once the connection closed.
    async fn next_frame(&mut self) -> Option<String>;
}

/// Dials a transport. Consulted once per connect attempt so credential
/// refreshes are picked up naturally.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, NetError>;
}

/// tokio-tungstenite [`Connector`].
pub struct WsConnector {
    url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl WsConnector {
    /// `url` is the WebSocket endpoint, e.g. `wss://host/api/chat`.
    pub fn new(url: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            url: url.into(),
            credentials,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, NetError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(cookie) = self.credentials.cookie() {
            let value: HeaderValue = cookie
                .parse()
                .map_err(|_| NetError::WebSocket("invalid cookie header".into()))?;
            request.headers_mut().insert(COOKIE, value);
        }

        let (ws_stream, _) = connect_async(request).await?;
        debug!(url = %self.url, "websocket established");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx_out, mut rx_out) = mpsc::unbounded_channel::<String>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<String>();

        // Forward queued outbound frames onto the socket.
        let send_task = tokio::spawn(async move {
            while let Some(frame) = rx_out.recv().await {
                if ws_sender.send(WsMessage::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        // Surface inbound text frames; anything else is transport noise.
        let read_task = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if tx_in.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        warn!(error = %e, "websocket read failed");
                        break;
                    }
                    _ => {}
                }
            }
        });

        let transport = WsTransport {
            tx_out,
            rx_in,
            send_task,
            read_task,
        };

        // STOMP-like handshake: authenticate, then open the single
        // per-user inbound queue. The bearer is re-read per connect.
        let sender = transport.sender();
        sender.send(ClientFrame::connect(self.credentials.bearer()).to_json())?;
        sender.send(ClientFrame::subscribe_inbound().to_json())?;

        Ok(Box::new(transport))
    }
}

/// Live tokio-tungstenite connection, split into a forwarding task and
/// an inbound frame channel.
pub struct WsTransport {
    tx_out: mpsc::UnboundedSender<String>,
    rx_in: mpsc::UnboundedReceiver<String>,
    send_task: JoinHandle<()>,
    read_task: JoinHandle<()>,
}

#[async_trait]
impl Transport for WsTransport {
    fn sender(&self) -> FrameSender {
        FrameSender(self.tx_out.clone())
    }

    async fn next_frame(&mut self) -> Option<String> {
        self.rx_in.recv().await
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.send_task.abort();
        self.read_task.abort();
    }
}
