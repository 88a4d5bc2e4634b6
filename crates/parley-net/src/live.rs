//! Live connection manager.
//!
//! Owns the single multiplexed real-time connection for the session and
//! fans inbound messages out to registered listeners. The manager is an
//! explicitly constructed service instance; callers hold it (or clone
//! it) instead of reaching for process-wide state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use parley_shared::constants::{RECONNECT_BASE_DELAY, RECONNECT_MAX_ATTEMPTS};
use parley_shared::{ClientFrame, Message, RawMessage};

use crate::error::NetError;
use crate::transport::{Connector, FrameSender};

/// Connection lifecycle: `Disconnected -> Connecting -> Connected`,
/// back to `Disconnected` on explicit disconnect or transport close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Dial retry policy for one connect pass.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Transport dial attempts before the pass fails.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per failure.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RECONNECT_MAX_ATTEMPTS,
            base_delay: RECONNECT_BASE_DELAY,
        }
    }
}

/// Handle returned by [`LiveConnection::subscribe_to_messages`];
/// removes exactly that listener when passed to `unsubscribe`.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
}

type Listener = Arc<dyn Fn(&Message) + Send + Sync>;

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    state: Mutex<ConnectionState>,
    sender: Mutex<Option<FrameSender>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    read_task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every successful dial. A read loop that outlives its
    /// connection must not touch state owned by a newer one.
    generation: AtomicU64,
}

/// At most one active live connection per authenticated session; all
/// chat traffic is multiplexed over it.
#[derive(Clone)]
pub struct LiveConnection {
    inner: Arc<Inner>,
}

impl LiveConnection {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                state: Mutex::new(ConnectionState::Disconnected),
                sender: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                read_task: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the transport and start the read loop.
    ///
    /// Idempotent: a call while `Connecting` or `Connected` is a no-op.
    /// Dial attempts follow the [`ReconnectPolicy`] with exponential
    /// backoff; on failure the state returns to `Disconnected`.
    pub async fn connect(&self) -> Result<(), NetError> {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    debug!("already connected or connecting, skipping");
                    return Ok(());
                }
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
            }
        }

        let mut delay = self.inner.policy.base_delay;
        let mut last_err = NetError::NotConnected;

        for attempt in 1..=self.inner.policy.max_attempts {
            match self.inner.connector.connect().await {
                Ok(mut transport) => {
                    // Sender and state must be in place before the read
                    // loop exists; a transport that closes immediately
                    // would otherwise race this function and leave the
                    // manager claiming Connected with no sender.
                    let generation =
                        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    *self.inner.sender.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(transport.sender());
                    *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) =
                        ConnectionState::Connected;

                    let inner = self.inner.clone();
                    let handle = tokio::spawn(async move {
                        while let Some(frame) = transport.next_frame().await {
                            match serde_json::from_str::<RawMessage>(&frame) {
                                Ok(raw) => deliver(&inner, &raw.into_message()),
                                Err(e) => {
                                    warn!(error = %e, "dropping malformed inbound frame")
                                }
                            }
                        }
                        // Transport closed underneath us; the next send
                        // is allowed to trigger a reconnect. A newer
                        // connection owns the state once the generation
                        // has moved on.
                        if inner.generation.load(Ordering::SeqCst) == generation {
                            *inner.state.lock().unwrap_or_else(|e| e.into_inner()) =
                                ConnectionState::Disconnected;
                            inner.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
                            info!("live connection closed");
                        }
                    });

                    if let Some(old) = self
                        .inner
                        .read_task
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .replace(handle)
                    {
                        old.abort();
                    }

                    info!(attempt, "live connection established");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "connect attempt failed");
                    last_err = e;
                    if attempt < self.inner.policy.max_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) =
            ConnectionState::Disconnected;
        Err(last_err)
    }

    /// Tear down the transport and clear all registered listeners.
    /// Idempotent.
    pub fn disconnect(&self) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) =
            ConnectionState::Disconnected;
        self.inner.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = self
            .inner
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            // Dropping the read task drops the transport with it.
            task.abort();
        }
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        info!("live connection shut down");
    }

    /// Publish a message body addressed to a chat.
    ///
    /// If the manager is not connected it makes one reconnect pass; a
    /// pass that fails surfaces [`NetError::NotConnected`] and nothing
    /// is published.
    pub async fn send_message(&self, chat_id: i64, body: &str) -> Result<(), NetError> {
        if self.state() != ConnectionState::Connected {
            debug!(chat_id, "not connected, reconnecting before send");
            self.connect().await.map_err(|e| {
                error!(chat_id, error = %e, "reconnect before send failed");
                NetError::NotConnected
            })?;
        }

        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        match sender {
            Some(sender) => {
                debug!(chat_id, "publishing message");
                sender.send(ClientFrame::send_to_chat(chat_id, body).to_json())
            }
            None => Err(NetError::NotConnected),
        }
    }

    /// Register a listener for every inbound message. Listeners are
    /// invoked synchronously in registration order on the read loop.
    pub fn subscribe_to_messages(
        &self,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(handler)));
        debug!(listener_id = id, "listener registered");
        Subscription { id }
    }

    /// Remove exactly the listener behind `subscription`.
    pub fn unsubscribe(&self, subscription: Subscription) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _)| *id != subscription.id);
        debug!(listener_id = subscription.id, "listener removed");
    }
}

/// Fan one inbound message out to all listeners, in registration order.
/// A panicking listener is isolated so the rest still run.
fn deliver(inner: &Inner, message: &Message) {
    let listeners: Vec<(u64, Listener)> = inner
        .listeners
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    for (id, listener) in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(message))).is_err() {
            error!(listener_id = id, chat_id = message.chat_id, "listener panicked");
        }
    }
}
