//! Chat session facade.
//!
//! Ties the cache, the REST history fetcher, and the live connection
//! together for the UI: list chats, open a chat (reconciliation), send
//! (optimistic append), and merge inbound traffic. All shared state
//! lives behind an `Arc<Mutex<_>>` handle; locks are never held across
//! an await.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use parley_net::{ChatApi, LiveConnection};
use parley_shared::constants::ECHO_WINDOW;
use parley_shared::{ChatPreview, Message};
use parley_store::Database;

use crate::error::ClientError;
use crate::sync::{reconcile, SyncConfig};

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local user, used as the sender of optimistic messages.
    pub username: String,
    pub sync: SyncConfig,
}

/// An optimistic local append waiting for its server echo.
struct PendingEcho {
    chat_id: i64,
    sender: String,
    body: String,
    local_key: i64,
    queued_at: DateTime<Utc>,
}

impl PendingEcho {
    fn matches(&self, message: &Message, now: DateTime<Utc>) -> bool {
        self.chat_id == message.chat_id
            && self.sender == message.sender
            && self.body == message.message
            && (now - self.queued_at).to_std().unwrap_or_default() < ECHO_WINDOW
    }
}

/// In-memory view state mutated by UI calls and the inbound listener.
#[derive(Default)]
struct SessionState {
    chats: Vec<ChatPreview>,
    open_chat: Option<i64>,
    open_messages: Vec<Message>,
    /// Chats with a reconciliation pass in flight; a concurrent open of
    /// the same chat is served the current cache instead of racing a
    /// second page walk.
    syncing: HashSet<i64>,
    pending_echoes: Vec<PendingEcho>,
}

/// The façade handed to the UI layer.
#[derive(Clone)]
pub struct ChatSession {
    api: Arc<dyn ChatApi>,
    db: Arc<Mutex<Database>>,
    live: LiveConnection,
    config: Arc<SessionConfig>,
    state: Arc<Mutex<SessionState>>,
}

impl ChatSession {
    pub fn new(
        api: Arc<dyn ChatApi>,
        db: Arc<Mutex<Database>>,
        live: LiveConnection,
        config: SessionConfig,
    ) -> Self {
        Self {
            api,
            db,
            live,
            config: Arc::new(config),
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    /// Wire the inbound listener and open the live connection.
    pub async fn start(&self) -> Result<(), ClientError> {
        let db = self.db.clone();
        let state = self.state.clone();
        let retention = self.config.sync.max_messages;

        self.live.subscribe_to_messages(move |message| {
            handle_inbound(&db, &state, retention, message);
        });
        self.live.connect().await?;

        info!(username = %self.config.username, "chat session started");
        Ok(())
    }

    /// Disconnect the live transport; registered listeners go with it.
    pub fn shutdown(&self) {
        self.live.disconnect();
    }

    /// Fetch the conversation list, falling back to the persisted
    /// snapshot when the network is down.
    pub async fn list_chats(&self) -> Result<Vec<ChatPreview>, ClientError> {
        let previews = match self.api.my_chats().await {
            Ok(previews) => {
                self.db
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .store_previews(&previews)?;
                previews
            }
            Err(e) => {
                warn!(error = %e, "chat list fetch failed, serving cached snapshot");
                self.db
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .previews()?
            }
        };

        self.lock_state().chats = previews.clone();
        Ok(previews)
    }

    /// Open a chat: reconcile its history, mark it selected for
    /// live-merge targeting, and return the merged history ascending.
    ///
    /// A reconciliation failure is recovered locally: whatever the
    /// cache holds (including pages persisted before the failure) is
    /// returned and the next open retries.
    pub async fn open_chat(&self, chat_id: i64) -> Result<Vec<Message>, ClientError> {
        {
            let mut state = self.lock_state();
            state.open_chat = Some(chat_id);
            if !state.syncing.insert(chat_id) {
                debug!(chat_id, "sync already in flight, serving cache");
                drop(state);
                let cached = self
                    .db
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .history(chat_id)?;
                self.lock_state().open_messages = cached.clone();
                return Ok(cached);
            }
        }

        let result = reconcile(
            self.api.as_ref(),
            &self.db,
            chat_id,
            &self.config.sync,
            Utc::now(),
        )
        .await;

        self.lock_state().syncing.remove(&chat_id);

        let history = match result {
            Ok(merged) => merged,
            Err(e) => {
                warn!(chat_id, error = %e, "reconciliation failed, serving cache");
                self.db
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .history(chat_id)?
            }
        };

        let mut state = self.lock_state();
        if state.open_chat == Some(chat_id) {
            state.open_messages = history.clone();
        }
        Ok(history)
    }

    /// Send a message over the live connection with an optimistic local
    /// append. On failure (after the manager's one reconnect pass) the
    /// append is rolled back and the error surfaces so the UI can mark
    /// the message as not sent.
    pub async fn send(&self, chat_id: i64, text: &str) -> Result<(), ClientError> {
        let message = Message::outgoing(chat_id, &self.config.username, text);
        let local_key = message.order_key();

        self.db
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upsert_message(&message)?;
        {
            let mut state = self.lock_state();
            if state.open_chat == Some(chat_id) {
                state.open_messages.push(message.clone());
            }
            state.pending_echoes.push(PendingEcho {
                chat_id,
                sender: message.sender.clone(),
                body: message.message.clone(),
                local_key,
                queued_at: Utc::now(),
            });
            for chat in state.chats.iter_mut() {
                if chat.chat_id == chat_id {
                    chat.last_message_sender = message.sender.clone();
                    chat.last_message_content = message.message.clone();
                    chat.last_message_sent_date = message.timestamp.clone();
                }
            }
        }
        // Remember the preview row the optimistic update overwrites so
        // a failed send can put it back.
        let prior_preview = {
            let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
            let prior = db.preview(chat_id).unwrap_or_else(|e| {
                error!(error = %e, "failed to read chat preview");
                None
            });
            if let Err(e) = db.touch_preview(
                chat_id,
                &message.sender,
                &message.message,
                &message.timestamp,
            ) {
                error!(error = %e, "failed to update chat preview");
            }
            prior
        };

        match self.live.send_message(chat_id, text).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(chat_id, error = %e, "send failed, rolling back optimistic append");
                {
                    let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
                    db.delete_local_message(
                        chat_id,
                        local_key,
                        &message.sender,
                        &message.message,
                    )?;
                    if let Some(prior) = &prior_preview {
                        // Only restore if the row still advertises the
                        // unsent message; an inbound message may have
                        // touched it in the meantime.
                        let still_ours = db
                            .preview(chat_id)?
                            .map(|p| {
                                p.last_message_content == message.message
                                    && p.last_message_sent_date == message.timestamp
                            })
                            .unwrap_or(false);
                        if still_ours {
                            if let Err(e) = db.touch_preview(
                                chat_id,
                                &prior.last_message_sender,
                                &prior.last_message_content,
                                &prior.last_message_sent_date,
                            ) {
                                error!(error = %e, "failed to restore chat preview");
                            }
                        }
                    }
                }
                let mut state = self.lock_state();
                state.open_messages.retain(|m| {
                    m.id.is_some()
                        || m.chat_id != chat_id
                        || m.order_key() != local_key
                        || m.message != message.message
                });
                state.pending_echoes.retain(|p| p.local_key != local_key);
                for chat in state.chats.iter_mut() {
                    if chat.chat_id == chat_id
                        && chat.last_message_content == message.message
                        && chat.last_message_sent_date == message.timestamp
                    {
                        let prior = prior_preview.as_ref();
                        chat.last_message_sender = prior
                            .map(|p| p.last_message_sender.clone())
                            .unwrap_or_default();
                        chat.last_message_content = prior
                            .map(|p| p.last_message_content.clone())
                            .unwrap_or_default();
                        chat.last_message_sent_date = prior
                            .map(|p| p.last_message_sent_date.clone())
                            .unwrap_or_default();
                    }
                }
                Err(ClientError::Net(e))
            }
        }
    }

    /// Start a 1:1 chat and refresh the conversation list.
    pub async fn start_chat(&self, username: &str) -> Result<i64, ClientError> {
        let chat_id = self.api.start_chat(username).await?;
        self.list_chats().await?;
        Ok(chat_id)
    }

    /// Followed users for the new-chat picker.
    pub async fn following(
        &self,
        filter: &str,
        page: u32,
        size: u32,
    ) -> Result<Vec<String>, ClientError> {
        Ok(self.api.following(filter, page, size).await?)
    }

    /// Deselect the open chat (back to the list view).
    pub fn close_chat(&self) {
        let mut state = self.lock_state();
        state.open_chat = None;
        state.open_messages.clear();
    }

    pub fn selected_chat(&self) -> Option<i64> {
        self.lock_state().open_chat
    }

    /// Messages of the currently open chat as the UI should render them.
    pub fn open_messages(&self) -> Vec<Message> {
        self.lock_state().open_messages.clone()
    }

    pub fn chats(&self) -> Vec<ChatPreview> {
        self.lock_state().chats.clone()
    }

    pub fn live(&self) -> &LiveConnection {
        &self.live
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Inbound listener: merge into the cache, the open view, and the
/// preview row. Runs on the read loop; every failure is logged and
/// swallowed so one bad message cannot stall delivery.
fn handle_inbound(
    db: &Arc<Mutex<Database>>,
    state: &Arc<Mutex<SessionState>>,
    retention: Option<usize>,
    message: &Message,
) {
    let now = Utc::now();
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());

    // Echo of one of our optimistic sends? Replace the local copy so
    // the message is not displayed twice.
    let echoed = state
        .pending_echoes
        .iter()
        .position(|p| p.matches(message, now));
    if let Some(index) = echoed {
        let pending = state.pending_echoes.remove(index);
        debug!(chat_id = message.chat_id, "server echo replaces optimistic message");
        let db = db.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = db
            .delete_local_message(
                pending.chat_id,
                pending.local_key,
                &pending.sender,
                &pending.body,
            )
            .and_then(|_| db.upsert_message(message))
        {
            error!(error = %e, "failed to persist echoed message");
        }
        if state.open_chat == Some(message.chat_id) {
            state.open_messages.retain(|m| {
                m.id.is_some()
                    || m.order_key() != pending.local_key
                    || m.message != pending.body
            });
            state.open_messages.push(message.clone());
        }
    } else {
        if let Err(e) = db
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upsert_message(message)
        {
            error!(error = %e, "failed to persist inbound message");
        }
        if state.open_chat == Some(message.chat_id) {
            state.open_messages.push(message.clone());
        }
    }

    state.pending_echoes.retain(|p| {
        (now - p.queued_at).to_std().unwrap_or_default() < ECHO_WINDOW
    });

    // Preview updates regardless of which chat is open.
    for chat in state.chats.iter_mut() {
        if chat.chat_id == message.chat_id {
            chat.last_message_sender = message.sender.clone();
            chat.last_message_content = message.message.clone();
            chat.last_message_sent_date = message.timestamp.clone();
        }
    }
    let db = db.lock().unwrap_or_else(|e| e.into_inner());
    if let Err(e) = db.touch_preview(
        message.chat_id,
        &message.sender,
        &message.message,
        &message.timestamp,
    ) {
        error!(error = %e, "failed to update chat preview");
    }

    if let Some(max) = retention {
        match db.trim_history(message.chat_id, max) {
            Ok(0) => {}
            Ok(removed) => debug!(chat_id = message.chat_id, removed, "trimmed history"),
            Err(e) => error!(error = %e, "failed to trim history"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use parley_net::{
        Connector, FrameSender, NetError, ReconnectPolicy, Subscription, Transport,
    };
    use parley_shared::{MessagesPage, RawMessage};

    struct MockTransport {
        tx_out: mpsc::UnboundedSender<String>,
        rx_in: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn sender(&self) -> FrameSender {
            FrameSender::new(self.tx_out.clone())
        }

        async fn next_frame(&mut self) -> Option<String> {
            self.rx_in.recv().await
        }
    }

    #[derive(Default)]
    struct MockConnector {
        refuse: bool,
        ends: Mutex<Option<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>)>>,
    }

    impl MockConnector {
        fn take_ends(&self) -> (mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>) {
            self.ends.lock().unwrap().take().expect("transport ends")
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>, NetError> {
            if self.refuse {
                return Err(NetError::WebSocket("dial refused".into()));
            }
            let (tx_out, rx_out) = mpsc::unbounded_channel();
            let (tx_in, rx_in) = mpsc::unbounded_channel();
            *self.ends.lock().unwrap() = Some((rx_out, tx_in));
            Ok(Box::new(MockTransport { tx_out, rx_in }))
        }
    }

    struct FakeApi {
        chats: Vec<ChatPreview>,
        pages: Vec<MessagesPage>,
        my_chats_fail: bool,
    }

    impl Default for FakeApi {
        fn default() -> Self {
            Self {
                chats: Vec::new(),
                pages: Vec::new(),
                my_chats_fail: false,
            }
        }
    }

    #[async_trait]
    impl ChatApi for FakeApi {
        async fn my_chats(&self) -> Result<Vec<ChatPreview>, NetError> {
            if self.my_chats_fail {
                return Err(NetError::Status(503));
            }
            Ok(self.chats.clone())
        }

        async fn messages_page(
            &self,
            _chat_id: i64,
            page: u32,
            _size: u32,
        ) -> Result<MessagesPage, NetError> {
            Ok(self
                .pages
                .get(page as usize)
                .cloned()
                .unwrap_or(MessagesPage {
                    content: Vec::new(),
                    last: true,
                }))
        }

        async fn start_chat(&self, _username: &str) -> Result<i64, NetError> {
            Ok(42)
        }

        async fn following(
            &self,
            _username: &str,
            _page: u32,
            _size: u32,
        ) -> Result<Vec<String>, NetError> {
            Ok(vec!["ana".into(), "bo".into()])
        }
    }

    fn preview(chat_id: i64, receiver: &str) -> ChatPreview {
        ChatPreview {
            chat_id,
            receiver_username: receiver.into(),
            last_message_sender: String::new(),
            last_message_content: String::new(),
            last_message_sent_date: String::new(),
        }
    }

    fn inbound_frame(id: i64, chat_id: i64, sender: &str, body: &str) -> String {
        format!(
            r#"{{"id":{id},"chatId":{chat_id},"message":"{body}","sender":"{sender}","sentDate":"2024-01-02T10:30:05"}}"#
        )
    }

    fn fixture(
        api: FakeApi,
        refuse: bool,
        max_messages: Option<usize>,
    ) -> (tempfile::TempDir, ChatSession, Arc<MockConnector>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        let connector = Arc::new(MockConnector {
            refuse,
            ends: Mutex::new(None),
        });
        let live = LiveConnection::new(
            connector.clone(),
            ReconnectPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
            },
        );
        let session = ChatSession::new(
            Arc::new(api),
            Arc::new(Mutex::new(db)),
            live,
            SessionConfig {
                username: "me".into(),
                sync: SyncConfig {
                    max_messages,
                    ..SyncConfig::default()
                },
            },
        );
        (dir, session, connector)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn history(session: &ChatSession, chat_id: i64) -> Vec<Message> {
        session.db.lock().unwrap().history(chat_id).unwrap()
    }

    #[tokio::test]
    async fn optimistic_send_is_replaced_by_its_echo() {
        let (_dir, session, connector) = fixture(FakeApi::default(), false, None);
        session.start().await.unwrap();
        session.open_chat(7).await.unwrap();

        session.send(7, "hello").await.unwrap();

        let optimistic = history(&session, 7);
        assert_eq!(optimistic.len(), 1);
        assert_eq!(optimistic[0].id, None);
        assert_eq!(session.open_messages().len(), 1);

        let (_out_rx, in_tx) = connector.take_ends();
        in_tx.send(inbound_frame(900, 7, "me", "hello")).unwrap();

        let probe = session.clone();
        wait_for(move || {
            let h = history(&probe, 7);
            h.len() == 1 && h[0].id == Some(900)
        })
        .await;

        // The open view shows exactly one copy as well.
        let open = session.open_messages();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, Some(900));
    }

    #[tokio::test]
    async fn failed_send_rolls_back_the_optimistic_append() {
        let (_dir, session, _connector) = fixture(FakeApi::default(), true, None);
        session.open_chat(7).await.unwrap();

        let err = session.send(7, "hello").await;
        assert!(matches!(err, Err(ClientError::Net(NetError::NotConnected))));

        assert!(history(&session, 7).is_empty());
        assert!(session.open_messages().is_empty());
    }

    #[tokio::test]
    async fn failed_send_restores_the_preview() {
        let prior = ChatPreview {
            chat_id: 7,
            receiver_username: "bo".into(),
            last_message_sender: "bo".into(),
            last_message_content: "earlier".into(),
            last_message_sent_date: "2024-01-01T09:00:00".into(),
        };
        let api = FakeApi {
            chats: vec![prior.clone()],
            ..FakeApi::default()
        };
        let (_dir, session, _connector) = fixture(api, true, None);
        session.list_chats().await.unwrap();

        let err = session.send(7, "never sent").await;
        assert!(matches!(err, Err(ClientError::Net(NetError::NotConnected))));
        assert!(history(&session, 7).is_empty());

        // Neither the in-memory list nor the persisted snapshot may
        // keep advertising the message that never went out.
        let chats = session.chats();
        assert_eq!(chats[0].last_message_content, "earlier");
        assert_eq!(chats[0].last_message_sender, "bo");

        let persisted = session.db.lock().unwrap().preview(7).unwrap().unwrap();
        assert_eq!(persisted.last_message_content, "earlier");
        assert_eq!(persisted.last_message_sent_date, "2024-01-01T09:00:00");
    }

    #[tokio::test]
    async fn inbound_message_updates_closed_chat_preview() {
        let api = FakeApi {
            chats: vec![preview(9, "ana"), preview(7, "bo")],
            ..FakeApi::default()
        };
        let (_dir, session, connector) = fixture(api, false, None);
        session.start().await.unwrap();
        session.list_chats().await.unwrap();
        session.open_chat(7).await.unwrap();

        let (_out_rx, in_tx) = connector.take_ends();
        in_tx.send(inbound_frame(5, 9, "ana", "psst")).unwrap();

        let probe = session.clone();
        wait_for(move || history(&probe, 9).len() == 1).await;

        // Cache and preview updated; the open view (chat 7) untouched.
        assert!(session.open_messages().is_empty());
        let chats = session.chats();
        let chat9 = chats.iter().find(|c| c.chat_id == 9).unwrap();
        assert_eq!(chat9.last_message_content, "psst");
        assert_eq!(chat9.last_message_sender, "ana");

        let persisted = session.db.lock().unwrap().previews().unwrap();
        let row9 = persisted.iter().find(|c| c.chat_id == 9).unwrap();
        assert_eq!(row9.last_message_content, "psst");
    }

    #[tokio::test]
    async fn inbound_message_appends_to_the_open_chat() {
        let (_dir, session, connector) = fixture(FakeApi::default(), false, None);
        session.start().await.unwrap();
        session.open_chat(7).await.unwrap();

        let (_out_rx, in_tx) = connector.take_ends();
        in_tx.send(inbound_frame(5, 7, "ana", "hi there")).unwrap();

        let probe = session.clone();
        wait_for(move || probe.open_messages().len() == 1).await;

        assert_eq!(session.open_messages()[0].message, "hi there");
        assert_eq!(history(&session, 7).len(), 1);
    }

    #[tokio::test]
    async fn list_chats_serves_snapshot_when_fetch_fails() {
        let api = FakeApi {
            my_chats_fail: true,
            ..FakeApi::default()
        };
        let (_dir, session, _connector) = fixture(api, false, None);

        session
            .db
            .lock()
            .unwrap()
            .store_previews(&[preview(3, "ana")])
            .unwrap();

        let chats = session.list_chats().await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].receiver_username, "ana");
    }

    #[tokio::test]
    async fn retention_trims_after_inbound_merge() {
        let (_dir, session, connector) = fixture(FakeApi::default(), false, Some(2));
        session.start().await.unwrap();

        {
            let db = session.db.lock().unwrap();
            for id in 1..=2 {
                db.upsert_message(&RawMessage {
                    id: Some(id),
                    chat_id: 7,
                    message: "old".into(),
                    sender: "ana".into(),
                    sent_date: "2024-01-02T10:00:00".into(),
                }
                .into_message())
                .unwrap();
            }
        }

        let (_out_rx, in_tx) = connector.take_ends();
        in_tx.send(inbound_frame(3, 7, "ana", "new")).unwrap();

        let probe = session.clone();
        wait_for(move || {
            let h = history(&probe, 7);
            h.len() == 2 && h.last().map(|m| m.id) == Some(Some(3))
        })
        .await;

        let ids: Vec<Option<i64>> = history(&session, 7).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn start_chat_refreshes_the_list() {
        let api = FakeApi {
            chats: vec![preview(42, "bo")],
            ..FakeApi::default()
        };
        let (_dir, session, _connector) = fixture(api, false, None);

        let chat_id = session.start_chat("bo").await.unwrap();
        assert_eq!(chat_id, 42);
        assert_eq!(session.chats().len(), 1);
    }

    // Keeps the import used and documents that subscriptions are plain
    // values the UI can hold on to.
    #[tokio::test]
    async fn live_handle_is_exposed_for_extra_listeners() {
        let (_dir, session, _connector) = fixture(FakeApi::default(), false, None);
        let sub: Subscription = session.live().subscribe_to_messages(|_| {});
        session.live().unsubscribe(sub);
    }
}
