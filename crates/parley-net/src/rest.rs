//! Paginated history fetching and the other chat REST endpoints.
//!
//! The server pages history in reverse-chronological order: page 0 is
//! the newest slice and content within a page is newest-first. The
//! reconciliation layer walks pages forward through that scheme.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, COOKIE};
use serde::de::DeserializeOwned;
use tracing::debug;

use parley_shared::{
    ChatPreview, ChatsResponse, FollowingResponse, MessagesPage, StartChatResponse,
};

use crate::credentials::CredentialProvider;
use crate::error::NetError;

/// The black-box chat REST API. Implemented by [`RestClient`] in
/// production and by in-memory fakes in tests.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `GET /chats/my-chats`
    async fn my_chats(&self) -> Result<Vec<ChatPreview>, NetError>;

    /// `GET /chats/{chatId}/messages?page=&size=`
    async fn messages_page(
        &self,
        chat_id: i64,
        page: u32,
        size: u32,
    ) -> Result<MessagesPage, NetError>;

    /// `POST /chats/start/{username}` -> new chat id
    async fn start_chat(&self, username: &str) -> Result<i64, NetError>;

    /// `GET /users/following?username=&page=&size=`
    async fn following(
        &self,
        username: &str,
        page: u32,
        size: u32,
    ) -> Result<Vec<String>, NetError>;
}

/// reqwest-backed [`ChatApi`] implementation.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl RestClient {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, NetError> {
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.get(format!("{}/{}", self.base_url, path)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.post(format!("{}/{}", self.base_url, path)))
    }

    fn authorize(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = self.credentials.bearer() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(cookie) = self.credentials.cookie() {
            builder = builder.header(COOKIE, cookie);
        }
        builder
    }
}

/// Send a request and decode a JSON body, mapping non-success statuses
/// to [`NetError::Status`] so callers can decide on retry.
async fn fetch_json<T: DeserializeOwned>(builder: reqwest::RequestBuilder) -> Result<T, NetError> {
    let response = builder.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(NetError::Status(status.as_u16()));
    }
    Ok(response.json().await?)
}

#[async_trait]
impl ChatApi for RestClient {
    async fn my_chats(&self) -> Result<Vec<ChatPreview>, NetError> {
        let response: ChatsResponse = fetch_json(self.get("chats/my-chats")).await?;

        debug!(count = response.content.len(), "fetched chat list");
        Ok(response.content)
    }

    async fn messages_page(
        &self,
        chat_id: i64,
        page: u32,
        size: u32,
    ) -> Result<MessagesPage, NetError> {
        let page_data: MessagesPage = fetch_json(
            self.get(&format!("chats/{chat_id}/messages"))
                .query(&[("page", page), ("size", size)]),
        )
        .await?;

        debug!(
            chat_id,
            page,
            count = page_data.content.len(),
            last = page_data.last,
            "fetched history page"
        );
        Ok(page_data)
    }

    async fn start_chat(&self, username: &str) -> Result<i64, NetError> {
        let response: StartChatResponse =
            fetch_json(self.post(&format!("chats/start/{username}"))).await?;

        debug!(username, chat_id = response.chat_id, "started chat");
        Ok(response.chat_id)
    }

    async fn following(
        &self,
        username: &str,
        page: u32,
        size: u32,
    ) -> Result<Vec<String>, NetError> {
        let response: FollowingResponse = fetch_json(
            self.get("users/following")
                .query(&[("username", username)])
                .query(&[("page", page), ("size", size)]),
        )
        .await?;

        Ok(response.content)
    }
}
