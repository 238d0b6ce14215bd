//! HTTP request channel to the chat server.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize};
use shared::{
    domain::{ConversationId, MessageId, MessageKind, UserId},
    error::ApiException,
    protocol::{
        ConversationRecord, ConversationsResponse, LoginRequest, LoginResponse, MessageRecord,
        MessagesResponse, SendMessageRequest,
    },
};
use tracing::debug;

use crate::auth::AuthProvider;

#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse>;
    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>>;
    async fn conversation_with(&self, user_id: UserId) -> Result<ConversationRecord>;
    /// Messages with an id strictly greater than `after`, oldest first.
    async fn fetch_messages_after(
        &self,
        conversation_id: ConversationId,
        after: Option<MessageId>,
        limit: u32,
    ) -> Result<MessagesResponse>;
    /// History page of messages older than `before` (newest page when `None`).
    async fn fetch_messages_before(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<MessagesResponse>;
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        kind: MessageKind,
        content: &str,
    ) -> Result<MessageRecord>;
    async fn mark_read(&self, conversation_id: ConversationId) -> Result<()>;
}

/// Some endpoints answer with `{code, message, data}`, others with the bare
/// object.
#[derive(Deserialize)]
#[serde(untagged)]
enum Wrapped<T> {
    Enveloped { data: T },
    Bare(T),
}

impl<T> Wrapped<T> {
    fn into_inner(self) -> T {
        match self {
            Self::Enveloped { data } => data,
            Self::Bare(inner) => inner,
        }
    }
}

pub struct HttpMessageApi {
    http: Client,
    server_url: String,
    auth: Arc<dyn AuthProvider>,
}

impl HttpMessageApi {
    pub fn new(http: Client, server_url: impl Into<String>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = self
            .auth
            .token()
            .ok_or_else(|| anyhow!("not logged in: missing token"))?;
        Ok(request.bearer_auth(token))
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        cursor: (&str, Option<MessageId>),
        limit: u32,
    ) -> Result<MessagesResponse> {
        let mut query = vec![("limit", limit.to_string())];
        if let (name, Some(id)) = cursor {
            query.push((name, id.0.to_string()));
        }
        let request = self
            .http
            .get(self.url(&format!("/api/conversations/{conversation_id}/messages")))
            .query(&query);
        let mut page: MessagesResponse = read_json(self.authorized(request)?.send().await?).await?;
        page.messages.sort_by_key(|message| message.id);
        Ok(page)
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiException::from_status(status.as_u16(), &body).into())
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let url = response.url().to_string();
    let body = check_status(response).await?.text().await?;
    let wrapped: Wrapped<T> = serde_json::from_str(&body)
        .with_context(|| format!("unexpected response body from {url}"))?;
    Ok(wrapped.into_inner())
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse> {
        let response = self
            .http
            .post(self.url("/api/auth/login"))
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        read_json(response).await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>> {
        let request = self.http.get(self.url("/api/conversations"));
        let body: ConversationsResponse = read_json(self.authorized(request)?.send().await?).await?;
        Ok(body.conversations)
    }

    async fn conversation_with(&self, user_id: UserId) -> Result<ConversationRecord> {
        let request = self
            .http
            .get(self.url(&format!("/api/conversations/with/{user_id}")));
        read_json(self.authorized(request)?.send().await?).await
    }

    async fn fetch_messages_after(
        &self,
        conversation_id: ConversationId,
        after: Option<MessageId>,
        limit: u32,
    ) -> Result<MessagesResponse> {
        debug!(%conversation_id, after = after.map(|id| id.0), limit, "pulling messages");
        self.fetch_messages(conversation_id, ("after_id", after), limit)
            .await
    }

    async fn fetch_messages_before(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<MessagesResponse> {
        self.fetch_messages(conversation_id, ("before_id", before), limit)
            .await
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        kind: MessageKind,
        content: &str,
    ) -> Result<MessageRecord> {
        let request = self
            .http
            .post(self.url(&format!("/api/conversations/{conversation_id}/messages")))
            .json(&SendMessageRequest {
                kind,
                content: content.to_string(),
            });
        read_json(self.authorized(request)?.send().await?).await
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<()> {
        let request = self
            .http
            .post(self.url(&format!("/api/conversations/{conversation_id}/read")));
        check_status(self.authorized(request)?.send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
