use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::constants::{CHAT_STREAM_PATH, CONVERSATIONS_PATH};
use crate::types::*;

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Opens the response body of one streaming chat request.
pub trait StreamTransport: Send + Sync {
    fn open<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, Result<ByteStream>>;
}

impl<T: StreamTransport + ?Sized> StreamTransport for Arc<T> {
    fn open<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, Result<ByteStream>> {
        (**self).open(request)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    /// Only user and assistant turns are shown in the session history.
    pub fn into_chat_message(self) -> Option<ChatMessage> {
        let created_at = match self.created_at {
            Some(t) => t,
            None => Utc::now(),
        };
        match self.role.as_str() {
            "user" => Some(ChatMessage::User(UserMessage {
                id: MessageId(self.id),
                content: self.content,
                created_at,
            })),
            "assistant" => Some(ChatMessage::Assistant(AssistantMessage {
                id: MessageId(self.id),
                content: self.content,
                reasoning: self.reasoning.filter(|r| !r.is_empty()),
                tool_calls: Vec::new(),
                rag_sources: Vec::new(),
                memories: Vec::new(),
                chart_config: None,
                process_steps: Vec::new(),
                status: MessageStatus::Complete,
                model: self.model.unwrap_or_default(),
                created_at,
            })),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub summary: ConversationSummary,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

impl ConversationDetail {
    pub fn into_history(self) -> Vec<ChatMessage> {
        self.messages
            .into_iter()
            .filter_map(StoredMessage::into_chat_message)
            .collect()
    }
}

/// Conversation CRUD offered by the backend.
pub trait ConversationApi: Send + Sync {
    fn list(&self) -> BoxFuture<'_, Result<Vec<ConversationSummary>>>;
    fn get<'a>(&'a self, id: &'a ConversationId) -> BoxFuture<'a, Result<ConversationDetail>>;
    fn create<'a>(&'a self, title: &'a str) -> BoxFuture<'a, Result<ConversationSummary>>;
    fn update<'a>(
        &'a self,
        id: &'a ConversationId,
        title: &'a str,
    ) -> BoxFuture<'a, Result<ConversationSummary>>;
    fn delete<'a>(&'a self, id: &'a ConversationId) -> BoxFuture<'a, Result<()>>;
}

/// `reqwest` implementation of both collaborator traits.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct TitleBody<'a> {
    title: &'a str,
}

impl HttpClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn conversation_url(&self, id: &ConversationId) -> String {
        format!("{}{}/{}", self.base_url, CONVERSATIONS_PATH, id)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(ChatflowError::Network)?;

        let status = response.status();
        if !status.is_success() {
            let err_body = match response.text().await {
                Ok(t) => t,
                Err(_) => "Unknown error (failed to read response text)".to_string(),
            };
            tracing::error!("[HTTP] Upstream returned {}: {}", status, err_body);
            return Err(ChatflowError::Upstream(status, err_body).into());
        }
        Ok(response)
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream> {
        tracing::debug!(
            "[HTTP] Opening stream (conversation: {:?}, model: {}, thinking: {})",
            request.conversation_id.as_ref().map(|c| c.short()),
            request.model,
            request.thinking_enabled
        );
        let builder = self
            .client
            .post(self.url(CHAT_STREAM_PATH))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request);
        let response = self.send(builder).await?;

        Ok(response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other))
            .boxed())
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T> {
        let body = self.send(builder).await?.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

impl StreamTransport for HttpClient {
    fn open<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, Result<ByteStream>> {
        self.open_stream(request).boxed()
    }
}

impl ConversationApi for HttpClient {
    fn list(&self) -> BoxFuture<'_, Result<Vec<ConversationSummary>>> {
        self.fetch_json(self.client.get(self.url(CONVERSATIONS_PATH)))
            .boxed()
    }

    fn get<'a>(&'a self, id: &'a ConversationId) -> BoxFuture<'a, Result<ConversationDetail>> {
        self.fetch_json(self.client.get(self.conversation_url(id)))
            .boxed()
    }

    fn create<'a>(&'a self, title: &'a str) -> BoxFuture<'a, Result<ConversationSummary>> {
        let builder = self
            .client
            .post(self.url(CONVERSATIONS_PATH))
            .json(&TitleBody { title });
        self.fetch_json(builder).boxed()
    }

    fn update<'a>(
        &'a self,
        id: &'a ConversationId,
        title: &'a str,
    ) -> BoxFuture<'a, Result<ConversationSummary>> {
        let builder = self
            .client
            .put(self.conversation_url(id))
            .json(&TitleBody { title });
        self.fetch_json(builder).boxed()
    }

    fn delete<'a>(&'a self, id: &'a ConversationId) -> BoxFuture<'a, Result<()>> {
        async move {
            self.send(self.client.delete(self.conversation_url(id)))
                .await?;
            Ok(())
        }
        .boxed()
    }
}
