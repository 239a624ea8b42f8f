use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ConversationId, DeleteScope, MessageId, UserId},
    error::{ApiError, ApiException},
    protocol::{
        ConversationSummary, DeleteMessageRequest, DeleteMessageResponse, MarkReadRequest,
        MarkReadResponse, MessagePayload, SendMessageRequest, UploadResponse,
    },
};

pub const HISTORY_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// REST surface of the persistence collaborator.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn list_conversations(&self, user_id: UserId) -> Result<Vec<ConversationSummary>>;
    async fn fetch_messages(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>>;
    async fn post_message(&self, request: &SendMessageRequest) -> Result<MessagePayload>;
    async fn mark_read(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<MarkReadResponse>;
    async fn delete_message(
        &self,
        user_id: UserId,
        message_id: MessageId,
        scope: DeleteScope,
    ) -> Result<DeleteMessageResponse>;
    async fn upload_file(&self, user_id: UserId, upload: FileUpload) -> Result<UploadResponse>;
}

pub struct MissingChatBackend;

#[async_trait]
impl ChatBackend for MissingChatBackend {
    async fn list_conversations(&self, _user_id: UserId) -> Result<Vec<ConversationSummary>> {
        Err(anyhow!("chat backend is unavailable"))
    }

    async fn fetch_messages(
        &self,
        _user_id: UserId,
        _conversation_id: ConversationId,
        _limit: u32,
        _before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        Err(anyhow!("chat backend is unavailable"))
    }

    async fn post_message(&self, _request: &SendMessageRequest) -> Result<MessagePayload> {
        Err(anyhow!("chat backend is unavailable"))
    }

    async fn mark_read(
        &self,
        _user_id: UserId,
        _conversation_id: ConversationId,
    ) -> Result<MarkReadResponse> {
        Err(anyhow!("chat backend is unavailable"))
    }

    async fn delete_message(
        &self,
        _user_id: UserId,
        _message_id: MessageId,
        _scope: DeleteScope,
    ) -> Result<DeleteMessageResponse> {
        Err(anyhow!("chat backend is unavailable"))
    }

    async fn upload_file(&self, _user_id: UserId, _upload: FileUpload) -> Result<UploadResponse> {
        Err(anyhow!("chat backend is unavailable"))
    }
}

#[derive(Serialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Serialize)]
struct ListMessagesQuery {
    user_id: i64,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<i64>,
}

#[derive(Serialize)]
struct UploadQuery<'a> {
    user_id: i64,
    filename: &'a str,
    mime_type: &'a str,
}

pub struct HttpChatBackend {
    http: Client,
    server_url: String,
}

impl HttpChatBackend {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn list_conversations(&self, user_id: UserId) -> Result<Vec<ConversationSummary>> {
        let response = self
            .http
            .get(self.url("/conversations"))
            .query(&UserQuery { user_id: user_id.0 })
            .send()
            .await
            .context("failed to list conversations")?;
        decode(response).await
    }

    async fn fetch_messages(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        let response = self
            .http
            .get(self.url(&format!("/conversations/{}/messages", conversation_id.0)))
            .query(&ListMessagesQuery {
                user_id: user_id.0,
                limit,
                before: before.map(|id| id.0),
            })
            .send()
            .await
            .with_context(|| format!("failed to fetch messages for conversation {conversation_id}"))?;
        decode(response).await
    }

    async fn post_message(&self, request: &SendMessageRequest) -> Result<MessagePayload> {
        let response = self
            .http
            .post(self.url("/messages"))
            .json(request)
            .send()
            .await
            .context("failed to post message")?;
        decode(response).await
    }

    async fn mark_read(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<MarkReadResponse> {
        let response = self
            .http
            .patch(self.url(&format!("/conversations/{}/read", conversation_id.0)))
            .json(&MarkReadRequest { user_id })
            .send()
            .await
            .context("failed to mark conversation read")?;
        decode(response).await
    }

    async fn delete_message(
        &self,
        user_id: UserId,
        message_id: MessageId,
        scope: DeleteScope,
    ) -> Result<DeleteMessageResponse> {
        let response = self
            .http
            .delete(self.url(&format!("/messages/{}", message_id.0)))
            .json(&DeleteMessageRequest { user_id, scope })
            .send()
            .await
            .context("failed to delete message")?;
        decode(response).await
    }

    async fn upload_file(&self, user_id: UserId, upload: FileUpload) -> Result<UploadResponse> {
        let response = self
            .http
            .post(self.url("/files/upload"))
            .query(&UploadQuery {
                user_id: user_id.0,
                filename: &upload.file_name,
                mime_type: &upload.mime_type,
            })
            .body(upload.bytes)
            .send()
            .await
            .context("failed to upload file")?;
        decode(response).await
    }
}

/// Successful bodies decode as `T`; error bodies surface as [`ApiException`].
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .context("invalid response body");
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(err) => Err(ApiException::from(err).into()),
        Err(_) => Err(anyhow!("request failed with status {status}: {body}")),
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
