//! REST and upload collaborators consumed by the sync core.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use url::Url;
use shared::{
    domain::{ConversationId, MessageId},
    error::ApiException,
    protocol::{CreateMessageRequest, Message, UploadResponse},
};

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;
    async fn create_message(&self, request: CreateMessageRequest) -> Result<Message>;
    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<()>;
    async fn clear_notifications(&self) -> Result<()>;
    /// Deletes a message for every participant.
    async fn delete_message(&self, message_id: &MessageId) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedMedia {
    pub url: String,
    pub name: String,
    pub mime_type: String,
}

#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, file: &OutgoingFile) -> Result<UploadedMedia>;
}

pub struct MissingChatApi;

#[async_trait]
impl ChatApi for MissingChatApi {
    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        Err(anyhow!(
            "chat api unavailable: cannot list messages for {conversation_id}"
        ))
    }

    async fn create_message(&self, request: CreateMessageRequest) -> Result<Message> {
        Err(anyhow!(
            "chat api unavailable: cannot create message in {}",
            request.conversation_id
        ))
    }

    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<()> {
        Err(anyhow!(
            "chat api unavailable: cannot mark {conversation_id} read"
        ))
    }

    async fn clear_notifications(&self) -> Result<()> {
        Err(anyhow!("chat api unavailable: cannot clear notifications"))
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        Err(anyhow!("chat api unavailable: cannot delete {message_id}"))
    }
}

pub struct MissingMediaUploader;

#[async_trait]
impl MediaUploader for MissingMediaUploader {
    async fn upload(&self, file: &OutgoingFile) -> Result<UploadedMedia> {
        Err(anyhow!("media uploader unavailable for '{}'", file.name))
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiException::from_response(status.as_u16(), &body).into())
}

/// Bearer-authenticated client for the chat REST surface.
pub struct HttpChatApi {
    http: Client,
    base_url: String,
    auth_token: String,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.auth_token)
    }

    /// Joins `segments` onto the base url, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("api base url cannot take a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let response = self
            .authorized(self.http.get(format!("{}/messages", self.base_url)))
            .query(&[("conversationId", conversation_id.as_str())])
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn create_message(&self, request: CreateMessageRequest) -> Result<Message> {
        let response = self
            .authorized(self.http.post(format!("{}/messages", self.base_url)))
            .json(&request)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<()> {
        let response = self
            .authorized(self.http.put(self.endpoint(&[
                "conversations",
                conversation_id.as_str(),
                "read",
            ])?))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn clear_notifications(&self) -> Result<()> {
        let response = self
            .authorized(
                self.http
                    .put(format!("{}/messages/clear-notifications", self.base_url)),
            )
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        let response = self
            .authorized(
                self.http
                    .delete(self.endpoint(&["message", message_id.as_str()])?),
            )
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

pub struct HttpMediaUploader {
    http: Client,
    base_url: String,
    auth_token: String,
}

impl HttpMediaUploader {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
        }
    }
}

#[async_trait]
impl MediaUploader for HttpMediaUploader {
    async fn upload(&self, file: &OutgoingFile) -> Result<UploadedMedia> {
        let response = self
            .http
            .post(format!("{}/upload", self.base_url))
            .bearer_auth(&self.auth_token)
            .query(&[
                ("filename", file.name.as_str()),
                ("mimeType", file.mime_type.as_str()),
            ])
            .body(file.bytes.clone())
            .send()
            .await?;
        let uploaded: UploadResponse = check_status(response).await?.json().await?;
        Ok(UploadedMedia {
            url: uploaded.file_url,
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
        })
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
