use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, MessageId, User, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    #[default]
    None,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender: User,
    pub body: String,
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub upload_state: UploadState,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.upload_state == UploadState::Pending
    }
}

/// An outgoing message that has not been confirmed by the server yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub sender: User,
    pub body: String,
    pub conversation_id: ConversationId,
    pub reply_to_id: Option<MessageId>,
    pub attachment_name: Option<String>,
    pub attachment_mime_type: Option<String>,
}

impl MessageDraft {
    pub fn text(sender: User, conversation_id: ConversationId, body: impl Into<String>) -> Self {
        Self {
            sender,
            body: body.into(),
            conversation_id,
            reply_to_id: None,
            attachment_name: None,
            attachment_mime_type: None,
        }
    }

    pub fn file(
        sender: User,
        conversation_id: ConversationId,
        name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            sender,
            body: name.clone(),
            conversation_id,
            reply_to_id: None,
            attachment_name: Some(name),
            attachment_mime_type: Some(mime_type.into()),
        }
    }

    /// Materializes the draft as a pending placeholder entry.
    pub fn into_placeholder(self, id: MessageId, created_at: DateTime<Utc>) -> Message {
        let attachment = self.attachment_name.map(|name| Attachment {
            url: String::new(),
            name,
            mime_type: self.attachment_mime_type.unwrap_or_default(),
        });
        Message {
            id,
            sender: self.sender,
            body: self.body,
            conversation_id: self.conversation_id,
            reply_to_id: self.reply_to_id,
            attachment,
            created_at,
            upload_state: UploadState::Pending,
        }
    }

    pub fn to_create_request(&self, attachment_url: Option<String>) -> CreateMessageRequest {
        CreateMessageRequest {
            body: self.body.clone(),
            conversation_id: self.conversation_id.clone(),
            reply_to_id: self.reply_to_id.clone(),
            attachment_url,
            attachment_name: self.attachment_name.clone(),
            attachment_mime_type: self.attachment_mime_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    pub body: String,
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub file_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

/// Events the client publishes on the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ClientRequest {
    #[serde(rename = "setup")]
    Setup(SetupPayload),
    #[serde(rename = "join chat")]
    JoinChat(ConversationId),
    #[serde(rename = "typing")]
    Typing(ConversationId),
    #[serde(rename = "stop typing")]
    StopTyping(ConversationId),
    #[serde(rename = "new message")]
    NewMessage(Message),
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::JoinChat(_) => "join chat",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stop typing",
            Self::NewMessage(_) => "new message",
        }
    }
}

/// Events the server pushes on the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "message received", alias = "message recieved")]
    MessageReceived(Message),
    #[serde(rename = "typing")]
    Typing(TypingPayload),
    #[serde(rename = "stop typing")]
    StopTyping(TypingPayload),
}

impl ServerEvent {
    pub fn kind(&self) -> ServerEventKind {
        match self {
            Self::Connected => ServerEventKind::Connected,
            Self::MessageReceived(_) => ServerEventKind::MessageReceived,
            Self::Typing(_) => ServerEventKind::Typing,
            Self::StopTyping(_) => ServerEventKind::StopTyping,
        }
    }
}

/// Event names a channel handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    Connected,
    MessageReceived,
    Typing,
    StopTyping,
}

impl ServerEventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::MessageReceived => "message received",
            Self::Typing => "typing",
            Self::StopTyping => "stop typing",
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
