use shared::domain::{ConversationId, MessageId};
use thiserror::Error;

/// Failures surfaced to the UI layer. None of them end the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("live channel connection lost")]
    ConnectionLost,
    #[error("live channel is not connected")]
    NotConnected,
    #[error("failed to open live channel: {0}")]
    ConnectFailed(String),
    #[error("failed to send message: {0}")]
    SendFailed(String),
    #[error("failed to upload file: {0}")]
    UploadFailed(String),
    #[error("failed to fetch messages: {0}")]
    FetchFailed(String),
    #[error("failed to clear notifications: {0}")]
    ClearFailed(String),
    #[error("failed to delete message: {0}")]
    DeleteFailed(String),
    #[error("message {message_id} can only be deleted for everyone by its sender")]
    DeleteForbidden { message_id: MessageId },
    #[error("message {message_id} is not in the open conversation")]
    UnknownMessage { message_id: MessageId },
    #[error("sending is not permitted in conversation {conversation_id}")]
    SendForbidden { conversation_id: ConversationId },
    #[error("no conversation is open")]
    NoConversationSelected,
    #[error("not signed in")]
    NotSignedIn,
    #[error("invalid channel frame: {0}")]
    Protocol(String),
}

impl SyncError {
    pub fn connect_failed(err: &anyhow::Error) -> Self {
        Self::ConnectFailed(format!("{err:#}"))
    }

    pub fn send_failed(err: &anyhow::Error) -> Self {
        Self::SendFailed(format!("{err:#}"))
    }

    pub fn upload_failed(err: &anyhow::Error) -> Self {
        Self::UploadFailed(format!("{err:#}"))
    }

    pub fn fetch_failed(err: &anyhow::Error) -> Self {
        Self::FetchFailed(format!("{err:#}"))
    }

    pub fn clear_failed(err: &anyhow::Error) -> Self {
        Self::ClearFailed(format!("{err:#}"))
    }

    pub fn delete_failed(err: &anyhow::Error) -> Self {
        Self::DeleteFailed(format!("{err:#}"))
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
