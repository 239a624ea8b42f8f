use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ConversationId, ConversationKind, DeleteScope, FileId, MessageId, MessageKind,
        ParticipantRole, UserId,
    },
    error::{ApiError, ApiException, ErrorCode},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub file_name: String,
    pub url: String,
    pub size_bytes: u64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Message content as a closed sum over the message types.
///
/// Non-deleted bodies carry either text or attachments, never both and never
/// neither; use [`MessageBody::compose`] to build one from loose parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    Text { content: String },
    Image { attachments: Vec<AttachmentPayload> },
    Video { attachments: Vec<AttachmentPayload> },
    Audio { attachments: Vec<AttachmentPayload> },
    File { attachments: Vec<AttachmentPayload> },
    Deleted,
}

impl MessageBody {
    pub fn text(content: impl Into<String>) -> Result<Self, ApiException> {
        Self::compose(None, content.into(), Vec::new())
    }

    pub fn compose(
        kind: Option<MessageKind>,
        content: String,
        attachments: Vec<AttachmentPayload>,
    ) -> Result<Self, ApiException> {
        let has_text = !content.trim().is_empty();
        let has_attachments = !attachments.is_empty();
        if has_text == has_attachments {
            return Err(ApiException::new(
                ErrorCode::Validation,
                "a message carries either text or attachments",
            ));
        }

        let kind = match kind {
            Some(kind) => kind,
            None if has_text => MessageKind::Text,
            None => MessageKind::from_mime(&attachments[0].mime_type),
        };

        match (kind, has_text) {
            (MessageKind::Text, true) => Ok(MessageBody::Text { content }),
            (MessageKind::Image, false) => Ok(MessageBody::Image { attachments }),
            (MessageKind::Video, false) => Ok(MessageBody::Video { attachments }),
            (MessageKind::Audio, false) => Ok(MessageBody::Audio { attachments }),
            (MessageKind::File, false) => Ok(MessageBody::File { attachments }),
            (MessageKind::Deleted, _) => Err(ApiException::new(
                ErrorCode::Validation,
                "deleted messages cannot be posted",
            )),
            (kind, _) => Err(ApiException::new(
                ErrorCode::Validation,
                format!("{} message does not match its payload", kind.as_str()),
            )),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Text { .. } => MessageKind::Text,
            MessageBody::Image { .. } => MessageKind::Image,
            MessageBody::Video { .. } => MessageKind::Video,
            MessageBody::Audio { .. } => MessageKind::Audio,
            MessageBody::File { .. } => MessageKind::File,
            MessageBody::Deleted => MessageKind::Deleted,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            MessageBody::Text { content } => content,
            _ => "",
        }
    }

    pub fn attachments(&self) -> &[AttachmentPayload] {
        match self {
            MessageBody::Image { attachments }
            | MessageBody::Video { attachments }
            | MessageBody::Audio { attachments }
            | MessageBody::File { attachments } => attachments,
            MessageBody::Text { .. } | MessageBody::Deleted => &[],
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, MessageBody::Deleted)
    }

    /// One-line summary used for conversation list previews.
    pub fn preview(&self) -> String {
        match self {
            MessageBody::Text { content } => content.lines().next().unwrap_or_default().to_string(),
            MessageBody::Image { .. } => "Photo".to_string(),
            MessageBody::Video { .. } => "Video".to_string(),
            MessageBody::Audio { .. } => "Voice message".to_string(),
            MessageBody::File { attachments } => attachments
                .first()
                .map(|attachment| attachment.file_name.clone())
                .unwrap_or_else(|| "File".to_string()),
            MessageBody::Deleted => "This message was deleted".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_by: BTreeSet<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub user_id: UserId,
    pub display_name: String,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub participants: Vec<ParticipantSummary>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
    /// Relay connection that should not receive the echo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_connection: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessageRequest {
    pub user_id: UserId,
    pub scope: DeleteScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessageResponse {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub scope: DeleteScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file_id: FileId,
    pub url: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
}

impl UploadResponse {
    pub fn into_attachment(self, duration_ms: Option<u64>) -> AttachmentPayload {
        AttachmentPayload {
            file_name: self.name,
            url: self.url,
            size_bytes: self.size,
            mime_type: self.mime_type,
            duration_ms,
        }
    }
}

/// Frames a client sends over the event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    Authenticate {
        user_id: UserId,
        name: String,
        role: String,
    },
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    TypingStart {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    TypingStop {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    GetOnlineUsers,
    AckMessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
        deleted_by: UserId,
    },
}

/// Frames the relay pushes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RelayEvent {
    Authenticated {
        user_id: UserId,
        connection_id: u64,
    },
    NewMessage {
        message: MessagePayload,
    },
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    PresenceUpdate {
        user_id: UserId,
        is_online: bool,
    },
    OnlineUsers {
        user_ids: Vec<UserId>,
    },
    ReadReceipt {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
        reader_id: UserId,
    },
    MessageDeleted {
        message_id: MessageId,
        conversation_id: ConversationId,
        deleted_by: UserId,
    },
    MessageDeletedForMe {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    Error(ApiError),
}

impl RelayEvent {
    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::Authenticated { .. } => "authenticated",
            RelayEvent::NewMessage { .. } => "new_message",
            RelayEvent::UserTyping { .. } => "user_typing",
            RelayEvent::PresenceUpdate { .. } => "presence_update",
            RelayEvent::OnlineUsers { .. } => "online_users",
            RelayEvent::ReadReceipt { .. } => "read_receipt",
            RelayEvent::MessageDeleted { .. } => "message_deleted",
            RelayEvent::MessageDeletedForMe { .. } => "message_deleted_for_me",
            RelayEvent::Error(_) => "error",
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
