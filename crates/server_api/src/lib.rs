use shared::{
    domain::{ConversationId, DeleteScope, MessageId, MessageKind, ParticipantRole, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AttachmentPayload, ConversationSummary, DeleteMessageResponse, MarkReadResponse,
        MessageBody, MessagePayload, ParticipantSummary, SendMessageRequest, UploadResponse,
    },
};
use storage::{Storage, StoredAttachment, StoredMessage};
use tracing::{debug, info};

pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
pub const MAX_FILENAME_BYTES: usize = 180;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let conversations = ctx
        .storage
        .list_conversations_for_user(user_id)
        .await
        .map_err(internal)?;

    let mut summaries = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let participants = ctx
            .storage
            .list_participants(conversation.conversation_id)
            .await
            .map_err(internal)?
            .into_iter()
            .map(|participant| ParticipantSummary {
                user_id: participant.user_id,
                display_name: participant.display_name,
                role: participant.role,
            })
            .collect();
        let last_message_preview = ctx
            .storage
            .last_visible_message(conversation.conversation_id, user_id)
            .await
            .map_err(internal)?
            .map(|message| message_payload(message).map(|payload| payload.body.preview()))
            .transpose()?;
        let unread_count = ctx
            .storage
            .unread_count(conversation.conversation_id, user_id)
            .await
            .map_err(internal)?;

        summaries.push(ConversationSummary {
            conversation_id: conversation.conversation_id,
            kind: conversation.kind,
            name: conversation.name,
            participants,
            updated_at: conversation.updated_at,
            last_message_preview,
            unread_count,
        });
    }
    Ok(summaries)
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    limit: u32,
    before: Option<MessageId>,
) -> Result<Vec<MessagePayload>, ApiError> {
    ensure_participant(ctx, conversation_id, user_id).await?;
    let messages = ctx
        .storage
        .list_conversation_messages(
            conversation_id,
            user_id,
            limit.clamp(1, MAX_PAGE_SIZE),
            before,
        )
        .await
        .map_err(internal)?;
    messages.into_iter().map(message_payload).collect()
}

pub async fn send_message(
    ctx: &ApiContext,
    req: &SendMessageRequest,
) -> Result<MessagePayload, ApiError> {
    ensure_participant(ctx, req.conversation_id, req.user_id).await?;
    let body = MessageBody::compose(req.kind, req.content.clone(), req.attachments.clone())?;

    let attachments: Vec<StoredAttachment> = body
        .attachments()
        .iter()
        .map(|attachment| StoredAttachment {
            file_name: attachment.file_name.clone(),
            url: attachment.url.clone(),
            size_bytes: attachment.size_bytes,
            mime_type: attachment.mime_type.clone(),
            duration_ms: attachment.duration_ms,
        })
        .collect();

    let stored = ctx
        .storage
        .insert_message(
            req.conversation_id,
            req.user_id,
            body.kind(),
            body.content(),
            &attachments,
        )
        .await
        .map_err(internal)?;
    debug!(
        conversation_id = req.conversation_id.0,
        message_id = stored.message_id.0,
        kind = body.kind().as_str(),
        "chat: message persisted"
    );
    message_payload(stored)
}

pub async fn mark_conversation_read(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<MarkReadResponse, ApiError> {
    ensure_participant(ctx, conversation_id, user_id).await?;
    let message_ids = ctx
        .storage
        .mark_conversation_read(conversation_id, user_id)
        .await
        .map_err(internal)?;
    Ok(MarkReadResponse {
        conversation_id,
        message_ids,
    })
}

/// Applies a delete request. Only the original sender may delete for
/// everyone; deleting an existing tombstone again is a no-op.
pub async fn delete_message(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    scope: DeleteScope,
) -> Result<DeleteMessageResponse, ApiError> {
    let message = load_message(ctx, message_id).await?;
    ensure_participant(ctx, message.conversation_id, user_id).await?;

    match scope {
        DeleteScope::Me => {
            ctx.storage
                .hide_message_for_user(message_id, user_id)
                .await
                .map_err(internal)?;
        }
        DeleteScope::All => {
            if message.sender_id != user_id {
                return Err(ApiError::new(
                    ErrorCode::Forbidden,
                    "only the sender can delete a message for everyone",
                ));
            }
            let changed = ctx
                .storage
                .tombstone_message(message_id, user_id)
                .await
                .map_err(internal)?;
            if changed {
                info!(
                    conversation_id = message.conversation_id.0,
                    message_id = message_id.0,
                    deleted_by = user_id.0,
                    "chat: message deleted for everyone"
                );
            }
        }
    }

    Ok(DeleteMessageResponse {
        message_id,
        conversation_id: message.conversation_id,
        scope,
    })
}

/// Checks that a relayed deletion announcement matches persisted state.
pub async fn verify_deleted_for_all(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    message_id: MessageId,
    deleted_by: UserId,
) -> Result<(), ApiError> {
    let message = load_message(ctx, message_id).await?;
    if message.conversation_id != conversation_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message does not belong to conversation",
        ));
    }
    if message.kind != MessageKind::Deleted || message.deleted_by != Some(deleted_by) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "message was not deleted for everyone by this user",
        ));
    }
    Ok(())
}

pub async fn store_upload(
    ctx: &ApiContext,
    user_id: UserId,
    filename: Option<&str>,
    mime_type: Option<&str>,
    bytes: &[u8],
) -> Result<UploadResponse, ApiError> {
    if bytes.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "upload body cannot be empty",
        ));
    }
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(ApiError::new(
            ErrorCode::PayloadTooLarge,
            format!("upload exceeds {MAX_UPLOAD_BYTES} bytes"),
        ));
    }

    let filename = filename
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("upload.bin");
    if filename.len() > MAX_FILENAME_BYTES {
        return Err(ApiError::new(ErrorCode::Validation, "filename is too long"));
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "filename must not contain path separators",
        ));
    }
    let mime_type = mime_type
        .map(str::trim)
        .filter(|mime| !mime.is_empty())
        .unwrap_or("application/octet-stream");

    ctx.storage
        .display_name_for_user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "unknown user"))?;

    let stored = ctx
        .storage
        .store_file(user_id, filename, mime_type, bytes)
        .await
        .map_err(internal)?;
    Ok(UploadResponse {
        file_id: stored.file_id,
        url: format!("/files/{}", stored.file_id.0),
        name: stored.file_name,
        size: stored.size_bytes,
        mime_type: stored.mime_type,
    })
}

pub async fn ensure_participant(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<ParticipantRole, ApiError> {
    ctx.storage
        .participant_role(conversation_id, user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Forbidden, "user is not a participant"))
}

pub fn message_payload(message: StoredMessage) -> Result<MessagePayload, ApiError> {
    let body = match message.kind {
        MessageKind::Deleted => MessageBody::Deleted,
        kind => {
            let attachments = message
                .attachments
                .into_iter()
                .map(|attachment| AttachmentPayload {
                    file_name: attachment.file_name,
                    url: attachment.url,
                    size_bytes: attachment.size_bytes,
                    mime_type: attachment.mime_type,
                    duration_ms: attachment.duration_ms,
                })
                .collect();
            MessageBody::compose(Some(kind), message.content, attachments).map_err(|err| {
                ApiError::new(
                    ErrorCode::Internal,
                    format!("stored message {} is malformed: {}", message.message_id, err.message),
                )
            })?
        }
    };

    Ok(MessagePayload {
        message_id: message.message_id,
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        sender_name: message.sender_name,
        body,
        created_at: message.created_at,
        read_by: message.read_by,
    })
}

async fn load_message(ctx: &ApiContext, message_id: MessageId) -> Result<StoredMessage, ApiError> {
    ctx.storage
        .load_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
