use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{
    delete_message, list_conversations, list_messages, mark_conversation_read, send_message,
    store_upload, MAX_PAGE_SIZE, MAX_UPLOAD_BYTES,
};
use shared::{
    domain::{ConversationId, DeleteScope, FileId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ConversationSummary, DeleteMessageRequest, DeleteMessageResponse, MarkReadRequest,
        MarkReadResponse, MessagePayload, RelayEvent, SendMessageRequest, UploadResponse,
    },
};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::{app_state::AppState, ws::ws_handler};

/// Slack on top of the upload limit so the handler, not the body layer,
/// reports oversize files.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

type HttpResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    user_id: i64,
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileUploadQuery {
    user_id: i64,
    filename: Option<String>,
    mime_type: Option<String>,
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/conversations", get(http_list_conversations))
        .route(
            "/conversations/:conversation_id/messages",
            get(http_list_messages),
        )
        .route(
            "/conversations/:conversation_id/read",
            patch(http_mark_read),
        )
        .route("/messages", post(http_send_message))
        .route("/messages/:message_id", delete(http_delete_message))
        .route("/files/upload", post(upload_file))
        .route("/files/:file_id", get(download_file))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES + BODY_LIMIT_SLACK))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> HttpResult<&'static str> {
    state.api.storage.health_check().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    })?;
    Ok("ok")
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> HttpResult<Json<Vec<ConversationSummary>>> {
    let conversations = list_conversations(&state.api, UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(conversations))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> HttpResult<Json<Vec<MessagePayload>>> {
    let messages = list_messages(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
        q.limit.unwrap_or(MAX_PAGE_SIZE),
        q.before.map(MessageId),
    )
    .await
    .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> HttpResult<Json<MessagePayload>> {
    let message = send_message(&state.api, &req).await.map_err(reject)?;
    let delivered = state
        .rooms
        .broadcast(
            message.conversation_id,
            RelayEvent::NewMessage {
                message: message.clone(),
            },
            req.origin_connection,
        )
        .await;
    debug!(
        conversation_id = message.conversation_id.0,
        message_id = message.message_id.0,
        delivered,
        "chat: new message fanned out"
    );
    Ok(Json(message))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Json(req): Json<MarkReadRequest>,
) -> HttpResult<Json<MarkReadResponse>> {
    let receipt = mark_conversation_read(&state.api, req.user_id, ConversationId(conversation_id))
        .await
        .map_err(reject)?;
    if !receipt.message_ids.is_empty() {
        state
            .rooms
            .broadcast(
                receipt.conversation_id,
                RelayEvent::ReadReceipt {
                    conversation_id: receipt.conversation_id,
                    message_ids: receipt.message_ids.clone(),
                    reader_id: req.user_id,
                },
                None,
            )
            .await;
    }
    Ok(Json(receipt))
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<DeleteMessageRequest>,
) -> HttpResult<Json<DeleteMessageResponse>> {
    let deleted = delete_message(&state.api, req.user_id, MessageId(message_id), req.scope)
        .await
        .map_err(reject)?;
    if deleted.scope == DeleteScope::Me {
        state
            .rooms
            .send_to_user(
                req.user_id,
                RelayEvent::MessageDeletedForMe {
                    message_id: deleted.message_id,
                    conversation_id: deleted.conversation_id,
                },
                None,
            )
            .await;
    }
    Ok(Json(deleted))
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FileUploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResult<Json<UploadResponse>> {
    let header_mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let mime_type = q.mime_type.as_deref().or(header_mime);

    let mut upload = store_upload(
        &state.api,
        UserId(q.user_id),
        q.filename.as_deref(),
        mime_type,
        &body,
    )
    .await
    .map_err(reject)?;
    upload.url = state.public_link(&upload.url);
    info!(
        file_id = upload.file_id.0,
        size = upload.size,
        mime_type = %upload.mime_type,
        "chat: file stored"
    );
    Ok(Json(upload))
}

async fn download_file(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let file = state
        .api
        .storage
        .load_file(FileId(file_id))
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?
        .ok_or_else(|| reject(ApiError::new(ErrorCode::NotFound, "file not found")))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&file.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("inline; filename=\"{}\"", file.file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok((StatusCode::OK, headers, file.bytes))
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
