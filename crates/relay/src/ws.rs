use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use server_api::{ensure_participant, verify_deleted_for_all};
use shared::{
    domain::{ConversationId, Identity},
    error::{ApiError, ErrorCode},
    protocol::{ClientCommand, RelayEvent},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::{app_state::AppState, rooms::ConnectionId};

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let connection_id = state.rooms.register(outbound_tx).await;

    let send_task = tokio::spawn(async move {
        let mut outbound = UnboundedReceiverStream::new(outbound_rx);
        while let Some(event) = outbound.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(err) => {
                    warn!(%err, event = event.name(), "relay: failed to encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => handle_command(&state, connection_id, command).await,
                Err(err) => {
                    debug!(connection_id, %err, "relay: rejected malformed frame");
                    reply_error(
                        &state,
                        connection_id,
                        ApiError::new(ErrorCode::Validation, "malformed command frame"),
                    )
                    .await;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.rooms.disconnect(connection_id).await;
    send_task.abort();
}

pub(crate) async fn handle_command(
    state: &AppState,
    connection_id: ConnectionId,
    command: ClientCommand,
) {
    if let ClientCommand::Authenticate {
        user_id,
        name,
        role,
    } = command
    {
        state
            .rooms
            .authenticate(
                connection_id,
                Identity {
                    user_id,
                    display_name: name,
                    role,
                },
            )
            .await;
        state
            .rooms
            .send_to(
                connection_id,
                RelayEvent::Authenticated {
                    user_id,
                    connection_id,
                },
            )
            .await;
        return;
    }

    let Some(identity) = state.rooms.identity(connection_id).await else {
        reply_error(
            state,
            connection_id,
            ApiError::new(ErrorCode::Unauthorized, "authenticate before sending commands"),
        )
        .await;
        return;
    };

    match command {
        ClientCommand::Authenticate { .. } => {}
        ClientCommand::JoinConversation { conversation_id } => {
            if let Err(err) = ensure_participant(&state.api, conversation_id, identity.user_id).await
            {
                warn!(
                    connection_id,
                    user_id = identity.user_id.0,
                    conversation_id = conversation_id.0,
                    "relay: join refused"
                );
                reply_error(state, connection_id, err).await;
                return;
            }
            state.rooms.join(connection_id, conversation_id).await;
        }
        ClientCommand::LeaveConversation { conversation_id } => {
            state.rooms.leave(connection_id, conversation_id).await;
        }
        ClientCommand::TypingStart {
            conversation_id, ..
        } => relay_typing(state, connection_id, &identity, conversation_id, true).await,
        ClientCommand::TypingStop {
            conversation_id, ..
        } => relay_typing(state, connection_id, &identity, conversation_id, false).await,
        ClientCommand::GetOnlineUsers => {
            let user_ids = state.rooms.online_users().await;
            state
                .rooms
                .send_to(connection_id, RelayEvent::OnlineUsers { user_ids })
                .await;
        }
        ClientCommand::AckMessageDeleted {
            conversation_id,
            message_id,
            deleted_by,
        } => {
            if deleted_by != identity.user_id {
                reply_error(
                    state,
                    connection_id,
                    ApiError::new(ErrorCode::Forbidden, "deletions are announced by their author"),
                )
                .await;
                return;
            }
            if let Err(err) =
                verify_deleted_for_all(&state.api, conversation_id, message_id, deleted_by).await
            {
                warn!(
                    connection_id,
                    message_id = message_id.0,
                    code = ?err.code,
                    "relay: deletion ack rejected"
                );
                reply_error(state, connection_id, err).await;
                return;
            }
            state
                .rooms
                .broadcast(
                    conversation_id,
                    RelayEvent::MessageDeleted {
                        message_id,
                        conversation_id,
                        deleted_by,
                    },
                    Some(connection_id),
                )
                .await;
        }
    }
}

/// The typing user is always the connection's identity, whatever the frame claims.
async fn relay_typing(
    state: &AppState,
    connection_id: ConnectionId,
    identity: &Identity,
    conversation_id: ConversationId,
    is_typing: bool,
) {
    if !state.rooms.is_member(connection_id, conversation_id).await {
        reply_error(
            state,
            connection_id,
            ApiError::new(ErrorCode::Forbidden, "join the conversation first"),
        )
        .await;
        return;
    }
    state
        .rooms
        .broadcast(
            conversation_id,
            RelayEvent::UserTyping {
                conversation_id,
                user_id: identity.user_id,
                is_typing,
            },
            Some(connection_id),
        )
        .await;
}

async fn reply_error(state: &AppState, connection_id: ConnectionId, error: ApiError) {
    state
        .rooms
        .send_to(connection_id, RelayEvent::Error(error))
        .await;
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
