use shared::{
    domain::{ConversationId, DeleteScope, MessageId, UserId},
    protocol::{ClientCommand, DeleteMessageResponse, RelayEvent},
};

use crate::timeline::{Timeline, TimelineEntry};

/// What a deletion does to the local view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionEffect {
    /// Row stays, body becomes `DELETED`.
    Tombstone {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    /// Row disappears for this user only.
    Remove {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
}

impl DeletionEffect {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            DeletionEffect::Tombstone {
                conversation_id, ..
            }
            | DeletionEffect::Remove {
                conversation_id, ..
            } => *conversation_id,
        }
    }

    pub fn from_response(response: &DeleteMessageResponse) -> Self {
        match response.scope {
            DeleteScope::Me => DeletionEffect::Remove {
                conversation_id: response.conversation_id,
                message_id: response.message_id,
            },
            DeleteScope::All => DeletionEffect::Tombstone {
                conversation_id: response.conversation_id,
                message_id: response.message_id,
            },
        }
    }

    pub fn from_event(event: &RelayEvent) -> Option<Self> {
        match event {
            RelayEvent::MessageDeleted {
                message_id,
                conversation_id,
                ..
            } => Some(DeletionEffect::Tombstone {
                conversation_id: *conversation_id,
                message_id: *message_id,
            }),
            RelayEvent::MessageDeletedForMe {
                message_id,
                conversation_id,
            } => Some(DeletionEffect::Remove {
                conversation_id: *conversation_id,
                message_id: *message_id,
            }),
            _ => None,
        }
    }

    /// Applies to `timeline` if it shows the affected conversation.
    pub fn apply(&self, timeline: &mut Timeline) -> bool {
        if timeline.conversation_id() != self.conversation_id() {
            return false;
        }
        match *self {
            DeletionEffect::Tombstone { message_id, .. } => timeline.mark_deleted(message_id),
            DeletionEffect::Remove { message_id, .. } => timeline.remove(message_id),
        }
    }
}

/// Scopes the UI may offer for a row. Authorization is enforced upstream;
/// this only decides which buttons to draw.
pub fn available_scopes(entry: &TimelineEntry, me: UserId) -> Vec<DeleteScope> {
    if entry.is_pending() || entry.body.is_deleted() {
        return Vec::new();
    }
    if entry.sender_id == me {
        vec![DeleteScope::Me, DeleteScope::All]
    } else {
        vec![DeleteScope::Me]
    }
}

/// Relay announcement owed after a confirmed delete-for-everyone.
pub fn announcement(response: &DeleteMessageResponse, me: UserId) -> Option<ClientCommand> {
    match response.scope {
        DeleteScope::All => Some(ClientCommand::AckMessageDeleted {
            conversation_id: response.conversation_id,
            message_id: response.message_id,
            deleted_by: me,
        }),
        DeleteScope::Me => None,
    }
}

#[cfg(test)]
#[path = "tests/deletion_tests.rs"]
mod tests;
