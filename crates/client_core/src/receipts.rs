use std::collections::{BTreeSet, HashMap};

use shared::{
    domain::{ConversationId, UserId},
    protocol::{ConversationSummary, MessagePayload},
};

/// Per-conversation unread counters for the local user.
///
/// Counters move on exactly two paths: an inbound message for a conversation
/// that is not active (+1), and activation or mark-all-read (reset to 0).
/// [`ReadReceiptAggregator::seed`] only loads the server's view at start-up.
#[derive(Debug)]
pub struct ReadReceiptAggregator {
    me: UserId,
    unread: HashMap<ConversationId, u32>,
    active: Option<ConversationId>,
}

impl ReadReceiptAggregator {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            unread: HashMap::new(),
            active: None,
        }
    }

    pub fn seed(&mut self, conversations: &[ConversationSummary]) {
        for conversation in conversations {
            let count = if self.active == Some(conversation.conversation_id) {
                0
            } else {
                conversation.unread_count
            };
            self.unread.insert(conversation.conversation_id, count);
        }
    }

    /// Returns the new counter when the message bumped it.
    pub fn on_inbound(&mut self, message: &MessagePayload) -> Option<u32> {
        if message.sender_id == self.me
            || self.active == Some(message.conversation_id)
            || message.body.is_deleted()
        {
            return None;
        }
        let count = self.unread.entry(message.conversation_id).or_insert(0);
        *count = count.saturating_add(1);
        Some(*count)
    }

    pub fn activate(&mut self, conversation_id: ConversationId) {
        self.active = Some(conversation_id);
        self.unread.insert(conversation_id, 0);
    }

    pub fn deactivate(&mut self) {
        self.active = None;
    }

    pub fn mark_all_read(&mut self, conversation_id: ConversationId) {
        self.unread.insert(conversation_id, 0);
    }

    pub fn active(&self) -> Option<ConversationId> {
        self.active
    }

    pub fn unread(&self, conversation_id: ConversationId) -> u32 {
        self.unread.get(&conversation_id).copied().unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        self.unread
            .values()
            .fold(0u32, |total, count| total.saturating_add(*count))
    }
}

/// A message counts as read by all when every participant other than its
/// sender appears in its read set.
pub fn is_read_by_all(sender_id: UserId, read_by: &BTreeSet<UserId>, participants: &[UserId]) -> bool {
    participants
        .iter()
        .filter(|participant| **participant != sender_id)
        .all(|participant| read_by.contains(participant))
}

#[cfg(test)]
#[path = "tests/receipts_tests.rs"]
mod tests;
