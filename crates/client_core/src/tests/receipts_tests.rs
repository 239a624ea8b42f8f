use super::*;
use chrono::Utc;
use shared::{
    domain::{ConversationKind, MessageId},
    protocol::MessageBody,
};

const ME: UserId = UserId(1);

fn message(conversation: i64, sender: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(100),
        conversation_id: ConversationId(conversation),
        sender_id: UserId(sender),
        sender_name: None,
        body: MessageBody::text("hi").expect("body"),
        created_at: Utc::now(),
        read_by: BTreeSet::new(),
    }
}

fn summary(conversation: i64, unread_count: u32) -> ConversationSummary {
    ConversationSummary {
        conversation_id: ConversationId(conversation),
        kind: ConversationKind::Group,
        name: None,
        participants: Vec::new(),
        updated_at: Utc::now(),
        last_message_preview: None,
        unread_count,
    }
}

#[test]
fn inbound_message_for_inactive_conversation_counts_once() {
    let mut receipts = ReadReceiptAggregator::new(ME);
    assert_eq!(receipts.on_inbound(&message(5, 2)), Some(1));
    assert_eq!(receipts.unread(ConversationId(5)), 1);
}

#[test]
fn own_messages_and_active_conversation_never_count() {
    let mut receipts = ReadReceiptAggregator::new(ME);
    assert_eq!(receipts.on_inbound(&message(5, 1)), None);

    receipts.activate(ConversationId(6));
    assert_eq!(receipts.on_inbound(&message(6, 2)), None);
    assert_eq!(receipts.unread(ConversationId(6)), 0);
    assert_eq!(receipts.unread(ConversationId(5)), 0);
}

#[test]
fn activation_and_mark_all_reset_to_zero() {
    let mut receipts = ReadReceiptAggregator::new(ME);
    receipts.seed(&[summary(1, 4), summary(2, 2)]);
    assert_eq!(receipts.total_unread(), 6);

    receipts.activate(ConversationId(1));
    assert_eq!(receipts.unread(ConversationId(1)), 0);

    receipts.mark_all_read(ConversationId(2));
    assert_eq!(receipts.unread(ConversationId(2)), 0);
    assert_eq!(receipts.total_unread(), 0);

    receipts.deactivate();
    assert_eq!(receipts.on_inbound(&message(1, 3)), Some(1));
}

#[test]
fn seed_keeps_active_conversation_at_zero() {
    let mut receipts = ReadReceiptAggregator::new(ME);
    receipts.activate(ConversationId(3));
    receipts.seed(&[summary(3, 9)]);
    assert_eq!(receipts.unread(ConversationId(3)), 0);
    assert_eq!(receipts.active(), Some(ConversationId(3)));
}

#[test]
fn read_by_all_ignores_the_sender() {
    let participants = [UserId(1), UserId(2), UserId(3)];
    let mut read_by = BTreeSet::new();
    read_by.insert(UserId(2));
    assert!(!is_read_by_all(UserId(1), &read_by, &participants));
    read_by.insert(UserId(3));
    assert!(is_read_by_all(UserId(1), &read_by, &participants));
}
