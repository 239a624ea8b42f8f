use std::collections::BTreeSet;

use super::*;
use chrono::Utc;
use shared::protocol::{MessageBody, MessagePayload};

fn timeline_with(message_id: i64, sender: i64) -> Timeline {
    let mut timeline = Timeline::new(ConversationId(1));
    timeline
        .apply_incoming(MessagePayload {
            message_id: MessageId(message_id),
            conversation_id: ConversationId(1),
            sender_id: UserId(sender),
            sender_name: None,
            body: MessageBody::text("secret").expect("body"),
            created_at: Utc::now(),
            read_by: BTreeSet::new(),
        })
        .expect("incoming");
    timeline
}

#[test]
fn only_own_messages_offer_delete_for_everyone() {
    let timeline = timeline_with(1, 7);
    let entry = &timeline.entries()[0];
    assert_eq!(
        available_scopes(entry, UserId(7)),
        vec![DeleteScope::Me, DeleteScope::All]
    );
    assert_eq!(available_scopes(entry, UserId(8)), vec![DeleteScope::Me]);
}

#[test]
fn tombstoned_rows_offer_nothing() {
    let mut timeline = timeline_with(1, 7);
    timeline.mark_deleted(MessageId(1));
    assert!(available_scopes(&timeline.entries()[0], UserId(7)).is_empty());
}

#[test]
fn relay_deletion_event_tombstones_row() {
    let mut timeline = timeline_with(1, 7);
    let effect = DeletionEffect::from_event(&RelayEvent::MessageDeleted {
        message_id: MessageId(1),
        conversation_id: ConversationId(1),
        deleted_by: UserId(7),
    })
    .expect("effect");
    assert!(effect.apply(&mut timeline));
    let entry = timeline.get(MessageId(1)).expect("entry");
    assert_eq!(entry.body, MessageBody::Deleted);
    assert_eq!(entry.body.preview(), "This message was deleted");
}

#[test]
fn delete_for_me_removes_row_and_skips_other_timelines() {
    let mut timeline = timeline_with(1, 7);
    let elsewhere = DeletionEffect::Remove {
        conversation_id: ConversationId(2),
        message_id: MessageId(1),
    };
    assert!(!elsewhere.apply(&mut timeline));

    let response = DeleteMessageResponse {
        message_id: MessageId(1),
        conversation_id: ConversationId(1),
        scope: DeleteScope::Me,
    };
    assert!(DeletionEffect::from_response(&response).apply(&mut timeline));
    assert!(timeline.entries().is_empty());
    assert_eq!(announcement(&response, UserId(7)), None);
}

#[test]
fn delete_for_everyone_owes_an_ack() {
    let response = DeleteMessageResponse {
        message_id: MessageId(3),
        conversation_id: ConversationId(1),
        scope: DeleteScope::All,
    };
    assert_eq!(
        announcement(&response, UserId(7)),
        Some(ClientCommand::AckMessageDeleted {
            conversation_id: ConversationId(1),
            message_id: MessageId(3),
            deleted_by: UserId(7),
        })
    );
}
