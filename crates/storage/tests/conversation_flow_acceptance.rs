use shared::domain::{ConversationKind, MessageKind, ParticipantRole};
use storage::Storage;

#[tokio::test]
async fn group_conversation_read_and_delete_flow_acceptance() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");

    let hr = storage.create_user("flow-hr", "hr").await.expect("hr");
    let dev = storage.create_user("flow-dev", "employee").await.expect("dev");
    let ops = storage.create_user("flow-ops", "employee").await.expect("ops");
    let conversation = storage
        .create_conversation(
            ConversationKind::Group,
            Some("payroll"),
            &[
                (hr, ParticipantRole::Owner),
                (dev, ParticipantRole::Member),
                (ops, ParticipantRole::Member),
            ],
        )
        .await
        .expect("conversation");

    let message = storage
        .insert_message(conversation, hr, MessageKind::Text, "payslips are out", &[])
        .await
        .expect("message");

    storage
        .mark_conversation_read(conversation, dev)
        .await
        .expect("dev reads");
    storage
        .mark_conversation_read(conversation, ops)
        .await
        .expect("ops reads");

    let reloaded = storage
        .load_message(message.message_id)
        .await
        .expect("load")
        .expect("exists");
    assert!(reloaded.read_by.contains(&dev));
    assert!(reloaded.read_by.contains(&ops));

    assert!(storage
        .tombstone_message(message.message_id, hr)
        .await
        .expect("tombstone"));
    let preview = storage
        .last_visible_message(conversation, dev)
        .await
        .expect("last")
        .expect("tombstone still listed");
    assert_eq!(preview.kind, MessageKind::Deleted);
    assert_eq!(
        storage
            .list_participants(conversation)
            .await
            .expect("participants")
            .len(),
        3
    );
}
